//! Outbound data structures
//! These are the plain values the simulation hands to the lobby/transport layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable robot identifier for the lifetime of a match
pub type RobotId = Uuid;

/// What caused a robot to take damage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageCause {
    Missile,
    Collision,
    SelfDestruct,
    Disconnect,
}

/// Missile launched this tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireEvent {
    pub x: f32,
    pub y: f32,
    /// Launch heading in degrees
    pub direction: f32,
    pub owner_id: RobotId,
}

/// Damage registered on a robot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitEvent {
    pub x: f32,
    pub y: f32,
    pub target_id: RobotId,
}

/// Robot transitioned to destroyed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestructionEvent {
    pub x: f32,
    pub y: f32,
    pub target_id: RobotId,
    pub cause: DamageCause,
}

/// Visual explosion (missile impact or self-destruct)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplosionEvent {
    pub x: f32,
    pub y: f32,
    pub size: f32,
}

/// Transient per-tick event buffer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickEvents {
    pub fires: Vec<FireEvent>,
    pub hits: Vec<HitEvent>,
    pub destructions: Vec<DestructionEvent>,
    pub explosions: Vec<ExplosionEvent>,
}

impl TickEvents {
    pub fn is_empty(&self) -> bool {
        self.fires.is_empty()
            && self.hits.is_empty()
            && self.destructions.is_empty()
            && self.explosions.is_empty()
    }

    pub fn clear(&mut self) {
        self.fires.clear();
        self.hits.clear();
        self.destructions.clear();
        self.explosions.clear();
    }
}

/// Robot state in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotSnapshot {
    pub id: RobotId,
    pub name: String,
    pub x: f32,
    pub y: f32,
    /// Heading in degrees
    pub direction: f32,
    /// Damage (0-100)
    pub damage: f32,
    pub alive: bool,
    /// Opaque cosmetic descriptor supplied at construction
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub cosmetic: serde_json::Value,
}

/// Missile state in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissileSnapshot {
    pub id: Uuid,
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub direction: f32,
    pub owner_id: RobotId,
}

/// World state emitted once per tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub match_id: Uuid,
    /// Simulation tick number
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub robots: Vec<RobotSnapshot>,
    pub missiles: Vec<MissileSnapshot>,
    /// Events that occurred since the previous snapshot
    pub events: TickEvents,
}

/// Phase in which a script failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptErrorKind {
    Init,
    Runtime,
}

/// Message destined for a single robot's owner, never broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobotMessage {
    /// Script failed to compile or run
    CodeError {
        robot_id: RobotId,
        kind: ScriptErrorKind,
        message: String,
    },

    /// Line written by the script's log sink
    Log { robot_id: RobotId, message: String },
}

impl RobotMessage {
    /// Owner routing key
    pub fn robot_id(&self) -> RobotId {
        match self {
            Self::CodeError { robot_id, .. } | Self::Log { robot_id, .. } => *robot_id,
        }
    }
}

/// Why a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LastStanding,
    MutualDestruction,
    Disconnect,
    InternalError,
}

/// Per-robot statistics reported at match end
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotMatchStats {
    pub robot_id: RobotId,
    pub name: String,
    pub shots_fired: u32,
    pub shots_hit: u32,
    pub damage_dealt: f32,
    pub damage_taken: f32,
    /// Tick at which the robot was destroyed, if it was
    pub destroyed_at_tick: Option<u64>,
}

/// Terminal payload delivered through the match-over callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchOver {
    pub match_id: Uuid,
    pub winner_id: Option<RobotId>,
    /// Winner display name, or "None"
    pub winner_name: String,
    pub reason: EndReason,
    /// Last simulated tick
    pub tick: u64,
    /// Events recorded since the last snapshot (empty after an internal error)
    pub final_events: TickEvents,
    pub robots: Vec<RobotMatchStats>,
}
