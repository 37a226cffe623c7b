//! Robot entity state

use crate::protocol::{DamageCause, FireEvent, RobotId, RobotSnapshot};

use super::combat::{CombatSystem, Missile, WeaponStats, MISSILE_SPAWN_GAP};
use super::physics::{PhysicsSystem, MAX_ROBOT_SPEED};
use super::targeting::Contact;

/// Collision radius shared by every robot
pub const ROBOT_RADIUS: f32 = 15.0;

/// Damage at which a robot is destroyed
pub const MAX_DAMAGE: f32 = 100.0;

/// Robot lifecycle, one-way
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotStatus {
    Active,
    Destroyed,
}

/// Outcome of a damage application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageOutcome {
    /// Damage was actually applied
    pub hit: bool,
    /// This application destroyed the robot
    pub destroyed: bool,
}

/// Running combat tallies for the match-over report
#[derive(Debug, Clone, Default)]
pub struct RobotStats {
    pub shots_fired: u32,
    pub shots_hit: u32,
    pub damage_dealt: f32,
    pub damage_taken: f32,
    pub destroyed_at_tick: Option<u64>,
}

/// Authoritative robot state
#[derive(Debug, Clone)]
pub struct Robot {
    pub id: RobotId,
    pub name: String,
    pub cosmetic: serde_json::Value,

    // Position and movement
    pub x: f32,
    pub y: f32,
    /// Heading in degrees (0 = east, 90 = north)
    pub direction: f32,
    pub speed: f32,
    target_speed: f32,
    target_direction: f32,

    // Combat
    damage: f32,
    /// Ticks until the robot may fire again
    pub cooldown: u32,
    pub radius: f32,
    status: RobotStatus,
    last_damage_cause: Option<DamageCause>,

    /// Missiles fired by this robot that are still in flight
    pub missiles: Vec<Missile>,

    pub stats: RobotStats,
}

impl Robot {
    pub fn new(
        id: RobotId,
        name: String,
        cosmetic: serde_json::Value,
        x: f32,
        y: f32,
        direction: f32,
    ) -> Self {
        let direction = PhysicsSystem::normalize_heading(direction);
        Self {
            id,
            name,
            cosmetic,
            x,
            y,
            direction,
            speed: 0.0,
            target_speed: 0.0,
            target_direction: direction,
            damage: 0.0,
            cooldown: 0,
            radius: ROBOT_RADIUS,
            status: RobotStatus::Active,
            last_damage_cause: None,
            missiles: Vec::new(),
            stats: RobotStats::default(),
        }
    }

    pub fn damage(&self) -> f32 {
        self.damage
    }

    pub fn status(&self) -> RobotStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == RobotStatus::Active
    }

    pub fn last_damage_cause(&self) -> Option<DamageCause> {
        self.last_damage_cause
    }

    pub fn target_speed(&self) -> f32 {
        self.target_speed
    }

    pub fn target_direction(&self) -> f32 {
        self.target_direction
    }

    /// Command heading and speed for the next integration.
    /// NaN inputs fall back to 0, speed is clamped to the allowed range.
    pub fn drive(&mut self, direction: f32, speed: f32) {
        if !self.is_active() {
            return;
        }

        self.target_direction = if direction.is_finite() {
            PhysicsSystem::normalize_heading(direction)
        } else {
            0.0
        };
        self.target_speed = if speed.is_nan() {
            0.0
        } else {
            speed.clamp(-MAX_ROBOT_SPEED, MAX_ROBOT_SPEED)
        };
    }

    /// Attempt to launch a missile. Fails while cooling down, when destroyed,
    /// or for a non-finite direction.
    pub fn fire(&mut self, direction: f32, power: f32) -> Option<FireEvent> {
        if !self.is_active() || !CombatSystem::can_fire(self.cooldown) || !direction.is_finite() {
            return None;
        }

        let power = CombatSystem::sanitize_power(Some(power));
        let direction = PhysicsSystem::normalize_heading(direction);
        self.cooldown = WeaponStats::for_power(power).cooldown_ticks;

        // Spawn just outside the hull
        let offset = self.radius + MISSILE_SPAWN_GAP;
        let (dx, dy) = PhysicsSystem::displacement(direction, offset, 1.0, 1.0);
        let missile = Missile::new(self.id, self.x + dx, self.y + dy, direction, power);

        let event = FireEvent {
            x: missile.x,
            y: missile.y,
            direction,
            owner_id: self.id,
        };
        self.missiles.push(missile);
        self.stats.shots_fired += 1;

        Some(event)
    }

    /// Apply damage. Destroyed robots and non-positive amounts are ignored.
    pub fn take_damage(&mut self, amount: f32, cause: DamageCause) -> DamageOutcome {
        if !self.is_active() || amount.is_nan() || amount <= 0.0 {
            return DamageOutcome {
                hit: false,
                destroyed: false,
            };
        }

        let (damage, destroyed) = CombatSystem::apply_damage(self.damage, amount);
        self.stats.damage_taken += damage - self.damage;
        self.damage = damage;
        self.last_damage_cause = Some(cause);

        if destroyed {
            self.status = RobotStatus::Destroyed;
            self.speed = 0.0;
            self.target_speed = 0.0;
        }

        DamageOutcome {
            hit: true,
            destroyed,
        }
    }

    /// Copy of the robot handed to a script turn, without in-flight missiles
    pub fn script_view(&self) -> Robot {
        Robot {
            missiles: Vec::new(),
            cosmetic: serde_json::Value::Null,
            ..self.clone()
        }
    }

    /// Commit the commands a successful script turn issued against its view
    pub fn apply_turn(&mut self, turn: Robot) {
        if !self.is_active() {
            return;
        }
        self.target_direction = turn.target_direction;
        self.target_speed = turn.target_speed;
        self.cooldown = turn.cooldown;
        self.stats.shots_fired = self.stats.shots_fired.max(turn.stats.shots_fired);
        self.missiles.extend(turn.missiles);
    }

    pub fn contact(&self) -> Contact {
        Contact {
            id: self.id,
            name: self.name.clone(),
            x: self.x,
            y: self.y,
        }
    }

    pub fn snapshot(&self) -> RobotSnapshot {
        RobotSnapshot {
            id: self.id,
            name: self.name.clone(),
            x: self.x,
            y: self.y,
            direction: self.direction,
            damage: self.damage,
            alive: self.is_active(),
            cosmetic: self.cosmetic.clone(),
        }
    }
}
