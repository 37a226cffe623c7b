//! Snapshot building

use chrono::Utc;
use uuid::Uuid;

use crate::protocol::{MatchSnapshot, MissileSnapshot, RobotSnapshot, TickEvents};

use super::robot::Robot;

/// Builds per-tick world snapshots
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    /// Tick of the last snapshot built, snapshots must strictly increase
    last_tick: Option<u64>,
    /// Snapshot counters for debugging
    stats: SnapshotStats,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot of every robot and in-flight missile plus the events
    /// recorded since the previous snapshot. Returns `None` for a stale tick.
    pub fn build(
        &mut self,
        match_id: Uuid,
        tick: u64,
        robots: &[Robot],
        events: &TickEvents,
    ) -> Option<MatchSnapshot> {
        if self.last_tick.is_some_and(|last| tick <= last) {
            return None;
        }
        self.last_tick = Some(tick);

        let robot_snapshots: Vec<RobotSnapshot> = robots.iter().map(Robot::snapshot).collect();
        let missiles: Vec<MissileSnapshot> = robots
            .iter()
            .flat_map(|r| r.missiles.iter().map(|m| m.snapshot()))
            .collect();

        self.stats.record(robot_snapshots.len(), missiles.len());

        Some(MatchSnapshot {
            match_id,
            tick,
            timestamp: Utc::now(),
            robots: robot_snapshots,
            missiles,
            events: events.clone(),
        })
    }

    pub fn stats(&self) -> &SnapshotStats {
        &self.stats
    }
}

/// Snapshot volume counters
#[derive(Debug, Default, Clone)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub avg_missiles_per_snapshot: f32,
    pub peak_missiles: usize,
    pub robots: usize,
}

impl SnapshotStats {
    pub fn record(&mut self, robot_count: usize, missile_count: usize) {
        self.total_snapshots += 1;
        self.robots = robot_count;
        self.peak_missiles = self.peak_missiles.max(missile_count);

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_missiles_per_snapshot =
            self.avg_missiles_per_snapshot * ((n - 1.0) / n) + (missile_count as f32 / n);
    }
}
