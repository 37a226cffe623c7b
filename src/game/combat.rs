//! Combat system - missiles, firing and damage rules

use uuid::Uuid;

use crate::protocol::{MissileSnapshot, RobotId};

/// Lowest and highest missile power
pub const MIN_POWER: f32 = 1.0;
pub const MAX_POWER: f32 = 3.0;

/// Damage applied to both robots when they bump into each other
pub const ROBOT_COLLISION_DAMAGE: f32 = 0.5;

/// Explosion size for a self-destructing robot
pub const SELF_DESTRUCT_EXPLOSION_SIZE: f32 = 5.0;

/// Gap between a robot's hull and a freshly launched missile
pub const MISSILE_SPAWN_GAP: f32 = 5.0;

/// Weapon stats derived from the power a missile was fired with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeaponStats {
    /// Damage per hit
    pub damage: f32,
    /// Missile speed (same units as robot speed)
    pub missile_speed: f32,
    /// Missile hitbox radius
    pub missile_radius: f32,
    /// Ticks before the robot may fire again
    pub cooldown_ticks: u32,
}

impl WeaponStats {
    pub fn for_power(power: f32) -> Self {
        Self {
            damage: power * 10.0,
            missile_speed: 7.0 + power,
            missile_radius: 3.0 + power,
            cooldown_ticks: (power * 10.0 + 10.0).ceil() as u32,
        }
    }
}

/// Missile in flight. The owner is referenced by id only and may already be destroyed.
#[derive(Debug, Clone)]
pub struct Missile {
    pub id: Uuid,
    pub owner_id: RobotId,
    pub x: f32,
    pub y: f32,
    /// Heading in degrees
    pub direction: f32,
    pub speed: f32,
    pub power: f32,
    pub radius: f32,
}

impl Missile {
    /// Create a new missile
    pub fn new(owner_id: RobotId, x: f32, y: f32, direction: f32, power: f32) -> Self {
        let stats = WeaponStats::for_power(power);
        Self {
            id: Uuid::new_v4(),
            owner_id,
            x,
            y,
            direction,
            speed: stats.missile_speed,
            power,
            radius: stats.missile_radius,
        }
    }

    pub fn damage(&self) -> f32 {
        WeaponStats::for_power(self.power).damage
    }

    /// Check collision with a target circle (squared distances, no sqrt)
    pub fn check_hit(&self, target_x: f32, target_y: f32, target_radius: f32) -> bool {
        let dx = target_x - self.x;
        let dy = target_y - self.y;
        let dist_sq = dx * dx + dy * dy;
        let combined_radius = self.radius + target_radius;
        dist_sq < combined_radius * combined_radius
    }

    pub fn snapshot(&self) -> MissileSnapshot {
        MissileSnapshot {
            id: self.id,
            x: self.x,
            y: self.y,
            radius: self.radius,
            direction: self.direction,
            owner_id: self.owner_id,
        }
    }
}

/// Combat rules shared by the script API and the collision pass
pub struct CombatSystem;

impl CombatSystem {
    /// Check if a robot can fire (cooldown check)
    pub fn can_fire(cooldown: u32) -> bool {
        cooldown == 0
    }

    /// Power to fire with: missing or NaN falls back to minimum, the rest is clamped
    pub fn sanitize_power(power: Option<f32>) -> f32 {
        match power {
            Some(p) if !p.is_nan() => p.clamp(MIN_POWER, MAX_POWER),
            _ => MIN_POWER,
        }
    }

    /// Apply damage to an accumulator, returns (new_damage, is_destroyed)
    pub fn apply_damage(current_damage: f32, amount: f32) -> (f32, bool) {
        let new_damage = (current_damage + amount).min(100.0);
        (new_damage, new_damage >= 100.0)
    }
}
