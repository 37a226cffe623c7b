//! Robot and missile movement, arena bounds

use super::robot::Robot;

/// Arena units per second covered by one unit of speed.
/// At the default 30 Hz tick a speed of 1 moves 2 units per tick.
pub const SPEED_SCALE: f32 = 60.0;

/// Commanded speed range is [-MAX_ROBOT_SPEED, MAX_ROBOT_SPEED]
pub const MAX_ROBOT_SPEED: f32 = 5.0;

pub const ARENA_WIDTH: f32 = 900.0;
pub const ARENA_HEIGHT: f32 = 900.0;

/// Rectangular arena, origin top-left, y growing downward
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Arena {
    pub width: f32,
    pub height: f32,
}

impl Arena {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// Check if a point is inside the arena (edges included)
    pub fn contains(&self, x: f32, y: f32) -> bool {
        (0.0..=self.width).contains(&x) && (0.0..=self.height).contains(&y)
    }

    /// Clamp a circle center so the whole circle stays inside the arena
    pub fn clamp_circle(&self, x: f32, y: f32, radius: f32) -> (f32, f32) {
        (
            x.max(radius).min(self.width - radius),
            y.max(radius).min(self.height - radius),
        )
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new(ARENA_WIDTH, ARENA_HEIGHT)
    }
}

/// Physics system for moving robots and missiles
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Normalize any heading into [0, 360)
    pub fn normalize_heading(degrees: f32) -> f32 {
        let heading = degrees.rem_euclid(360.0);
        // rem_euclid rounds tiny negative inputs up to exactly 360
        if heading >= 360.0 {
            0.0
        } else {
            heading
        }
    }

    /// Displacement for `speed` along `heading` (degrees, 0 = east, 90 = north).
    /// Returns (dx, dy) in arena coordinates, so northward motion has negative dy.
    pub fn displacement(heading: f32, speed: f32, dt: f32, scale: f32) -> (f32, f32) {
        let distance = speed * dt * scale;
        let radians = heading.to_radians();
        (radians.cos() * distance, -radians.sin() * distance)
    }

    /// Advance one robot and its missiles by `dt` seconds
    pub fn update_robot(robot: &mut Robot, dt: f32, arena: &Arena, scale: f32) {
        Self::update_missiles(robot, dt, arena, scale);

        robot.cooldown = robot.cooldown.saturating_sub(1);

        if !robot.is_active() {
            return;
        }

        // Commanded values become actual for this integration
        robot.speed = robot.target_speed();
        robot.direction = robot.target_direction();

        let (dx, dy) = Self::displacement(robot.direction, robot.speed, dt, scale);
        let (x, y) = arena.clamp_circle(robot.x + dx, robot.y + dy, robot.radius);
        robot.x = x;
        robot.y = y;
    }

    /// Move a robot's in-flight missiles, dropping the ones that left the arena
    pub fn update_missiles(robot: &mut Robot, dt: f32, arena: &Arena, scale: f32) {
        robot.missiles.retain_mut(|missile| {
            let (dx, dy) = Self::displacement(missile.direction, missile.speed, dt, scale);
            missile.x += dx;
            missile.y += dy;
            arena.contains(missile.x, missile.y)
        });
    }

    /// Check overlap between two circles (touching does not count)
    pub fn check_circle_overlap(
        x1: f32, y1: f32, radius1: f32,
        x2: f32, y2: f32, radius2: f32,
    ) -> bool {
        let dx = x2 - x1;
        let dy = y2 - y1;
        let dist_sq = dx * dx + dy * dy;
        let combined_radius = radius1 + radius2;
        dist_sq < combined_radius * combined_radius
    }

    /// Resolve overlap between two robots (pushes them apart symmetrically)
    /// Returns ((new_x1, new_y1), (new_x2, new_y2))
    pub fn resolve_robot_overlap(
        x1: f32, y1: f32, radius1: f32,
        x2: f32, y2: f32, radius2: f32,
    ) -> ((f32, f32), (f32, f32)) {
        let dx = x2 - x1;
        let dy = y2 - y1;
        let dist = (dx * dx + dy * dy).sqrt();
        let combined_radius = radius1 + radius2;

        if dist < 0.001 {
            // Robots are at same position, separate along the x axis
            let push = combined_radius / 2.0;
            return ((x1 - push, y1), (x2 + push, y2));
        }

        let overlap = combined_radius - dist;
        if overlap <= 0.0 {
            return ((x1, y1), (x2, y2)); // No collision
        }

        // Normalize direction
        let nx = dx / dist;
        let ny = dy / dist;

        // Push apart by half the overlap each
        let push = overlap / 2.0;

        ((x1 - nx * push, y1 - ny * push), (x2 + nx * push, y2 + ny * push))
    }
}
