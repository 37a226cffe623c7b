//! Missile-vs-robot and robot-vs-robot collision passes

use crate::protocol::{DamageCause, DestructionEvent, ExplosionEvent, HitEvent, TickEvents};

use super::combat::ROBOT_COLLISION_DAMAGE;
use super::physics::{Arena, PhysicsSystem};
use super::robot::Robot;

/// Mutable references to two distinct robots
fn pair_mut(robots: &mut [Robot], a: usize, b: usize) -> (&mut Robot, &mut Robot) {
    debug_assert!(a != b);
    if a < b {
        let (left, right) = robots.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = robots.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

/// Collision resolution for one tick
pub struct CollisionSystem;

impl CollisionSystem {
    /// Run both passes, missiles first
    pub fn resolve(robots: &mut [Robot], arena: &Arena, tick: u64, events: &mut TickEvents) {
        Self::resolve_missiles(robots, tick, events);
        Self::resolve_robots(robots, arena, tick, events);
    }

    /// Test every active robot against every missile it did not fire
    pub fn resolve_missiles(robots: &mut [Robot], tick: u64, events: &mut TickEvents) {
        for target in 0..robots.len() {
            for shooter in 0..robots.len() {
                if shooter == target {
                    continue;
                }

                let (target_robot, shooter_robot) = pair_mut(robots, target, shooter);
                let mut index = 0;
                while index < shooter_robot.missiles.len() {
                    if !target_robot.is_active() {
                        break;
                    }

                    let missile = &shooter_robot.missiles[index];
                    if !missile.check_hit(target_robot.x, target_robot.y, target_robot.radius) {
                        index += 1;
                        continue;
                    }

                    let missile = shooter_robot.missiles.swap_remove(index);
                    let before = target_robot.damage();
                    let outcome = target_robot.take_damage(missile.damage(), DamageCause::Missile);

                    events.hits.push(HitEvent {
                        x: target_robot.x,
                        y: target_robot.y,
                        target_id: target_robot.id,
                    });
                    events.explosions.push(ExplosionEvent {
                        x: missile.x,
                        y: missile.y,
                        size: missile.power,
                    });

                    shooter_robot.stats.shots_hit += 1;
                    shooter_robot.stats.damage_dealt += target_robot.damage() - before;

                    if outcome.destroyed {
                        Self::record_destruction(target_robot, DamageCause::Missile, tick, events);
                    }
                }
            }
        }
    }

    /// Separate overlapping active robots and apply bump damage to both
    pub fn resolve_robots(robots: &mut [Robot], arena: &Arena, tick: u64, events: &mut TickEvents) {
        for i in 0..robots.len() {
            for j in (i + 1)..robots.len() {
                let (a, b) = pair_mut(robots, i, j);
                if !a.is_active() || !b.is_active() {
                    continue;
                }
                if !PhysicsSystem::check_circle_overlap(a.x, a.y, a.radius, b.x, b.y, b.radius) {
                    continue;
                }

                let ((ax, ay), (bx, by)) =
                    PhysicsSystem::resolve_robot_overlap(a.x, a.y, a.radius, b.x, b.y, b.radius);
                (a.x, a.y) = arena.clamp_circle(ax, ay, a.radius);
                (b.x, b.y) = arena.clamp_circle(bx, by, b.radius);

                for robot in [a, b] {
                    let outcome = robot.take_damage(ROBOT_COLLISION_DAMAGE, DamageCause::Collision);
                    events.hits.push(HitEvent {
                        x: robot.x,
                        y: robot.y,
                        target_id: robot.id,
                    });
                    if outcome.destroyed {
                        Self::record_destruction(robot, DamageCause::Collision, tick, events);
                    }
                }
            }
        }
    }

    /// Destruction bookkeeping shared by every damage source
    pub fn record_destruction(robot: &mut Robot, cause: DamageCause, tick: u64, events: &mut TickEvents) {
        robot.stats.destroyed_at_tick = Some(tick);
        events.destructions.push(DestructionEvent {
            x: robot.x,
            y: robot.y,
            target_id: robot.id,
            cause,
        });
    }
}
