//! Directional nearest-opponent query

use serde::{Deserialize, Serialize};

use crate::protocol::RobotId;

use super::physics::PhysicsSystem;

/// Maximum scan distance in arena units
pub const SCAN_RANGE: f32 = 800.0;

/// Arc width used when a script omits or garbles it
pub const DEFAULT_SCAN_WIDTH: f32 = 10.0;

/// Position of a scannable robot, frozen at the start of a tick
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: RobotId,
    pub name: String,
    pub x: f32,
    pub y: f32,
}

/// Nearest in-arc opponent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub distance: f32,
    /// Bearing from the scanner in degrees
    pub direction: f32,
    pub target_id: RobotId,
    pub target_name: String,
}

/// Width to scan with: non-positive or NaN falls back to the default
pub fn sanitize_width(width: f32) -> f32 {
    if width.is_nan() || width <= 0.0 {
        DEFAULT_SCAN_WIDTH
    } else {
        width
    }
}

/// Bearing from (x1, y1) to (x2, y2) in degrees, 90 pointing up the screen
pub fn bearing(x1: f32, y1: f32, x2: f32, y2: f32) -> f32 {
    let dx = x2 - x1;
    let dy = y2 - y1;
    PhysicsSystem::normalize_heading((-dy).atan2(dx).to_degrees())
}

/// Whether `angle` lies in the arc [start, end], which may wrap through 0
fn in_arc(angle: f32, start: f32, end: f32) -> bool {
    if start <= end {
        angle >= start && angle <= end
    } else {
        angle >= start || angle <= end
    }
}

/// Find the nearest contact other than the scanner inside the arc centered on
/// `direction`. Contacts must already be filtered to active robots.
pub fn scan(
    scanner_id: RobotId,
    x: f32,
    y: f32,
    contacts: &[Contact],
    direction: f32,
    arc_width: f32,
    max_range: f32,
) -> Option<ScanResult> {
    if !direction.is_finite() {
        return None;
    }

    let half = (sanitize_width(arc_width) / 2.0).max(1.0);
    let start = PhysicsSystem::normalize_heading(direction - half);
    let end = PhysicsSystem::normalize_heading(direction + half);

    let mut best: Option<(&Contact, f32)> = None;
    let mut best_dist_sq = max_range * max_range;

    for contact in contacts.iter().filter(|c| c.id != scanner_id) {
        let angle = bearing(x, y, contact.x, contact.y);
        if !in_arc(angle, start, end) {
            continue;
        }

        let dx = contact.x - x;
        let dy = contact.y - y;
        let dist_sq = dx * dx + dy * dy;
        if dist_sq < best_dist_sq {
            best_dist_sq = dist_sq;
            best = Some((contact, angle));
        }
    }

    best.map(|(contact, angle)| ScanResult {
        distance: best_dist_sq.sqrt(),
        direction: angle,
        target_id: contact.id,
        target_name: contact.name.clone(),
    })
}
