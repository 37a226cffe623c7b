//! Sandboxed robot script runtime
//!
//! A [`ScriptEngine`] compiles each robot's source once and invokes the
//! resulting handle once per tick. The only door from script code into the
//! simulation is the [`RobotApi`] capability handed to each invocation: it is
//! bound to a single robot, operates on a private copy of that robot's state,
//! and is revoked when the turn ends. The match loop commits the copy back
//! only if the turn finished cleanly.

pub mod bots;
pub mod rhai;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::game::robot::Robot;
use crate::game::targeting::{self, Contact, ScanResult};
use crate::protocol::FireEvent;

pub use self::bots::BotProfile;
pub use self::rhai::{RhaiEngine, RhaiScript};

/// Log lines a single turn may queue before further lines are dropped
pub const MAX_LOGS_PER_TURN: usize = 32;

/// Longest log line forwarded, in bytes
pub const MAX_LOG_LINE_BYTES: usize = 512;

/// Resource limits applied to compilation and to every invocation
#[derive(Debug, Clone)]
pub struct ScriptBudget {
    /// Wall-clock ceiling for one invocation
    pub timeout: Duration,
    /// Wall-clock ceiling for compiling a script
    pub compile_timeout: Duration,
    /// Interpreter operations per invocation
    pub max_operations: u64,
    pub max_source_bytes: usize,
    /// Estimated size ceiling for a robot's persistent `state`
    pub max_state_bytes: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
}

impl Default for ScriptBudget {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(100),
            compile_timeout: Duration::from_millis(500),
            max_operations: 1_000_000,
            max_source_bytes: 64 * 1024,
            max_state_bytes: 256 * 1024,
            max_string_size: 64 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_call_levels: 48,
            max_expr_depth: 64,
        }
    }
}

/// Script failures. None of these ever escape the owning robot's turn.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Execution timed out")]
    Timeout,

    #[error("Execution budget exceeded")]
    BudgetExceeded,

    #[error("Memory limit exceeded")]
    MemoryExceeded,
}

/// Compiles and runs robot scripts. Implementations must enforce `budget`
/// and expose nothing to script code beyond the supplied [`RobotApi`].
pub trait ScriptEngine: Send + 'static {
    /// Compiled, per-robot script including any state it keeps across ticks
    type Handle: Send;

    fn compile(&self, source: &str, budget: &ScriptBudget) -> Result<Self::Handle, ScriptError>;

    fn invoke(
        &self,
        handle: &mut Self::Handle,
        api: RobotApi,
        budget: &ScriptBudget,
    ) -> Result<(), ScriptError>;
}

/// Everything a turn produced
#[derive(Debug, Default)]
pub struct TurnOutcome {
    /// Robot copy with the turn's commands applied, `None` if already taken
    pub robot: Option<Robot>,
    pub fires: Vec<FireEvent>,
    pub logs: Vec<String>,
    /// Log lines beyond the per-turn cap
    pub dropped_logs: usize,
}

#[derive(Debug)]
struct ApiState {
    robot: Option<Robot>,
    contacts: Arc<[Contact]>,
    scan_range: f32,
    fires: Vec<FireEvent>,
    logs: Vec<String>,
    dropped_logs: usize,
}

/// Capability bound to one robot for one turn
#[derive(Debug, Clone)]
pub struct RobotApi {
    state: Arc<Mutex<ApiState>>,
}

impl RobotApi {
    /// `contacts` are the active robots as of the start of the tick
    pub fn new(robot: &Robot, contacts: Arc<[Contact]>, scan_range: f32) -> Self {
        Self {
            state: Arc::new(Mutex::new(ApiState {
                robot: Some(robot.script_view()),
                contacts,
                scan_range,
                fires: Vec::new(),
                logs: Vec::new(),
                dropped_logs: 0,
            })),
        }
    }

    pub fn drive(&self, direction: f32, speed: f32) {
        if let Some(robot) = self.state.lock().robot.as_mut() {
            robot.drive(direction, speed);
        }
    }

    pub fn fire(&self, direction: f32, power: f32) -> bool {
        let mut state = self.state.lock();
        let Some(event) = state.robot.as_mut().and_then(|r| r.fire(direction, power)) else {
            return false;
        };
        state.fires.push(event);
        true
    }

    pub fn scan(&self, direction: f32, arc_width: f32) -> Option<ScanResult> {
        let state = self.state.lock();
        let robot = state.robot.as_ref()?;
        targeting::scan(
            robot.id,
            robot.x,
            robot.y,
            &state.contacts,
            direction,
            arc_width,
            state.scan_range,
        )
    }

    pub fn damage(&self) -> f32 {
        self.read(|r| r.damage())
    }

    pub fn x(&self) -> f32 {
        self.read(|r| r.x)
    }

    pub fn y(&self) -> f32 {
        self.read(|r| r.y)
    }

    pub fn direction(&self) -> f32 {
        self.read(|r| r.direction)
    }

    pub fn log(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        if state.robot.is_none() {
            return;
        }
        if state.logs.len() >= MAX_LOGS_PER_TURN {
            state.dropped_logs += 1;
            return;
        }

        let mut message = message.into();
        if message.len() > MAX_LOG_LINE_BYTES {
            let mut cut = MAX_LOG_LINE_BYTES;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        state.logs.push(message);
    }

    /// End the turn. Clones kept by the script become inert.
    pub fn finish(&self) -> TurnOutcome {
        let mut state = self.state.lock();
        TurnOutcome {
            robot: state.robot.take(),
            fires: std::mem::take(&mut state.fires),
            logs: std::mem::take(&mut state.logs),
            dropped_logs: std::mem::take(&mut state.dropped_logs),
        }
    }

    fn read(&self, f: impl FnOnce(&Robot) -> f32) -> f32 {
        self.state.lock().robot.as_ref().map(f).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn robot_at(x: f32, y: f32) -> Robot {
        Robot::new(Uuid::new_v4(), "bot".to_string(), serde_json::Value::Null, x, y, 0.0)
    }

    #[test]
    fn commands_land_on_the_copy_only() {
        let robot = robot_at(100.0, 100.0);
        let api = RobotApi::new(&robot, Arc::from(Vec::new()), 800.0);

        api.drive(90.0, 3.0);
        assert!(api.fire(0.0, 1.0));
        assert!(!api.fire(0.0, 1.0));

        assert_eq!(robot.target_speed(), 0.0);
        assert!(robot.missiles.is_empty());

        let outcome = api.finish();
        let copy = outcome.robot.expect("turn copy");
        assert_eq!(copy.target_speed(), 3.0);
        assert_eq!(copy.missiles.len(), 1);
        assert_eq!(outcome.fires.len(), 1);
    }

    #[test]
    fn finished_api_is_inert() {
        let robot = robot_at(100.0, 100.0);
        let api = RobotApi::new(&robot, Arc::from(Vec::new()), 800.0);
        let stale = api.clone();
        api.finish();

        assert!(!stale.fire(0.0, 1.0));
        assert_eq!(stale.x(), 0.0);
        stale.log("ignored");
        assert!(stale.finish().robot.is_none());
    }

    #[test]
    fn scan_sees_frozen_contacts() {
        let me = robot_at(100.0, 100.0);
        let other = robot_at(300.0, 100.0);
        let contacts: Arc<[Contact]> = Arc::from(vec![me.contact(), other.contact()]);
        let api = RobotApi::new(&me, contacts, 800.0);

        let result = api.scan(0.0, 10.0).expect("contact ahead");
        assert_eq!(result.target_id, other.id);
        assert!(api.scan(180.0, 10.0).is_none());
    }

    #[test]
    fn logs_are_capped_per_turn() {
        let robot = robot_at(100.0, 100.0);
        let api = RobotApi::new(&robot, Arc::from(Vec::new()), 800.0);
        for i in 0..(MAX_LOGS_PER_TURN + 5) {
            api.log(format!("line {i}"));
        }
        api.log("x".repeat(MAX_LOG_LINE_BYTES * 2));

        let outcome = api.finish();
        assert_eq!(outcome.logs.len(), MAX_LOGS_PER_TURN);
        assert_eq!(outcome.dropped_logs, 6);
    }

    #[test]
    fn long_lines_are_truncated() {
        let robot = robot_at(100.0, 100.0);
        let api = RobotApi::new(&robot, Arc::from(Vec::new()), 800.0);
        api.log("é".repeat(MAX_LOG_LINE_BYTES));
        let outcome = api.finish();
        assert!(outcome.logs[0].len() <= MAX_LOG_LINE_BYTES);
    }
}
