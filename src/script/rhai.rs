//! Rhai-backed script engine

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Scope, AST, FLOAT, INT};
use tracing::{debug, trace};

use super::{RobotApi, ScriptBudget, ScriptEngine, ScriptError};
use crate::util::time::Timer;

/// Interpreter operations between wall-clock deadline checks
const DEADLINE_CHECK_INTERVAL: u64 = 128;

/// Rough per-value overhead used when sizing `state`
const VALUE_OVERHEAD: usize = 16;

/// `console` object exposed to scripts
#[derive(Clone)]
struct ConsoleApi {
    api: RobotApi,
}

impl ConsoleApi {
    fn log(&mut self, args: &[Dynamic]) {
        let line = args
            .iter()
            .map(|arg| arg.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.api.log(line);
    }
}

/// `Math` object exposed to scripts, owns the robot's random stream
#[derive(Clone)]
struct MathApi {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl MathApi {
    fn new() -> Self {
        let seed = rand::thread_rng().gen::<u64>();
        Self {
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    fn random(&mut self) -> f64 {
        self.rng.lock().gen::<f64>()
    }
}

/// Numeric view of a script value
fn number(value: &Dynamic) -> Option<f64> {
    value
        .as_float()
        .ok()
        .or_else(|| value.as_int().ok().map(|i| i as f64))
}

/// Like [`number`], with non-numbers as NaN so the robot API rejects them
fn as_number(value: &Dynamic) -> f64 {
    number(value).unwrap_or(f64::NAN)
}

/// Compiled robot script plus the scope it keeps across ticks
pub struct RhaiScript {
    ast: AST,
    scope: Scope<'static>,
    /// Scope length with only the persistent variables pushed
    base_len: usize,
}

impl RhaiScript {
    fn state_footprint(&self) -> usize {
        self.scope.get("state").map(footprint).unwrap_or(0)
    }

    fn reset_state(&mut self) {
        self.scope.set_value("state", Map::new());
    }
}

/// Approximate heap size of a script value
fn footprint(value: &Dynamic) -> usize {
    if let Some(map) = value.read_lock::<Map>() {
        map.iter()
            .map(|(key, value)| key.len() + footprint(value))
            .sum::<usize>()
            + VALUE_OVERHEAD
    } else if let Some(array) = value.read_lock::<Array>() {
        array.iter().map(footprint).sum::<usize>() + VALUE_OVERHEAD
    } else if let Some(string) = value.read_lock::<ImmutableString>() {
        string.len() + VALUE_OVERHEAD
    } else {
        VALUE_OVERHEAD
    }
}

fn unavailable(name: &str) -> Box<EvalAltResult> {
    format!("{name}() is not available to robot code").into()
}

/// Map an interpreter failure onto the sandbox error kinds
fn classify(err: Box<EvalAltResult>) -> ScriptError {
    match *err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => classify(inner),
        EvalAltResult::ErrorTooManyOperations(..) | EvalAltResult::ErrorStackOverflow(..) => {
            ScriptError::BudgetExceeded
        }
        EvalAltResult::ErrorDataTooLarge(..) => ScriptError::MemoryExceeded,
        EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout,
        other => ScriptError::Runtime(other.to_string()),
    }
}

/// Script engine built on an isolated Rhai [`Engine`]
pub struct RhaiEngine {
    engine: Engine,
    /// Wall-clock deadline of the running invocation
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl RhaiEngine {
    pub fn new(budget: &ScriptBudget) -> Self {
        let mut engine = Engine::new();
        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        // Resource ceilings
        engine.set_max_operations(budget.max_operations);
        engine.set_max_expr_depths(budget.max_expr_depth, budget.max_expr_depth);
        engine.set_max_call_levels(budget.max_call_levels);
        engine.set_max_string_size(budget.max_string_size);
        engine.set_max_array_size(budget.max_array_size);
        engine.set_max_map_size(budget.max_map_size);

        // No modules, no dynamic evaluation
        engine.set_max_modules(0);
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");
        engine.disable_symbol("import");

        let progress_deadline = deadline.clone();
        engine.on_progress(move |ops| {
            if ops % DEADLINE_CHECK_INTERVAL != 0 {
                return None;
            }
            match *progress_deadline.lock() {
                Some(deadline) if Instant::now() >= deadline => Some(Dynamic::UNIT),
                _ => None,
            }
        });

        engine.on_print(|text| trace!(target: "robot_script", "{}", text));
        engine.on_debug(|text, _source, pos| debug!(target: "robot_script", %pos, "{}", text));

        Self::block_host_clock(&mut engine);
        Self::register_robot_api(&mut engine);
        Self::register_console_api(&mut engine);
        Self::register_math_api(&mut engine);

        Self { engine, deadline }
    }

    /// Shadow the standard `sleep` and `timestamp` so scripts get no timers
    fn block_host_clock(engine: &mut Engine) {
        engine
            .register_fn("sleep", |_: INT| -> Result<(), Box<EvalAltResult>> {
                Err(unavailable("sleep"))
            })
            .register_fn("sleep", |_: FLOAT| -> Result<(), Box<EvalAltResult>> {
                Err(unavailable("sleep"))
            })
            .register_fn("timestamp", || -> Result<Dynamic, Box<EvalAltResult>> {
                Err(unavailable("timestamp"))
            });
    }

    fn register_robot_api(engine: &mut Engine) {
        engine
            .register_type_with_name::<RobotApi>("Robot")
            .register_fn("drive", |api: &mut RobotApi, direction: Dynamic, speed: Dynamic| {
                if let (Some(direction), Some(speed)) = (number(&direction), number(&speed)) {
                    api.drive(direction as f32, speed as f32);
                }
            })
            .register_fn("fire", |api: &mut RobotApi, direction: Dynamic| {
                api.fire(as_number(&direction) as f32, 1.0)
            })
            .register_fn("fire", |api: &mut RobotApi, direction: Dynamic, power: Dynamic| {
                api.fire(as_number(&direction) as f32, as_number(&power) as f32)
            })
            .register_fn("scan", |api: &mut RobotApi, direction: Dynamic| {
                scan_to_dynamic(api, as_number(&direction) as f32, f32::NAN)
            })
            .register_fn("scan", |api: &mut RobotApi, direction: Dynamic, width: Dynamic| {
                scan_to_dynamic(api, as_number(&direction) as f32, as_number(&width) as f32)
            })
            .register_fn("damage", |api: &mut RobotApi| api.damage() as f64)
            .register_fn("getX", |api: &mut RobotApi| api.x() as f64)
            .register_fn("getY", |api: &mut RobotApi| api.y() as f64)
            .register_fn("getDirection", |api: &mut RobotApi| api.direction() as f64)
            .register_fn("log", |api: &mut RobotApi, message: Dynamic| {
                api.log(message.to_string());
            });
    }

    fn register_console_api(engine: &mut Engine) {
        engine
            .register_type_with_name::<ConsoleApi>("Console")
            .register_fn("log", |c: &mut ConsoleApi, a: Dynamic| c.log(&[a]))
            .register_fn("log", |c: &mut ConsoleApi, a: Dynamic, b: Dynamic| c.log(&[a, b]))
            .register_fn(
                "log",
                |c: &mut ConsoleApi, a: Dynamic, b: Dynamic, d: Dynamic| c.log(&[a, b, d]),
            )
            .register_fn(
                "log",
                |c: &mut ConsoleApi, a: Dynamic, b: Dynamic, d: Dynamic, e: Dynamic| {
                    c.log(&[a, b, d, e])
                },
            );
    }

    fn register_math_api(engine: &mut Engine) {
        engine
            .register_type_with_name::<MathApi>("Math")
            .register_get("PI", |_: &mut MathApi| PI)
            .register_fn("random", MathApi::random)
            .register_fn("abs", |_: &mut MathApi, x: Dynamic| as_number(&x).abs())
            .register_fn("sqrt", |_: &mut MathApi, x: Dynamic| as_number(&x).sqrt())
            .register_fn("floor", |_: &mut MathApi, x: Dynamic| as_number(&x).floor())
            .register_fn("ceil", |_: &mut MathApi, x: Dynamic| as_number(&x).ceil())
            .register_fn("round", |_: &mut MathApi, x: Dynamic| (as_number(&x) + 0.5).floor())
            .register_fn("sin", |_: &mut MathApi, x: Dynamic| as_number(&x).sin())
            .register_fn("cos", |_: &mut MathApi, x: Dynamic| as_number(&x).cos())
            .register_fn("tan", |_: &mut MathApi, x: Dynamic| as_number(&x).tan())
            .register_fn("asin", |_: &mut MathApi, x: Dynamic| as_number(&x).asin())
            .register_fn("acos", |_: &mut MathApi, x: Dynamic| as_number(&x).acos())
            .register_fn("atan", |_: &mut MathApi, x: Dynamic| as_number(&x).atan())
            .register_fn("atan2", |_: &mut MathApi, y: Dynamic, x: Dynamic| {
                as_number(&y).atan2(as_number(&x))
            })
            .register_fn("pow", |_: &mut MathApi, x: Dynamic, y: Dynamic| {
                as_number(&x).powf(as_number(&y))
            })
            .register_fn("min", |_: &mut MathApi, a: Dynamic, b: Dynamic| {
                as_number(&a).min(as_number(&b))
            })
            .register_fn("max", |_: &mut MathApi, a: Dynamic, b: Dynamic| {
                as_number(&a).max(as_number(&b))
            });
    }
}

impl Default for RhaiEngine {
    fn default() -> Self {
        Self::new(&ScriptBudget::default())
    }
}

/// Scan result as a script map, or `()` when nothing is in the arc
fn scan_to_dynamic(api: &RobotApi, direction: f32, width: f32) -> Dynamic {
    match api.scan(direction, width) {
        Some(result) => {
            let mut map = Map::new();
            map.insert("distance".into(), Dynamic::from_float(result.distance as f64));
            map.insert("direction".into(), Dynamic::from_float(result.direction as f64));
            map.insert("id".into(), Dynamic::from(result.target_id.to_string()));
            map.insert("name".into(), Dynamic::from(result.target_name));
            Dynamic::from_map(map)
        }
        None => Dynamic::UNIT,
    }
}

impl ScriptEngine for RhaiEngine {
    type Handle = RhaiScript;

    fn compile(&self, source: &str, budget: &ScriptBudget) -> Result<RhaiScript, ScriptError> {
        if source.trim().is_empty() {
            return Err(ScriptError::Compile("Robot code is missing or empty".to_string()));
        }
        if source.len() > budget.max_source_bytes {
            return Err(ScriptError::Compile(format!(
                "Robot code is larger than {} bytes",
                budget.max_source_bytes
            )));
        }

        let timer = Timer::new();
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        if timer.elapsed() > budget.compile_timeout {
            return Err(ScriptError::Compile("Robot code took too long to compile".to_string()));
        }

        // Variables that live for the whole match
        let mut scope = Scope::new();
        scope.push("state", Map::new());
        scope.push("Math", MathApi::new());
        let base_len = scope.len();

        Ok(RhaiScript {
            ast,
            scope,
            base_len,
        })
    }

    fn invoke(
        &self,
        handle: &mut RhaiScript,
        api: RobotApi,
        budget: &ScriptBudget,
    ) -> Result<(), ScriptError> {
        handle.scope.push("robot", api.clone());
        handle.scope.push("console", ConsoleApi { api });

        *self.deadline.lock() = Some(Instant::now() + budget.timeout);
        let result = self.engine.run_ast_with_scope(&mut handle.scope, &handle.ast);
        *self.deadline.lock() = None;

        // Drop per-turn variables, including anything the script declared
        handle.scope.rewind(handle.base_len);

        if handle.state_footprint() > budget.max_state_bytes {
            handle.reset_state();
            return Err(ScriptError::MemoryExceeded);
        }

        result.map_err(classify)
    }
}
