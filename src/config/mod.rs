//! Configuration module - environment variable parsing

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::game::physics::{Arena, SPEED_SCALE};
use crate::game::targeting::SCAN_RANGE;
use crate::script::ScriptBudget;
use crate::util::rate_limit::SCRIPT_LOG_RATE_LIMIT;
use crate::util::time::DEFAULT_TICK_RATE;

/// Log output format for the subscriber
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Human readable or JSON log lines
    pub log_format: LogFormat,
    /// Settings applied to every match hosted by this process
    pub match_settings: MatchSettings,
    /// Number of bot-vs-bot matches the host binary runs
    pub demo_matches: usize,
    /// Bot profiles placed into each demo match
    pub demo_bots: Vec<String>,
}

/// Per-match simulation parameters
#[derive(Clone, Debug)]
pub struct MatchSettings {
    /// Steps per second
    pub tick_rate: u32,
    pub arena: Arena,
    /// Arena units per second for one unit of robot or missile speed
    pub speed_scale: f32,
    /// Maximum scan distance
    pub scan_range: f32,
    pub script_budget: ScriptBudget,
    /// Script log lines forwarded per robot per second
    pub log_lines_per_sec: u32,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            arena: Arena::default(),
            speed_scale: SPEED_SCALE,
            scan_range: SCAN_RANGE,
            script_budget: ScriptBudget::default(),
            log_lines_per_sec: SCRIPT_LOG_RATE_LIMIT,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = MatchSettings::default();
        let budget = defaults.script_budget.clone();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("pretty") | Err(_) => LogFormat::Pretty,
            Ok(_) => return Err(ConfigError::Invalid("LOG_FORMAT")),
        };

        let tick_rate: u32 = parse_or("TICK_RATE", defaults.tick_rate)?;
        if tick_rate == 0 {
            return Err(ConfigError::Invalid("TICK_RATE"));
        }

        let arena = Arena::new(
            parse_or("ARENA_WIDTH", defaults.arena.width)?,
            parse_or("ARENA_HEIGHT", defaults.arena.height)?,
        );
        if arena.width <= 0.0 || arena.height <= 0.0 {
            return Err(ConfigError::Invalid("ARENA_WIDTH/ARENA_HEIGHT"));
        }

        let script_budget = ScriptBudget {
            timeout: Duration::from_millis(parse_or(
                "SCRIPT_TIMEOUT_MS",
                budget.timeout.as_millis() as u64,
            )?),
            compile_timeout: Duration::from_millis(parse_or(
                "SCRIPT_COMPILE_TIMEOUT_MS",
                budget.compile_timeout.as_millis() as u64,
            )?),
            max_operations: parse_or("SCRIPT_MAX_OPERATIONS", budget.max_operations)?,
            max_source_bytes: parse_or("SCRIPT_MAX_SOURCE_BYTES", budget.max_source_bytes)?,
            max_state_bytes: parse_or("SCRIPT_MAX_STATE_BYTES", budget.max_state_bytes)?,
            ..budget
        };

        let demo_bots = env::var("DEMO_BOTS")
            .unwrap_or_else(|_| "aggressive,defensive".to_string())
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();

        Ok(Self {
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            match_settings: MatchSettings {
                tick_rate,
                arena,
                speed_scale: parse_or("SPEED_SCALE", defaults.speed_scale)?,
                scan_range: parse_or("SCAN_RANGE", defaults.scan_range)?,
                script_budget,
                log_lines_per_sec: parse_or("SCRIPT_LOG_LINES_PER_SEC", defaults.log_lines_per_sec)?,
            },
            demo_matches: parse_or("DEMO_MATCHES", 1)?,
            demo_bots,
        })
    }
}

/// Read `name` from the environment, falling back to `default` when unset
fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
