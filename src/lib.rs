//! Robot Arena - authoritative simulation core for scripted robot matches
//!
//! Each match owns a set of robots driven by sandboxed scripts, steps them at
//! a fixed tick rate and publishes a world snapshot per tick. Transport,
//! lobbies and persistence live outside this crate and talk to a match
//! through [`game::MatchHandle`] and the match-over callback.

pub mod config;
pub mod game;
pub mod protocol;
pub mod script;
pub mod util;
