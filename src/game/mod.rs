//! Game simulation modules

pub mod collision;
pub mod combat;
pub mod r#match;
pub mod physics;
pub mod robot;
pub mod snapshot;
pub mod targeting;

pub use r#match::{
    GameMatch, MatchCommand, MatchError, MatchHandle, MatchOverCallback, MatchPhase,
    MatchRegistry, Participant, StepOutcome,
};
pub use robot::Robot;
