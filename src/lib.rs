//! Live navigation harness: a chat-driven agent that turns model output into
//! browser actions and records the session as a replayable demonstration.

pub mod brain;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod dom;
pub mod error;
pub mod hands;
pub mod parser;
pub mod replay;
pub mod retrieval;
pub mod session;
pub mod snapshot;
pub mod turn;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{HarnessError, Result};
pub use session::Session;
pub use turn::{Agent, TurnInput, TurnOutcome};
