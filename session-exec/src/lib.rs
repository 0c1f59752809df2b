//! # Session Execution Engine
//!
//! Executes arbitrary Python snippets inside constrained, isolated, stateful
//! sessions. Each session owns a long-lived child interpreter process whose
//! namespace persists across executions; the supervisor enforces a wall-clock
//! budget and a resident-memory ceiling per execution and reclaims sessions
//! that sit idle too long.

mod error;
mod manager;
mod meter;
mod session;
mod types;
mod worker;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use manager::SessionManager;
pub use meter::{platform_inspector, ProcessInspector};
pub use types::{ErrorKind, Limits, Outcome, SessionId};

/// Result type for engine-internal operations
pub type Result<T> = std::result::Result<T, Error>;
