use thiserror::Error;

/// Engine-internal faults. Domain outcomes (timeouts, limit violations,
/// capacity, unknown sessions) are values on [`crate::Outcome`], never `Err`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("python interpreter not found: {0}")]
    Interpreter(#[from] which::Error),

    #[error("failed to spawn worker: {0}")]
    Spawn(std::io::Error),

    #[error("worker failed to initialize: {0}")]
    Startup(String),

    #[error("worker wire protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("session capacity reached")]
    Capacity,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
