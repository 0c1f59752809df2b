use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Opaque session identifier. Minted by the server (UUID v4), rendered in
/// canonical hyphenated form; clients never make these up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Domain failure kinds. The serialized strings are part of the wire
/// contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "execution timeout")]
    ExecutionTimeout,
    #[serde(rename = "memory limit exceeded")]
    MemoryLimitExceeded,
    #[serde(rename = "max sessions reached")]
    MaxSessionsReached,
    #[serde(rename = "session not found")]
    SessionNotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ExecutionTimeout => "execution timeout",
            ErrorKind::MemoryLimitExceeded => "memory limit exceeded",
            ErrorKind::MaxSessionsReached => "max sessions reached",
            ErrorKind::SessionNotFound => "session not found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one execution. Exactly one of `error` vs (`stdout` | `stderr`)
/// is populated; a clean execution that printed nothing carries only `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    /// Session id, or the echoed raw id for unknown-session failures.
    pub id: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<ErrorKind>,
}

impl Outcome {
    pub fn success(id: SessionId, stdout: Option<String>, stderr: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            stdout,
            stderr,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            id: id.into(),
            stdout: None,
            stderr: None,
            error: Some(kind),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Resource limits and cadences for the engine.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Wall-clock budget per execution
    pub exec_timeout: Duration,
    /// Resident-memory ceiling per worker (bytes)
    pub memory_limit: u64,
    /// Global cap on live sessions
    pub max_sessions: usize,
    /// Inactivity threshold before a session is reaped
    pub idle_timeout: Duration,
    /// RSS sampling cadence of the memory monitor
    pub poll_interval: Duration,
    /// Wake-up cadence of the background reaper
    pub reap_interval: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            exec_timeout: Duration::from_secs(2),
            memory_limit: 100 * 1024 * 1024, // 100MB
            max_sessions: 40,
            idle_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            reap_interval: Duration::from_secs(60),
        }
    }
}
