//! Crate-wide error type, following the donor crate's hand-written
//! `Display`/`std::error::Error` pattern (see `tool_protocol::ToolError`) rather than a
//! derive-macro error crate.

use std::fmt;

/// Errors surfaced by the coordination core.
///
/// Most of these are *local to a turn* (protocol violations, backend stream errors) and do
/// not abort sibling agents or the session; a few are session-level (`Configuration`,
/// `Cancelled`) and do.
#[derive(Debug, Clone)]
pub enum MassGenError {
    /// The model called the wrong/no workflow tool, voted for a missing agent, or combined
    /// `vote` and `new_answer` in the same turn.
    ProtocolViolation(String),
    /// The agent backend's stream ended with a non-recoverable error.
    BackendStream(String),
    /// A broadcast request exceeded its timeout before enough responses arrived.
    BroadcastTimeout(String),
    /// Session configuration was invalid; raised synchronously during init.
    Configuration(String),
    /// The session or a task within it was cancelled.
    Cancelled,
}

impl fmt::Display for MassGenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MassGenError::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            MassGenError::BackendStream(msg) => write!(f, "backend stream error: {msg}"),
            MassGenError::BroadcastTimeout(msg) => write!(f, "broadcast timeout: {msg}"),
            MassGenError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            MassGenError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for MassGenError {}
