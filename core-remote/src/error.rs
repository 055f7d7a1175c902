//! # Remote Relay Error Types
//!
//! Two families of errors live here:
//! - [`RemoteError`] for operations the caller invokes on the coordinator
//! - [`SessionFailure`] for user-meaningful failures delivered to a running
//!   session through its listener
//!
//! Transport faults never reach the caller directly. Node processors recover
//! from them with reconnect backoff and session abandonment.

use bridge_traits::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::protocol::CodecError;

/// Errors returned by coordinator and node operations.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// No node is online with statistics, so a session cannot be placed.
    #[error("No available remote nodes to play on")]
    NoNodesAvailable,

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A tick body could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The HTTP exchange with a node failed.
    #[error("Transport error: {0}")]
    Transport(#[from] BridgeError),

    /// The node answered, but not with a success status.
    #[error("Node {address} responded with status {status}")]
    NodeUnavailable { address: String, status: u16 },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for remote relay operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

// ============================================================================
// Session Failures
// ============================================================================

/// How bad a session failure is.
///
/// Only affects logging verbosity; every failure is handled the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected in normal operation (track unavailable, capacity reached).
    Common,
    /// Unusual, possibly a problem with the node or the track.
    Suspicious,
    /// Indicates a bug or an unrecoverable node condition.
    Fault,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Common => "common",
            Severity::Suspicious => "suspicious",
            Severity::Fault => "fault",
        }
    }

    /// Wire representation used by `SessionException` messages.
    pub fn to_wire(self) -> u8 {
        match self {
            Severity::Common => 0,
            Severity::Suspicious => 1,
            Severity::Fault => 2,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Severity::Common),
            1 => Some(Severity::Suspicious),
            2 => Some(Severity::Fault),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported to a session's listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SessionFailure {
    pub message: String,
    pub severity: Severity,
    /// Remote-side cause, when the node supplied one.
    pub cause: Option<String>,
}

impl SessionFailure {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
            cause: None,
        }
    }

    pub fn common(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Common)
    }

    pub fn suspicious(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Suspicious)
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Fault)
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_wire_values() {
        for severity in [Severity::Common, Severity::Suspicious, Severity::Fault] {
            assert_eq!(Severity::from_wire(severity.to_wire()), Some(severity));
        }
        assert_eq!(Severity::from_wire(9), None);
    }

    #[test]
    fn test_session_failure_display() {
        let failure = SessionFailure::suspicious("Remote node failed to start track")
            .with_cause("decoder crashed");
        assert_eq!(failure.to_string(), "Remote node failed to start track");
        assert_eq!(failure.cause.as_deref(), Some("decoder crashed"));
        assert_eq!(failure.severity.as_str(), "suspicious");
    }

    #[test]
    fn test_transport_error_conversion() {
        let error: RemoteError = BridgeError::ConnectionFailed("refused".into()).into();
        assert!(matches!(error, RemoteError::Transport(_)));
        assert!(error.to_string().contains("refused"));
    }
}
