//! Error types for the deploy agent

use std::time::Duration;

use ping_protocol::{ProtocolError, Status};
use thiserror::Error;

/// Main error type for the deploy agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Command '{command}' timed out after {timeout:?}")]
    TimeoutError { command: String, timeout: Duration },

    #[error("Command '{command}' exited with {exit_code:?}: {stderr_tail}")]
    ScriptError {
        command: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Unable to start '{command}': {reason}")]
    InvocationError { command: String, reason: String },

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Control plane error: {0}")]
    TransportError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal invariant violated: {0}")]
    InvariantError(String),
}

/// Failure taxonomy used for reporting and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Download,
    Configuration,
    Script,
    Aborted,
    Transport,
    Agent,
    InternalInvariant,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::TimeoutError { .. } => ErrorKind::Timeout,
            AgentError::DownloadError(_) | AgentError::ChecksumMismatch { .. } => {
                ErrorKind::Download
            }
            AgentError::ConfigError(_) => ErrorKind::Configuration,
            AgentError::ScriptError { .. } => ErrorKind::Script,
            AgentError::Aborted(_) => ErrorKind::Aborted,
            AgentError::HttpError(_)
            | AgentError::TransportError(_)
            | AgentError::ProtocolError(_) => ErrorKind::Transport,
            AgentError::InvariantError(_) => ErrorKind::InternalInvariant,
            AgentError::IoError(_)
            | AgentError::JsonError(_)
            | AgentError::InvocationError { .. }
            | AgentError::StorageError(_)
            | AgentError::ServerError(_)
            | AgentError::ShutdownError(_) => ErrorKind::Agent,
        }
    }

    /// Invariant failures end the process; everything else is reported and retried.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::InternalInvariant
    }

    /// Status reported for a stage that failed with this error
    pub fn status(&self) -> Status {
        match self.kind() {
            ErrorKind::Timeout => Status::ScriptTimeout,
            ErrorKind::Script => Status::ScriptFailed,
            ErrorKind::Aborted => Status::AbortedByServer,
            ErrorKind::Download | ErrorKind::Transport => Status::RetryableAgentFailed,
            ErrorKind::Configuration | ErrorKind::Agent | ErrorKind::InternalInvariant => {
                Status::AgentFailed
            }
        }
    }

    /// Error code reported alongside the status. Scripts report their exit code.
    pub fn error_code(&self) -> i32 {
        match self {
            AgentError::ScriptError {
                exit_code: Some(code),
                ..
            } => *code,
            _ => self.status().code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let timeout = AgentError::TimeoutError {
            command: "sleep".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.status(), Status::ScriptTimeout);

        let script = AgentError::ScriptError {
            command: "false".to_string(),
            exit_code: Some(3),
            stderr_tail: String::new(),
        };
        assert_eq!(script.status(), Status::ScriptFailed);
        assert_eq!(script.error_code(), 3);

        let download = AgentError::ChecksumMismatch {
            expected: "a".to_string(),
            actual: "b".to_string(),
        };
        assert_eq!(download.kind(), ErrorKind::Download);
        assert_eq!(download.status(), Status::RetryableAgentFailed);

        assert_eq!(
            AgentError::ConfigError("no creds".to_string()).status(),
            Status::AgentFailed
        );
        assert_eq!(
            AgentError::Aborted("terminate".to_string()).status(),
            Status::AbortedByServer
        );
    }

    #[test]
    fn test_only_invariants_are_fatal() {
        assert!(AgentError::InvariantError("bad".to_string()).is_fatal());
        assert!(!AgentError::DownloadError("404".to_string()).is_fatal());
        assert!(!AgentError::ConfigError("x".to_string()).is_fatal());
    }
}
