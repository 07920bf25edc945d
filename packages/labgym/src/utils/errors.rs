// packages/labgym/src/utils/errors.rs
//! Error types shared by the supervisor, the worker and the environments

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// Every failure the crate can surface
#[derive(Debug, Error)]
pub enum EngineError {
    /// The factory failed inside the worker, or the worker died before the
    /// handshake completed. No worker process survives this error.
    #[error("environment construction failed: {description}")]
    ConstructionFailed {
        /// PID of the (already reaped) worker, if one was launched
        pid: Option<u32>,
        description: String,
    },

    /// `reset` or `step` failed inside the worker
    #[error("remote {operation} failed: {description}")]
    Remote {
        operation: &'static str,
        description: String,
    },

    /// The channel to the worker is closed or broken
    #[error("worker channel broken: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded as a protocol message
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("handle is closed")]
    HandleClosed,

    #[error("command did not complete within {0:?}")]
    CommandTimeout(Duration),

    #[error("failed to launch worker process: {0}")]
    ProcessSpawnFailed(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Engine-level failure (bad level, bad observation name, closed engine...)
    #[error("engine error: {0}")]
    Engine(String),

    #[error("unknown environment id: {0}")]
    UnknownEnvironment(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error means the worker can no longer be reached
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<nix::Error> for EngineError {
    fn from(err: nix::Error) -> Self {
        EngineError::Io(std::io::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_carries_description() {
        let err = EngineError::Remote {
            operation: "step",
            description: "engine exploded".into(),
        };
        assert_eq!(err.to_string(), "remote step failed: engine exploded");
    }

    #[test]
    fn test_transport_classification() {
        assert!(EngineError::Transport("eof".into()).is_transport());
        assert!(!EngineError::HandleClosed.is_transport());
    }
}
