//! Error types for the execution engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sandbox::types::SessionId;
use crate::sandbox::validator::Rejection;

/// Errors that can occur while admitting or running a request.
///
/// A guest program exiting non-zero, or being killed at its deadline, is not
/// an error: both are reported through a normal
/// [`ExecutionOutcome`](crate::ExecutionOutcome).
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The request failed static validation; no sandbox was created.
    #[error("request rejected: {0}")]
    ValidationRejected(Rejection),

    /// The host cannot satisfy the request right now.
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The request waited in the admission queue past its deadline.
    #[error("not admitted within {0:?}")]
    QueueTimeout(Duration),

    /// The originating session already holds its maximum number of slots.
    #[error("session {session} already has {limit} concurrent executions")]
    SessionConcurrencyExceeded {
        /// The offending session.
        session: SessionId,
        /// The per-session ceiling in force.
        limit: usize,
    },

    /// The isolation substrate itself misbehaved.
    #[error("runtime failure: {0}")]
    RuntimeFailure(#[source] anyhow::Error),

    /// The supervisor's own logic failed (for example a panicked task).
    #[error("internal error: {0}")]
    Internal(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error on the host side.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Data-free classification of a [`SandboxError`], carried by `Failed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationRejected,
    ResourceExhausted,
    QueueTimeout,
    SessionConcurrencyExceeded,
    RuntimeFailure,
    Internal,
    Config,
    Io,
}

impl SandboxError {
    /// Build a [`SandboxError::RuntimeFailure`] from a message.
    pub fn runtime(message: impl std::fmt::Display) -> Self {
        SandboxError::RuntimeFailure(anyhow::anyhow!("{}", message))
    }

    /// Classification used on the event bus.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::ValidationRejected(_) => ErrorKind::ValidationRejected,
            SandboxError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            SandboxError::QueueTimeout(_) => ErrorKind::QueueTimeout,
            SandboxError::SessionConcurrencyExceeded { .. } => {
                ErrorKind::SessionConcurrencyExceeded
            }
            SandboxError::RuntimeFailure(_) => ErrorKind::RuntimeFailure,
            SandboxError::Internal(_) => ErrorKind::Internal,
            SandboxError::Config(_) => ErrorKind::Config,
            SandboxError::Io(_) => ErrorKind::Io,
        }
    }

    /// Check if this error was raised at admission and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::ResourceExhausted(_)
                | SandboxError::QueueTimeout(_)
                | SandboxError::SessionConcurrencyExceeded { .. }
        )
    }

    /// Check if this error is an admission deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::QueueTimeout(_))
    }

    /// Check if this error represents a substrate fault.
    pub fn is_runtime_failure(&self) -> bool {
        matches!(self, SandboxError::RuntimeFailure(_))
    }

    /// Check if this error represents a validation rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SandboxError::ValidationRejected(_))
    }
}

impl From<Rejection> for SandboxError {
    fn from(rejection: Rejection) -> Self {
        SandboxError::ValidationRejected(rejection)
    }
}

#[cfg(feature = "docker")]
impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as DockerError;

        if let DockerError::DockerResponseServerError {
            status_code,
            message,
        } = &err
        {
            if *status_code == 503 || mentions_exhaustion(message) {
                return SandboxError::ResourceExhausted(message.clone());
            }
        }
        SandboxError::RuntimeFailure(err.into())
    }
}

#[cfg(feature = "docker")]
fn mentions_exhaustion(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["cannot allocate memory", "no space left", "resource temporarily unavailable", "insufficient"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
