use std::io;

use thiserror::Error;

/// Errors returned by the curlew reactor and its handles.
#[derive(Debug, Error)]
pub enum Error {
    /// Notification descriptor or readiness multiplexer failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A request field is malformed. Nothing was submitted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The submission channel is at capacity.
    #[error("submission queue full")]
    SubmissionQueueFull,
    /// The reactor no longer accepts submissions.
    #[error("reactor stopped")]
    ReactorStopped,
    /// Configuration rejected by [`Config::validate`](crate::Config::validate).
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// An engine factory could not create a session's transfer engine.
    #[error("engine: {0}")]
    Engine(String),
}

/// Failure of a single transfer, reported by its engine.
///
/// Carried to the consumer as the `error` string of a
/// [`Completion`](crate::Completion).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransferError {
    message: String,
}

impl TransferError {
    pub fn new(message: impl Into<String>) -> Self {
        TransferError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Abort the process after an unrecoverable multiplexer failure.
///
/// A readiness registration that fails leaves the reactor unable to drive
/// the socket, and every transfer on it would hang. There is no way to
/// report that to the engine, so the process stops.
pub(crate) fn fatal(what: &str, err: io::Error) -> ! {
    tracing::error!(error = %err, "{what} failed, aborting");
    std::process::abort()
}
