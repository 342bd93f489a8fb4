//! Error types for tether-core.

use std::time::Duration;

use thiserror::Error;

/// Result type for tether-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tether-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Worker reported an uncaught error before announcing its methods.
    #[error("worker failed to initialize: {0}")]
    Init(String),

    /// Worker did not announce its methods in time.
    #[error("worker did not announce its methods within {0:?}")]
    HandshakeTimeout(Duration),

    /// Worker reported an error for a specific task.
    ///
    /// Displays as the worker's message, unchanged.
    #[error("{0}")]
    Task(String),

    /// Worker faulted outside of any task while this task was pending.
    #[error("uncaught error in worker: {0}")]
    WorkerCrashed(String),

    /// Method was not announced by the worker.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Controller has been terminated.
    #[error("thread has been terminated")]
    Terminated,

    /// Result handle lost its controller before settling.
    #[error("task was dropped before it settled")]
    Canceled,

    /// Communication with the worker failed.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Message carried by a worker-reported failure, if any.
    pub fn worker_message(&self) -> Option<&str> {
        match self {
            Self::Init(message) | Self::Task(message) | Self::WorkerCrashed(message) => {
                Some(message)
            }
            _ => None,
        }
    }
}
