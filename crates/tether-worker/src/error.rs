//! Error types for tether-worker.

use thiserror::Error;

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised on the worker side.
///
/// Handler failures are reported to the controller using their `Display`
/// text, so [`Error::Handler`] shows its message unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// Tether core error.
    #[error("{0}")]
    Core(#[from] tether_core::Error),

    /// Method is not exposed by this module.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Arguments did not match what the method expects.
    #[error("invalid arguments for {method}: {message}")]
    InvalidArguments { method: String, message: String },

    /// The method itself failed.
    #[error("{0}")]
    Handler(String),

    /// The method panicked.
    #[error("method {method} panicked: {message}")]
    Panic { method: String, message: String },
}

impl Error {
    /// Create a handler error from any message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}
