//! Controller configuration.

use std::time::Duration;

/// What the dispatch handler does with an uncaught worker error once the
/// thread is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UncaughtErrorPolicy {
    /// Log the error. Pending tasks stay pending.
    #[default]
    Report,
    /// Log the error and reject every pending task with
    /// [`Error::WorkerCrashed`](crate::Error::WorkerCrashed).
    FailPending,
}

/// Thread controller configuration.
#[derive(Debug, Clone, Default)]
pub struct ThreadConfig {
    /// How long to wait for the worker's method announcement.
    /// `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Handling of uncaught worker errors after the handshake.
    pub uncaught_errors: UncaughtErrorPolicy,
}

impl ThreadConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the handshake if the worker has not announced itself after `timeout`.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Set the uncaught error policy.
    pub fn with_uncaught_errors(mut self, policy: UncaughtErrorPolicy) -> Self {
        self.uncaught_errors = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_waits_forever_and_reports() {
        let config = ThreadConfig::default();
        assert!(config.handshake_timeout.is_none());
        assert_eq!(config.uncaught_errors, UncaughtErrorPolicy::Report);
    }

    #[test]
    fn test_builder_setters() {
        let config = ThreadConfig::new()
            .with_handshake_timeout(Duration::from_millis(250))
            .with_uncaught_errors(UncaughtErrorPolicy::FailPending);
        assert_eq!(config.handshake_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.uncaught_errors, UncaughtErrorPolicy::FailPending);
    }
}
