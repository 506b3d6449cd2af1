//! Error types and error support code.

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by a [`ResourceFactory`](crate::ResourceFactory) implementation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type returned by pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No resource became available within the allowed waiting time.
    #[error("timed out after {0:?} waiting for a pooled resource")]
    Timeout(Duration),
    /// Resource factory was unable to open a new resource.
    #[error("unable to create pooled resource: {0}")]
    CreateFailed(#[source] BoxError),
    /// Pool is draining or already closed, no new acquisitions are admitted.
    #[error("pool is closed")]
    Closed,
    /// Call would suspend, and non-blocking operation was requested.
    #[error("acquisition from pool would block execution")]
    WouldBlock,
    /// Resource was force-closed when pool drain deadline passed.
    #[error("resource was force-closed by pool drain")]
    DrainDeadlineExceeded,
    /// Resource checkout has already ended.
    #[error("resource was already released")]
    Released,
}

impl PoolError {
    /// Whether the caller may retry the same operation later, preferably with a backoff.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::CreateFailed(_) | Self::WouldBlock)
    }
}

/// Reason for closing a pooled resource.
///
/// Never surfaced to pool users, only logged and counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// Health check failed.
    Unhealthy,
    /// Per-use state could not be scrubbed.
    ResetFailed,
    /// Maximum number of checkouts reached.
    UseLimit,
    /// Resource sat idle for too long.
    IdleTimeout,
    /// Checkout holder reported resource as broken.
    Invalidated,
    /// Pool is draining or closed.
    Drained,
    /// Resource was still checked out when drain deadline passed.
    DrainDeadline,
}

impl CloseReason {
    /// Short name used in logs.
    #[must_use]
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Unhealthy => "unhealthy",
            Self::ResetFailed => "reset_failed",
            Self::UseLimit => "use_limit",
            Self::IdleTimeout => "idle_timeout",
            Self::Invalidated => "invalidated",
            Self::Drained => "drained",
            Self::DrainDeadline => "drain_deadline",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Timeouts and creation errors are recoverable, closed pool is not.
    #[test]
    fn recoverable_errors() {
        assert!(PoolError::Timeout(Duration::from_millis(5)).is_recoverable());
        assert!(PoolError::CreateFailed("refused".into()).is_recoverable());
        assert!(!PoolError::Closed.is_recoverable());
        assert!(!PoolError::DrainDeadlineExceeded.is_recoverable());
    }

    /// Creation error keeps factory error as its source.
    #[test]
    fn create_failed_source() {
        let err = PoolError::CreateFailed("connection refused".into());
        assert_eq!(
            err.to_string(),
            "unable to create pooled resource: connection refused"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
