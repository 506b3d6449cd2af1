//! Interface between pools and concrete resource types.

use crate::error::BoxError;

/// Opens, closes, health-checks and resets resources of one concrete type.
///
/// Only [`open`](Self::open) may suspend. Other methods are called on the release path, which
/// runs inside [`Drop`] and never suspends, so they must be quick and non-blocking. A connection
/// whose liveness can only be established by a network round-trip should report the last known
/// state in [`check_state`](Self::check_state).
#[async_trait::async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    /// Raw resource type, e.g. a database connection.
    type Resource: Send + 'static;

    /// Open new raw resource.
    ///
    /// # Errors
    ///
    /// Returns `Err` if resource could not be created. Pool reports this to the acquiring caller
    /// as [`PoolError::CreateFailed`](crate::PoolError::CreateFailed) without retrying.
    async fn open(&self) -> Result<Self::Resource, BoxError>;

    /// Close raw resource.
    ///
    /// Resource is never used again after this call.
    fn close(&self, resource: Self::Resource) {
        drop(resource);
    }

    /// Check whether resource is still usable.
    fn check_state(&self, _resource: &mut Self::Resource) -> bool {
        true
    }

    /// Scrub per-use state before the resource is handed out again.
    ///
    /// Returns `false` if resource could not be brought to a clean state, in which case it gets
    /// closed.
    fn reset(&self, _resource: &mut Self::Resource) -> bool {
        true
    }
}
