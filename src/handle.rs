//! Handle to a checked-out resource.

use std::{fmt, sync::atomic::Ordering};

use crate::{
    context::ContextId,
    error::PoolError,
    factory::ResourceFactory,
    pool::Pool,
    resource::ResourceId,
    wait::Checkout,
};

/// How a checkout ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Reset, health-check and return to the pool.
    Release,
    /// Close without any checks.
    Invalidate,
}

/// Exclusive handle to a resource checked out of a [`Pool`].
///
/// Resource is returned to the pool when the handle is dropped.
pub struct PooledResource<F: ResourceFactory> {
    /// Originating pool.
    pool: Pool<F>,
    id: ResourceId,
    /// Taken out only when checkout ends.
    checkout: Option<Checkout<F::Resource>>,
}

impl<F: ResourceFactory> PooledResource<F> {
    pub(crate) fn new(pool: Pool<F>, checkout: Checkout<F::Resource>) -> Self {
        Self {
            pool,
            id: checkout.resource.id(),
            checkout: Some(checkout),
        }
    }

    /// Resource identifier, unique within its pool.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Context this resource was checked out for.
    #[must_use]
    pub fn owner(&self) -> Option<ContextId> {
        self.checkout.as_ref().and_then(|c| c.resource.owner())
    }

    /// Number of checkouts of this resource, including the current one.
    #[must_use]
    pub fn use_count(&self) -> u64 {
        self.checkout.as_ref().map_or(0, |c| c.resource.use_count())
    }

    /// Whether the pool has written this checkout off while draining.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.checkout
            .as_ref()
            .map_or(true, |c| c.revoked.load(Ordering::Acquire))
    }

    /// Originating pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<F> {
        &self.pool
    }

    /// Access raw resource.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::DrainDeadlineExceeded`] if pool drain has force-closed this checkout.
    pub fn get(&self) -> Result<&F::Resource, PoolError> {
        match &self.checkout {
            Some(c) if !c.revoked.load(Ordering::Acquire) => Ok(c.resource.raw()),
            Some(_) => Err(PoolError::DrainDeadlineExceeded),
            None => Err(PoolError::Released),
        }
    }

    /// Mutably access raw resource.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::DrainDeadlineExceeded`] if pool drain has force-closed this checkout.
    pub fn get_mut(&mut self) -> Result<&mut F::Resource, PoolError> {
        match &mut self.checkout {
            Some(c) if !c.revoked.load(Ordering::Acquire) => Ok(c.resource.raw_mut()),
            Some(_) => Err(PoolError::DrainDeadlineExceeded),
            None => Err(PoolError::Released),
        }
    }

    /// Return resource to the pool.
    ///
    /// Same as dropping the handle.
    pub fn release(self) {
        drop(self);
    }

    /// Close a broken resource instead of returning it to the pool.
    pub fn invalidate(mut self) {
        self.finish(Disposition::Invalidate);
    }

    fn finish(&mut self, disposition: Disposition) {
        if let Some(checkout) = self.checkout.take() {
            self.pool.checkin(checkout, disposition);
        }
    }
}

impl<F: ResourceFactory> Drop for PooledResource<F> {
    fn drop(&mut self) {
        self.finish(Disposition::Release);
    }
}

impl<F: ResourceFactory> fmt::Debug for PooledResource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("pool", &self.pool.name())
            .field("id", &self.id)
            .field("owner", &self.owner())
            .field("revoked", &self.is_revoked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{config::PoolConfig, testing::MockFactory};

    /// Raw resource is reachable through the handle.
    #[tokio::test]
    async fn access() {
        let pool = Pool::new("handle", PoolConfig::default(), MockFactory::default()).unwrap();
        let mut res = pool.acquire().await.unwrap();
        assert_eq!(res.get().unwrap().serial, res.id().get());
        res.get_mut().unwrap().dirty = true;
        assert!(!res.is_revoked());
        assert_eq!(res.use_count(), 1);
        assert_eq!(res.pool().name(), "handle");
    }

    /// Dropping a handle returns resource, reset is applied.
    #[tokio::test]
    async fn drop_returns() {
        let pool = Pool::new("handle", PoolConfig::default(), MockFactory::default()).unwrap();
        let mut res = pool.acquire().await.unwrap();
        res.get_mut().unwrap().dirty = true;
        drop(res);
        assert_eq!(pool.stats().idle, 1);
        let res = pool.acquire_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(!res.get().unwrap().dirty);
    }

    /// Debug output includes pool name and resource id.
    #[tokio::test]
    async fn debug_format() {
        let pool = Pool::new("dbg", PoolConfig::default(), MockFactory::default()).unwrap();
        let res = pool.acquire().await.unwrap();
        let out = format!("{res:?}");
        assert!(out.contains("\"dbg\""));
        assert!(out.contains("id: ResourceId(1)"));
    }
}
