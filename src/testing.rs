//! Scriptable resource factory for unit tests.

use std::{
    collections::HashSet,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{error::BoxError, factory::ResourceFactory, resource::ResourceId};

/// Fake connection.
#[derive(Debug)]
pub(crate) struct MockConn {
    /// Sequence number of this connection, starting from 1.
    ///
    /// Matches pool resource identifier as long as resources are opened one at a time.
    pub(crate) serial: u64,
    /// Set by users, cleared on reset.
    pub(crate) dirty: bool,
}

#[derive(Debug, Default)]
struct MockState {
    opened: AtomicU64,
    closed: AtomicU64,
    fail_open: AtomicBool,
    fail_reset: AtomicBool,
    unhealthy: Mutex<HashSet<u64>>,
    open_delay: Mutex<Option<Duration>>,
}

/// Factory of [`MockConn`] with switchable failure modes.
///
/// Clones share state, so a test can keep one clone while the pool owns another.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    /// Number of successfully opened connections.
    pub(crate) fn opened(&self) -> u64 {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Number of closed connections.
    pub(crate) fn closed(&self) -> u64 {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Make subsequent opens fail.
    pub(crate) fn fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent resets fail.
    pub(crate) fn fail_reset(&self, fail: bool) {
        self.state.fail_reset.store(fail, Ordering::SeqCst);
    }

    /// Mark connection as broken or repaired.
    pub(crate) fn set_healthy(&self, id: ResourceId, healthy: bool) {
        let mut unhealthy = self.state.unhealthy.lock();
        if healthy {
            unhealthy.remove(&id.get());
        } else {
            unhealthy.insert(id.get());
        }
    }

    /// Make each open take this long.
    pub(crate) fn set_open_delay(&self, delay: Option<Duration>) {
        *self.state.open_delay.lock() = delay;
    }
}

#[async_trait::async_trait]
impl ResourceFactory for MockFactory {
    type Resource = MockConn;

    async fn open(&self) -> Result<Self::Resource, BoxError> {
        let delay = *self.state.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "mock refused").into());
        }
        let serial = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConn {
            serial,
            dirty: false,
        })
    }

    fn close(&self, _resource: Self::Resource) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn check_state(&self, resource: &mut Self::Resource) -> bool {
        !self.state.unhealthy.lock().contains(&resource.serial)
    }

    fn reset(&self, resource: &mut Self::Resource) -> bool {
        if self.state.fail_reset.load(Ordering::SeqCst) {
            return false;
        }
        resource.dirty = false;
        true
    }
}
