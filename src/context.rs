//! Execution contexts and per-context resource affinity.
//!
//! An execution context is one logical unit of work, e.g. a request, which may span many
//! suspension points. [`ContextBinding`] makes every [`get_or_acquire`](ContextBinding::get_or_acquire)
//! call within one context observe the same pooled resource, and returns that resource to its pool
//! when the context ends.

use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{MappedMutexGuard, Mutex, MutexGuard, OnceCell},
};
use tracing::{debug, debug_span, trace, Instrument};

use crate::{
    error::PoolError,
    factory::ResourceFactory,
    handle::PooledResource,
    registry::{PoolRegistry, RegistryError},
    resource::ResourceId,
};

/// Identifier of an execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ContextId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Error type returned by context operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContextError {
    /// Pool failed to provide a resource.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Pool lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Context is not known to the lifecycle manager.
    #[error("execution context {0} does not exist")]
    UnknownContext(ContextId),
    /// Context was already created.
    #[error("execution context {0} already exists")]
    AlreadyExists(ContextId),
}

/// Callback fired when an execution context ends.
pub type DestroyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Hook into execution context lifetime, provided by the host application.
pub trait ContextLifecycle: Send + Sync {
    /// Register a callback to be fired exactly once when `context` ends.
    ///
    /// # Errors
    ///
    /// Returns `Err` if callback could not be registered, e.g. if context does not exist.
    fn on_destroy(&self, context: ContextId, callback: DestroyCallback) -> Result<(), ContextError>;
}

/// Default in-process registry of execution contexts.
pub struct ContextManager {
    contexts: DashMap<ContextId, SyncMutex<Vec<DestroyCallback>>>,
    next_id: AtomicU64,
    /// Implicitly create unknown contexts when registering callbacks.
    auto_create: bool,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("contexts", &self.contexts.len())
            .field("auto_create", &self.auto_create)
            .finish()
    }
}

impl ContextManager {
    /// Create new context manager.
    #[must_use]
    pub fn new(auto_create: bool) -> Self {
        Self {
            contexts: DashMap::new(),
            next_id: AtomicU64::new(1),
            auto_create,
        }
    }

    /// Start a new context with a generated identifier.
    pub fn create(&self) -> ContextId {
        loop {
            let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
            if let Entry::Vacant(entry) = self.contexts.entry(id) {
                entry.insert(SyncMutex::default());
                trace!(context = %id, "context created");
                return id;
            }
        }
    }

    /// Start a new context with a host-provided identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AlreadyExists`] if context is already running.
    pub fn create_with_id(&self, id: ContextId) -> Result<(), ContextError> {
        match self.contexts.entry(id) {
            Entry::Occupied(_) => Err(ContextError::AlreadyExists(id)),
            Entry::Vacant(entry) => {
                entry.insert(SyncMutex::default());
                trace!(context = %id, "context created");
                Ok(())
            }
        }
    }

    /// End a context, firing all of its destroy callbacks.
    ///
    /// Returns number of callbacks fired.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::UnknownContext`] if context does not exist or has already ended.
    pub fn destroy(&self, id: ContextId) -> Result<usize, ContextError> {
        let (_, callbacks) = self
            .contexts
            .remove(&id)
            .ok_or(ContextError::UnknownContext(id))?;
        let callbacks = callbacks.into_inner();
        let num = callbacks.len();
        for callback in callbacks {
            callback();
        }
        trace!(context = %id, callbacks = num, "context destroyed");
        Ok(num)
    }

    /// Check whether context is running.
    #[must_use]
    pub fn exists(&self, id: ContextId) -> bool {
        self.contexts.contains_key(&id)
    }
}

impl ContextLifecycle for ContextManager {
    fn on_destroy(&self, context: ContextId, callback: DestroyCallback) -> Result<(), ContextError> {
        if self.auto_create {
            self.contexts.entry(context).or_default().lock().push(callback);
            return Ok(());
        }
        match self.contexts.get(&context) {
            Some(callbacks) => {
                callbacks.lock().push(callback);
                Ok(())
            }
            None => Err(ContextError::UnknownContext(context)),
        }
    }
}

type BindingKey = (ContextId, String);
type BindingMap = DashMap<BindingKey, Arc<dyn ErasedBinding>>;

/// Binding slot with its resource type erased.
trait ErasedBinding: Send + Sync {
    /// Unique binding identifier, tells apart successive bindings under the same key.
    fn binding_id(&self) -> u64;
    /// Return bound resource to its pool.
    fn release(&self);
    /// Nothing is bound, and no caller is trying to bind.
    fn is_vacant(&self) -> bool;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Binding slot, filled by the first acquisition in a context.
struct Slot<F: ResourceFactory> {
    id: u64,
    /// Callers currently inside [`ContextBinding::get_or_acquire`] for this slot.
    users: AtomicUsize,
    cell: OnceCell<BoundResource<F>>,
}

/// Marks a caller as using a binding slot until dropped.
struct SlotUser<F: ResourceFactory>(Arc<Slot<F>>);

impl<F: ResourceFactory> Drop for SlotUser<F> {
    fn drop(&mut self) {
        self.0.users.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<F: ResourceFactory> ErasedBinding for Slot<F> {
    fn binding_id(&self) -> u64 {
        self.id
    }

    fn release(&self) {
        if let Some(bound) = self.cell.get() {
            bound.release_now();
        }
    }

    fn is_vacant(&self) -> bool {
        self.users.load(Ordering::Acquire) == 0 && !self.cell.initialized()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Per-context affinity between execution contexts and pooled resources.
pub struct ContextBinding {
    registry: Arc<PoolRegistry>,
    lifecycle: Arc<dyn ContextLifecycle>,
    bindings: Arc<BindingMap>,
    next_id: AtomicU64,
}

impl fmt::Debug for ContextBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBinding")
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

impl ContextBinding {
    /// Create new context binding over pools of a registry.
    #[must_use]
    pub fn new(registry: Arc<PoolRegistry>, lifecycle: Arc<dyn ContextLifecycle>) -> Self {
        Self {
            registry,
            lifecycle,
            bindings: Arc::default(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Get resource bound to a context, acquiring it from pool `name` on first use.
    ///
    /// Concurrent first calls within one context acquire only once. The resource is returned to
    /// its pool when context ends, or earlier on explicit release.
    ///
    /// # Errors
    ///
    /// Returns `Err` if pool does not exist or holds another resource type, if acquisition
    /// failed, or if release callback could not be registered with the context lifecycle.
    pub async fn get_or_acquire<F: ResourceFactory>(
        &self,
        context: ContextId,
        name: &str,
    ) -> Result<BoundResource<F>, ContextError> {
        let key = (context, name.to_string());
        let user = {
            // Slot is claimed under the map shard lock, so it can't be removed as vacant meanwhile.
            let entry = self.bindings.entry(key.clone()).or_insert_with(|| {
                let slot: Arc<dyn ErasedBinding> = Arc::new(Slot::<F> {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    users: AtomicUsize::new(0),
                    cell: OnceCell::new(),
                });
                slot
            });
            let slot = Arc::clone(entry.value())
                .into_any()
                .downcast::<Slot<F>>()
                .map_err(|_| RegistryError::TypeMismatch {
                    name: name.to_string(),
                })?;
            slot.users.fetch_add(1, Ordering::AcqRel);
            SlotUser(slot)
        };
        let slot = Arc::clone(&user.0);
        let span = debug_span!("context_bind", %context, pool = name);
        let res = slot
            .cell
            .get_or_try_init(|| self.bind(context, key.clone(), slot.id).instrument(span))
            .await
            .cloned();
        drop(user);
        if res.is_err() {
            // Keep the slot if a concurrent caller is still trying, or has already succeeded.
            self.bindings
                .remove_if(&key, |_, entry| entry.binding_id() == slot.id && entry.is_vacant());
        }
        res
    }

    async fn bind<F: ResourceFactory>(
        &self,
        context: ContextId,
        key: BindingKey,
        binding_id: u64,
    ) -> Result<BoundResource<F>, ContextError> {
        let pool = self.registry.pool::<F>(&key.1)?;
        let timeout = pool.config().max_wait_time;
        let resource = pool.acquire_for(context, timeout).await?;
        let bound = BoundResource {
            inner: Arc::new(BoundInner {
                id: resource.id(),
                context,
                resource: Mutex::new(Some(resource)),
                bindings: Arc::downgrade(&self.bindings),
                key: key.clone(),
                binding_id,
            }),
        };
        let weak = Arc::downgrade(&self.bindings);
        self.lifecycle.on_destroy(
            context,
            Box::new(move || {
                if let Some((_, entry)) = weak
                    .upgrade()
                    .and_then(|map| map.remove_if(&key, |_, e| e.binding_id() == binding_id))
                {
                    entry.release();
                }
            }),
        )?;
        debug!(resource_id = %bound.id(), "resource bound to context");
        Ok(bound)
    }

    /// Release resource bound to a context before the context ends.
    ///
    /// Returns `false` if there was no binding.
    pub fn release(&self, context: ContextId, name: &str) -> bool {
        match self.bindings.remove(&(context, name.to_string())) {
            Some((_, entry)) => {
                entry.release();
                true
            }
            None => false,
        }
    }

    /// Check whether context holds a resource from pool `name`.
    #[must_use]
    pub fn is_bound(&self, context: ContextId, name: &str) -> bool {
        self.bindings.contains_key(&(context, name.to_string()))
    }
}

struct BoundInner<F: ResourceFactory> {
    id: ResourceId,
    context: ContextId,
    resource: Mutex<Option<PooledResource<F>>>,
    bindings: Weak<BindingMap>,
    key: BindingKey,
    binding_id: u64,
}

/// Resource bound to an execution context.
///
/// Cloning is cheap, all clones share the same checkout.
pub struct BoundResource<F: ResourceFactory> {
    inner: Arc<BoundInner<F>>,
}

impl<F: ResourceFactory> Clone for BoundResource<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for BoundResource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundResource")
            .field("id", &self.inner.id)
            .field("context", &self.inner.context)
            .field("pool", &self.inner.key.1)
            .finish()
    }
}

impl<F: ResourceFactory> BoundResource<F> {
    /// Identifier of the bound resource.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    /// Owning context.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.inner.context
    }

    /// Lock resource for exclusive use within the context.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Released`] if binding has already been released.
    pub async fn lock(&self) -> Result<MappedMutexGuard<'_, PooledResource<F>>, PoolError> {
        MutexGuard::try_map(self.inner.resource.lock().await, Option::as_mut)
            .map_err(|_| PoolError::Released)
    }

    /// Whether binding has already been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner
            .resource
            .try_lock()
            .is_ok_and(|guard| guard.is_none())
    }

    /// Clear the binding and return resource to its pool.
    ///
    /// Waits for the current lock holder, if any, to finish.
    pub async fn release(&self) {
        if let Some(map) = self.inner.bindings.upgrade() {
            map.remove_if(&self.inner.key, |_, e| {
                e.binding_id() == self.inner.binding_id
            });
        }
        drop(self.inner.resource.lock().await.take());
    }

    /// Return resource to its pool without suspending.
    ///
    /// If resource is locked at the moment, it is returned as soon as the lock is released.
    fn release_now(&self) {
        if let Ok(mut guard) = self.inner.resource.try_lock() {
            drop(guard.take());
            return;
        }
        let inner = Arc::clone(&self.inner);
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    drop(inner.resource.lock().await.take());
                });
            }
            // Resource goes back once the last clone is dropped.
            Err(_) => debug!(resource_id = %inner.id, "deferred release of bound resource"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{config::PoolConfig, testing::MockFactory};

    fn setup(max: usize) -> (Arc<PoolRegistry>, Arc<ContextManager>, ContextBinding) {
        let registry = Arc::new(PoolRegistry::new());
        let config = PoolConfig::default()
            .with_max_resources(max)
            .with_max_wait_time(Duration::from_millis(50));
        registry
            .register("db", config, MockFactory::default())
            .unwrap();
        let contexts = Arc::new(ContextManager::default());
        let binding = ContextBinding::new(Arc::clone(&registry), contexts.clone());
        (registry, contexts, binding)
    }

    /// Nested calls in one context share a resource, which is released once at context end.
    #[tokio::test]
    async fn context_affinity() {
        let (registry, contexts, binding) = setup(2);
        let ctx = contexts.create();
        let first = binding.get_or_acquire::<MockFactory>(ctx, "db").await.unwrap();
        let second = binding.get_or_acquire::<MockFactory>(ctx, "db").await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.stats("db").unwrap().busy, 1);

        let pool = registry.pool::<MockFactory>("db").unwrap();
        assert_eq!(pool.owner_of(first.id()), Some(ctx));
        drop((first, second));

        assert_eq!(contexts.destroy(ctx).unwrap(), 1);
        let stats = registry.stats("db").unwrap();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.idle, 1);
        assert!(!binding.is_bound(ctx, "db"));
    }

    /// Different contexts get different resources.
    #[tokio::test]
    async fn contexts_isolated() {
        let (_, contexts, binding) = setup(2);
        let (c1, c2) = (contexts.create(), contexts.create());
        let r1 = binding.get_or_acquire::<MockFactory>(c1, "db").await.unwrap();
        let r2 = binding.get_or_acquire::<MockFactory>(c2, "db").await.unwrap();
        assert_ne!(r1.id(), r2.id());
        assert_eq!(r1.context(), c1);
    }

    /// Concurrent first calls in one context acquire only once.
    #[tokio::test]
    async fn concurrent_first_use() {
        let (registry, contexts, binding) = setup(4);
        let factory = registry.pool::<MockFactory>("db").unwrap().factory().clone();
        factory.set_open_delay(Some(Duration::from_millis(5)));
        let ctx = contexts.create();
        let (a, b) = tokio::join!(
            binding.get_or_acquire::<MockFactory>(ctx, "db"),
            binding.get_or_acquire::<MockFactory>(ctx, "db"),
        );
        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(factory.opened(), 1);
    }

    /// Explicit release clears the binding, context end becomes a no-op for it.
    #[tokio::test]
    async fn explicit_release() {
        let (registry, contexts, binding) = setup(2);
        let ctx = contexts.create();
        let bound = binding.get_or_acquire::<MockFactory>(ctx, "db").await.unwrap();
        bound.release().await;
        assert!(bound.is_released());
        assert!(matches!(bound.lock().await, Err(PoolError::Released)));
        assert_eq!(registry.stats("db").unwrap().idle, 1);

        let rebound = binding.get_or_acquire::<MockFactory>(ctx, "db").await.unwrap();
        assert!(binding.release(ctx, "db"));
        assert!(!binding.release(ctx, "db"));
        assert!(rebound.is_released());

        assert_eq!(contexts.destroy(ctx).unwrap(), 2);
        let stats = registry.stats("db").unwrap();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.busy, 0);
    }

    /// Resource locked at context end is returned once the lock is released.
    #[tokio::test]
    async fn release_while_locked() {
        let (registry, contexts, binding) = setup(1);
        let ctx = contexts.create();
        let bound = binding.get_or_acquire::<MockFactory>(ctx, "db").await.unwrap();
        let mut guard = bound.lock().await.unwrap();
        guard.get_mut().unwrap().dirty = true;
        contexts.destroy(ctx).unwrap();
        assert_eq!(registry.stats("db").unwrap().busy, 1);
        drop(guard);
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.stats("db").unwrap().idle, 1);
    }

    /// Binding to an unknown context fails and leaves nothing checked out.
    #[tokio::test]
    async fn unknown_context() {
        let (registry, _, binding) = setup(1);
        let res = binding
            .get_or_acquire::<MockFactory>(ContextId::from(99), "db")
            .await;
        assert!(matches!(res, Err(ContextError::UnknownContext(_))));
        assert_eq!(registry.stats("db").unwrap().busy, 0);
        assert!(!binding.is_bound(ContextId::from(99), "db"));
    }

    /// Lookup errors are passed through.
    #[tokio::test]
    async fn unknown_pool() {
        let (_, contexts, binding) = setup(1);
        let ctx = contexts.create();
        let res = binding.get_or_acquire::<MockFactory>(ctx, "cache").await;
        assert!(matches!(
            res,
            Err(ContextError::Registry(RegistryError::NotFound(_)))
        ));
    }

    /// Auto-creating manager accepts callbacks for unknown contexts.
    #[test]
    fn manager_auto_create() {
        let manager = ContextManager::new(true);
        let ctx = ContextId::from(5);
        assert!(!manager.exists(ctx));
        manager.on_destroy(ctx, Box::new(|| ())).unwrap();
        assert!(manager.exists(ctx));
        assert_eq!(manager.destroy(ctx).unwrap(), 1);
        assert!(matches!(
            manager.destroy(ctx),
            Err(ContextError::UnknownContext(_))
        ));
    }

    /// Failed first acquisition does not break affinity for a concurrent caller in the context.
    #[tokio::test(start_paused = true)]
    async fn affinity_after_failed_first_acquire() {
        let (registry, contexts, binding) = setup(1);
        let pool = registry.pool::<MockFactory>("db").unwrap();
        let blocker = pool.acquire().await.unwrap();
        let ctx = contexts.create();
        let (first, second, ()) = tokio::join!(
            binding.get_or_acquire::<MockFactory>(ctx, "db"),
            binding.get_or_acquire::<MockFactory>(ctx, "db"),
            async move {
                tokio::time::sleep(Duration::from_millis(75)).await;
                drop(blocker);
            },
        );
        assert!(matches!(
            first,
            Err(ContextError::Pool(PoolError::Timeout(_)))
        ));
        let second = second.unwrap();
        assert!(binding.is_bound(ctx, "db"));

        let again = binding.get_or_acquire::<MockFactory>(ctx, "db").await.unwrap();
        assert_eq!(again.id(), second.id());
        assert_eq!(contexts.destroy(ctx).unwrap(), 1);
        assert_eq!(pool.stats().busy, 0);
        assert!(!binding.is_bound(ctx, "db"));
    }

    /// Manager can be shared between threads as a lifecycle hook.
    #[test]
    fn manager_as_lifecycle() {
        let manager = Arc::new(ContextManager::default());
        let lifecycle: Arc<dyn ContextLifecycle> = manager.clone();
        let ctx = manager.create();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        std::thread::spawn(move || {
            lifecycle
                .on_destroy(
                    ctx,
                    Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(manager.destroy(ctx).unwrap(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    /// Host-provided identifiers must be unique.
    #[test]
    fn manager_explicit_ids() {
        let manager = ContextManager::default();
        let ctx = ContextId::from(1);
        manager.create_with_id(ctx).unwrap();
        assert!(matches!(
            manager.create_with_id(ctx),
            Err(ContextError::AlreadyExists(_))
        ));
        assert_ne!(manager.create(), ctx);
    }
}
