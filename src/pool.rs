//! Resource pool.

use std::{
    borrow::Cow,
    collections::HashMap,
    fmt, mem,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use opentelemetry::KeyValue;
use parking_lot::{Mutex, MutexGuard};
use tokio::{
    runtime::Handle,
    sync::{oneshot, Notify},
    time::{timeout_at, Instant},
};
use tracing::{debug, debug_span, info, info_span, trace, warn, Instrument};

use crate::{
    config::{ConfigError, PoolConfig},
    context::ContextId,
    error::{CloseReason, PoolError},
    factory::ResourceFactory,
    handle::{Disposition, PooledResource},
    metrics::{pool_kv, Metrics, POOL_METRICS},
    reaper::IdleReaper,
    resource::{PoolResource, ResourceId},
    wait::{Checkout, Grant, WaitQueue},
};

/// Interval between gathering pool occupancy metrics.
const PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Deadline used for practically unbounded waits.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Snapshot of pool occupancy and lifetime counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Resources ready to be checked out.
    pub idle: usize,
    /// Resources currently checked out.
    pub busy: usize,
    /// Acquisitions suspended in the wait queue.
    pub waiting: usize,
    /// Slots reserved by resource creations or health checks in flight.
    pub pending: usize,
    /// Maximum number of resources.
    pub max: usize,
    /// Resources opened over pool lifetime.
    pub created: u64,
    /// Resources closed over pool lifetime.
    pub closed: u64,
    /// Acquisitions that failed with a timeout.
    pub timeouts: u64,
    /// Pool no longer admits acquisitions.
    pub draining: bool,
}

impl PoolStats {
    /// Idle and checked-out resources combined.
    #[must_use]
    pub fn size(&self) -> usize {
        self.idle + self.busy
    }
}

/// Outcome of draining a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct DrainReport {
    /// Idle resources closed when drain started.
    pub idle_closed: usize,
    /// Waiting acquisitions rejected when drain started.
    pub waiters_rejected: usize,
    /// Resources that were checked out when drain started.
    pub busy_at_start: usize,
    /// Resources still checked out at the deadline, and thus force-closed.
    pub forced: usize,
}

impl DrainReport {
    /// Whether every checkout ended before the deadline.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.forced == 0
    }
}

/// Bookkeeping record of a checked-out resource.
struct BusyEntry {
    owner: Option<ContextId>,
    revoked: Arc<AtomicBool>,
}

/// Mutable pool state.
///
/// Every section holding the lock is short and never suspends.
pub(crate) struct PoolState<R> {
    /// Idle resources, most recently used last.
    idle: Vec<PoolResource<R>>,
    /// Checked-out resources.
    busy: HashMap<ResourceId, BusyEntry>,
    /// Slots reserved for creations and health checks in flight.
    pending: usize,
    /// Replenishment tasks spawned, but not started yet.
    scheduled: usize,
    waiters: WaitQueue<R>,
    next_id: u64,
    draining: bool,
    created: u64,
    closed: u64,
    timeouts: u64,
}

impl<R> PoolState<R> {
    fn new(max: usize) -> Self {
        Self {
            idle: Vec::with_capacity(max),
            busy: HashMap::with_capacity(max),
            pending: 0,
            scheduled: 0,
            waiters: WaitQueue::default(),
            next_id: 1,
            draining: false,
            created: 0,
            closed: 0,
            timeouts: 0,
        }
    }

    /// Number of resources counted against the pool size limit.
    fn size(&self) -> usize {
        self.idle.len() + self.busy.len() + self.pending
    }

    fn next_id(&mut self) -> ResourceId {
        let id = ResourceId::from(self.next_id);
        self.next_id += 1;
        id
    }

    fn reserve_slot(&mut self) {
        self.pending += 1;
    }

    fn release_slot(&mut self) {
        self.pending -= 1;
    }

    fn stats(&self, max: usize) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            busy: self.busy.len(),
            waiting: self.waiters.len(),
            pending: self.pending,
            max,
            created: self.created,
            closed: self.closed,
            timeouts: self.timeouts,
            draining: self.draining,
        }
    }
}

/// Shared pool internals.
pub(crate) struct PoolInner<F: ResourceFactory> {
    name: Cow<'static, str>,
    config: PoolConfig,
    factory: F,
    state: Mutex<PoolState<F::Resource>>,
    /// Woken when the last checkout or creation ends while draining.
    drained: Notify,
    /// Premade pool label used to record metrics.
    label: [KeyValue; 1],
    /// Linked metrics storage.
    metrics: Arc<Metrics>,
    /// Time of last gathering of pool occupancy metrics.
    last_gathered_at: Mutex<Instant>,
    reaper: Mutex<IdleReaper>,
}

impl<F: ResourceFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        let idle = mem::take(&mut self.state.get_mut().idle);
        for res in idle {
            self.factory.close(res.into_closed());
        }
    }
}

/// What to do with a freshly opened resource.
#[derive(Clone, Copy, Debug)]
enum OpenTarget {
    /// Check out to the caller.
    Caller(Option<ContextId>),
    /// Place into the pool, serving the oldest waiter first.
    Pool,
}

/// Result of the non-suspending part of an acquisition.
enum Step<R> {
    /// Verify popped idle resource.
    Verify(PoolResource<R>),
    /// Open a new resource, slot already reserved.
    Create,
    /// Wait for a resource to be handed over.
    Wait(u64, oneshot::Receiver<Grant<R>>),
}

/// Bounded pool of resources produced by a [`ResourceFactory`].
///
/// Cloning is cheap, all clones refer to the same pool.
pub struct Pool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<F: ResourceFactory> Pool<F> {
    /// Create a new pool.
    ///
    /// When called within a Tokio runtime, the pool starts filling itself up to
    /// [`PoolConfig::min_resources`] in background, and starts an idle resource reaper if
    /// [`PoolConfig::idle_timeout`] is set.
    ///
    /// # Errors
    ///
    /// Returns `Err` if pool size bounds are invalid.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        config: PoolConfig,
        factory: F,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();
        let pool = Self {
            inner: Arc::new(PoolInner {
                label: pool_kv(name.clone()),
                name,
                state: Mutex::new(PoolState::new(config.max_resources)),
                config,
                factory,
                drained: Notify::new(),
                metrics: POOL_METRICS.deref().clone(),
                last_gathered_at: Mutex::new(Instant::now()),
                reaper: Mutex::new(IdleReaper::default()),
            }),
        };
        if let Some(idle_timeout) = pool.inner.config.idle_timeout {
            pool.inner.reaper.lock().start(&pool, idle_timeout);
        }
        pool.schedule_replenish(&mut pool.lock());
        pool.record_state();
        Ok(pool)
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Resource factory used by this pool.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Resource>> {
        self.inner.state.lock()
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<PoolInner<F>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner<F>>) -> Self {
        Self { inner }
    }

    /// Acquire a resource, waiting up to [`PoolConfig::max_wait_time`].
    ///
    /// # Errors
    ///
    /// See [`Self::acquire_timeout`].
    pub async fn acquire(&self) -> Result<PooledResource<F>, PoolError> {
        self.checkout(None, self.inner.config.max_wait_time).await
    }

    /// Acquire a resource, waiting up to `timeout`.
    ///
    /// Idle resources are reused most recently used first, after passing a health check. If
    /// none are available and the pool is not full, a new resource is opened. Otherwise the call
    /// waits in line: released resources go to the longest waiting caller.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Timeout`] if no resource became available in time,
    /// [`PoolError::CreateFailed`] if the factory failed to open a resource, and
    /// [`PoolError::Closed`] if pool is draining.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledResource<F>, PoolError> {
        self.checkout(None, timeout).await
    }

    /// Acquire a resource on behalf of an execution context, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Self::acquire_timeout`].
    pub async fn acquire_for(
        &self,
        context: ContextId,
        timeout: Duration,
    ) -> Result<PooledResource<F>, PoolError> {
        self.checkout(Some(context), timeout).await
    }

    /// Instantly acquire an idle resource.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::WouldBlock`] if no healthy idle resource is available, or if other
    /// callers are already waiting. Returns [`PoolError::Closed`] if pool is draining.
    pub fn try_acquire(&self) -> Result<PooledResource<F>, PoolError> {
        let _span = debug_span!("pool_try_acquire", name = %self.inner.name).entered();
        loop {
            let res = {
                let mut state = self.lock();
                if state.draining {
                    return Err(PoolError::Closed);
                }
                if !state.waiters.is_empty() {
                    return Err(PoolError::WouldBlock);
                }
                let res = state.idle.pop().ok_or(PoolError::WouldBlock)?;
                state.reserve_slot();
                res
            };
            if let Some(handle) = self.verify_idle(res, None)? {
                self.record_state();
                return Ok(handle);
            }
        }
    }

    async fn checkout(
        &self,
        owner: Option<ContextId>,
        timeout: Duration,
    ) -> Result<PooledResource<F>, PoolError> {
        let started = Instant::now();
        let span = debug_span!("pool_acquire", name = %self.inner.name, context = ?owner);
        let res = self
            .checkout_inner(owner, deadline_after(started, timeout), timeout)
            .instrument(span)
            .await;
        match &res {
            Ok(_) => Metrics::record_time(
                &self.inner.metrics.wait_time,
                &self.inner.label,
                started.elapsed(),
            ),
            Err(PoolError::Timeout(_)) => {
                self.lock().timeouts += 1;
                self.inner.metrics.timeouts.add(1, &self.inner.label);
                debug!(name = %self.inner.name, ?timeout, "pool acquisition timed out");
            }
            Err(_) => (),
        }
        self.record_state();
        res
    }

    async fn checkout_inner(
        &self,
        owner: Option<ContextId>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PooledResource<F>, PoolError> {
        loop {
            let step = {
                let mut state = self.lock();
                if state.draining {
                    return Err(PoolError::Closed);
                }
                if !state.waiters.is_empty() {
                    // Queue is non-empty: newcomers line up behind earlier callers.
                    self.enqueue(&mut state, owner, deadline)
                } else if let Some(res) = state.idle.pop() {
                    state.reserve_slot();
                    Step::Verify(res)
                } else if state.size() < self.inner.config.max_resources {
                    state.reserve_slot();
                    Step::Create
                } else {
                    self.enqueue(&mut state, owner, deadline)
                }
            };
            match step {
                Step::Verify(res) => {
                    if let Some(handle) = self.verify_idle(res, owner)? {
                        return Ok(handle);
                    }
                }
                Step::Create => {
                    let reservation = Reservation::new(self);
                    return self.create(reservation, owner, deadline, timeout).await;
                }
                Step::Wait(ticket, rx) => {
                    return self.wait(ticket, rx, owner, deadline, timeout).await;
                }
            }
        }
    }

    fn enqueue(
        &self,
        state: &mut PoolState<F::Resource>,
        owner: Option<ContextId>,
        deadline: Instant,
    ) -> Step<F::Resource> {
        let (ticket, rx) = state.waiters.push(owner, deadline);
        trace!(ticket, waiting = state.waiters.len(), "acquisition enqueued");
        self.grant_slots(state);
        Step::Wait(ticket, rx)
    }

    /// Health-check an idle resource popped from the pool, with its slot already reserved.
    ///
    /// Returns `Ok(None)` if resource had to be discarded.
    fn verify_idle(
        &self,
        mut res: PoolResource<F::Resource>,
        owner: Option<ContextId>,
    ) -> Result<Option<PooledResource<F>>, PoolError> {
        let reason = if res.idle_expired(self.inner.config.idle_timeout, Instant::now()) {
            Some(CloseReason::IdleTimeout)
        } else if !self.inner.factory.check_state(res.raw_mut()) {
            Some(CloseReason::Unhealthy)
        } else {
            None
        };
        let mut state = self.lock();
        state.release_slot();
        let reason = match reason {
            None if state.draining => Some(CloseReason::Drained),
            reason => reason,
        };
        match reason {
            None => Ok(Some(self.hand_out(&mut state, res, owner))),
            Some(reason) => {
                state.closed += 1;
                let draining = state.draining;
                self.grant_slots(&mut state);
                self.schedule_replenish(&mut state);
                self.notify_if_drained(&state);
                drop(state);
                self.close_resource(res, reason);
                if draining {
                    Err(PoolError::Closed)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Open a new resource into a reserved slot.
    async fn open_resource(
        &self,
        reservation: Reservation<'_, F>,
        target: OpenTarget,
    ) -> Result<Option<PooledResource<F>>, PoolError> {
        let started = Instant::now();
        let opened = self.inner.factory.open().await;
        Metrics::record_time(
            &self.inner.metrics.create_time,
            &self.inner.label,
            started.elapsed(),
        );
        let mut state = self.lock();
        reservation.settle(&mut state);
        let raw = match opened {
            Ok(raw) => raw,
            Err(err) => {
                // Next waiter in line tries on its own.
                self.grant_slots(&mut state);
                self.notify_if_drained(&state);
                drop(state);
                warn!(name = %self.inner.name, error = %err, "unable to open resource");
                return Err(PoolError::CreateFailed(err));
            }
        };
        let id = state.next_id();
        state.created += 1;
        let mut res = PoolResource::new(id, raw);
        if state.draining {
            state.closed += 1;
            self.notify_if_drained(&state);
            drop(state);
            self.close_resource(res, CloseReason::Drained);
            return Err(PoolError::Closed);
        }
        res.mark_idle();
        debug!(name = %self.inner.name, resource_id = %id, "resource opened");
        match target {
            OpenTarget::Caller(owner) => Ok(Some(self.hand_out(&mut state, res, owner))),
            OpenTarget::Pool => {
                self.put_back(&mut state, res);
                Ok(None)
            }
        }
    }

    /// Open a resource for the caller into a reserved slot, giving up at `deadline`.
    async fn create(
        &self,
        reservation: Reservation<'_, F>,
        owner: Option<ContextId>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PooledResource<F>, PoolError> {
        let opening = self.open_resource(reservation, OpenTarget::Caller(owner));
        match timeout_at(deadline, opening).await {
            Ok(res) => res?.ok_or(PoolError::Closed),
            Err(_) => {
                debug!(name = %self.inner.name, "resource was not opened in time");
                Err(PoolError::Timeout(timeout))
            }
        }
    }

    /// Wait in line for a resource, or for a free slot to open one.
    async fn wait(
        &self,
        ticket: u64,
        rx: oneshot::Receiver<Grant<F::Resource>>,
        owner: Option<ContextId>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PooledResource<F>, PoolError> {
        let mut waiter = Waiter {
            pool: self,
            ticket,
            rx,
            done: false,
        };
        let grant = match timeout_at(deadline, &mut waiter.rx).await {
            Ok(Ok(grant)) => {
                waiter.done = true;
                grant
            }
            Ok(Err(_)) => {
                // Ticket was dropped: either pool is draining, or deadline passed.
                waiter.done = true;
                return if self.lock().draining {
                    Err(PoolError::Closed)
                } else {
                    Err(PoolError::Timeout(timeout))
                };
            }
            Err(_) => match waiter.abandon() {
                // Resource arrived just as the deadline passed.
                Some(Grant::Resource(checkout)) => {
                    return Ok(PooledResource::new(self.clone(), checkout))
                }
                Some(grant @ Grant::Slot) => {
                    self.return_grant(grant);
                    return Err(PoolError::Timeout(timeout));
                }
                None => return Err(PoolError::Timeout(timeout)),
            },
        };
        match grant {
            Grant::Resource(checkout) => Ok(PooledResource::new(self.clone(), checkout)),
            Grant::Slot => {
                trace!(ticket, "opening resource in granted slot");
                let reservation = Reservation::new(self);
                self.create(reservation, owner, deadline, timeout).await
            }
        }
    }

    /// Give back whatever an abandoned waiter was resumed with.
    fn return_grant(&self, grant: Grant<F::Resource>) {
        match grant {
            Grant::Resource(checkout) => self.checkin(checkout, Disposition::Release),
            Grant::Slot => drop(Reservation::new(self)),
        }
    }

    /// Register resource as checked out by `owner` and wrap it into a handle.
    fn hand_out(
        &self,
        state: &mut PoolState<F::Resource>,
        mut res: PoolResource<F::Resource>,
        owner: Option<ContextId>,
    ) -> PooledResource<F> {
        res.mark_busy(owner);
        let revoked = Arc::<AtomicBool>::default();
        state.busy.insert(
            res.id(),
            BusyEntry {
                owner,
                revoked: Arc::clone(&revoked),
            },
        );
        PooledResource::new(
            self.clone(),
            Checkout {
                resource: res,
                revoked,
            },
        )
    }

    /// Give an idle resource to the oldest waiter, or return it to the idle set.
    fn put_back(&self, state: &mut PoolState<F::Resource>, mut res: PoolResource<F::Resource>) {
        let id = res.id();
        let now = Instant::now();
        while let Some(ticket) = state.waiters.pop_live(now) {
            let owner = ticket.context();
            res.mark_busy(owner);
            let revoked = Arc::<AtomicBool>::default();
            state.busy.insert(
                id,
                BusyEntry {
                    owner,
                    revoked: Arc::clone(&revoked),
                },
            );
            match ticket.resume(Checkout {
                resource: res,
                revoked,
            }) {
                Ok(()) => {
                    trace!(resource_id = %id, "resource handed to waiter");
                    return;
                }
                Err(back) => {
                    state.busy.remove(&id);
                    res = back.resource;
                    res.cancel_checkout();
                }
            }
        }
        state.idle.push(res);
    }

    /// End a checkout.
    ///
    /// Never suspends. Replacement resources, if needed, are opened by separate tasks.
    pub(crate) fn checkin(&self, checkout: Checkout<F::Resource>, disposition: Disposition) {
        let Checkout {
            resource: mut res,
            revoked,
        } = checkout;
        let id = res.id();
        Metrics::record_time(
            &self.inner.metrics.use_time,
            &self.inner.label,
            res.last_active_at().elapsed(),
        );
        let reason = if revoked.load(Ordering::Acquire) {
            Some(CloseReason::DrainDeadline)
        } else {
            match disposition {
                Disposition::Invalidate => Some(CloseReason::Invalidated),
                Disposition::Release => {
                    let factory = &self.inner.factory;
                    if !factory.reset(res.raw_mut()) {
                        Some(CloseReason::ResetFailed)
                    } else if !factory.check_state(res.raw_mut()) {
                        Some(CloseReason::Unhealthy)
                    } else if self.inner.config.use_limit_reached(res.use_count()) {
                        Some(CloseReason::UseLimit)
                    } else {
                        None
                    }
                }
            }
        };
        let mut state = self.lock();
        let was_busy = state.busy.remove(&id).is_some();
        let reason = match reason {
            // Already written off by a forced drain.
            _ if !was_busy => Some(CloseReason::DrainDeadline),
            None if state.draining => Some(CloseReason::Drained),
            reason => reason,
        };
        match reason {
            None => {
                res.mark_idle();
                self.put_back(&mut state, res);
                drop(state);
            }
            Some(reason) => {
                if was_busy {
                    state.closed += 1;
                }
                self.grant_slots(&mut state);
                self.schedule_replenish(&mut state);
                self.notify_if_drained(&state);
                drop(state);
                self.close_resource(res, reason);
            }
        }
        self.record_state();
    }

    fn close_resource(&self, res: PoolResource<F::Resource>, reason: CloseReason) {
        let id = res.id();
        let use_count = res.use_count();
        self.inner.factory.close(res.into_closed());
        debug!(
            name = %self.inner.name,
            resource_id = %id,
            use_count,
            reason = reason.as_str(),
            "resource closed"
        );
    }

    fn notify_if_drained(&self, state: &PoolState<F::Resource>) {
        if state.draining && state.busy.is_empty() && state.pending == 0 {
            self.inner.drained.notify_waiters();
        }
    }

    /// Hand free capacity to the oldest waiters, which then open resources themselves.
    fn grant_slots(&self, state: &mut PoolState<F::Resource>) {
        if state.draining {
            return;
        }
        let now = Instant::now();
        while state.size() < self.inner.config.max_resources {
            let Some(ticket) = state.waiters.pop_live(now) else {
                break;
            };
            state.reserve_slot();
            if ticket.grant_slot() {
                trace!(name = %self.inner.name, "free slot granted to waiter");
            } else {
                state.release_slot();
            }
        }
    }

    /// Start background creation of resources missing to reach minimum size.
    fn schedule_replenish(&self, state: &mut PoolState<F::Resource>) {
        if state.draining {
            return;
        }
        let num = self
            .inner
            .config
            .min_resources
            .saturating_sub(state.size() + state.scheduled);
        if num == 0 {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            debug!(name = %self.inner.name, num, "no runtime available, replenishment skipped");
            return;
        };
        trace!(name = %self.inner.name, num, "scheduling pool replenishment");
        state.scheduled += num;
        for _ in 0..num {
            let pool = self.clone();
            let span = debug_span!("pool_replenish", name = %self.inner.name);
            runtime.spawn(async move { pool.replenish().await }.instrument(span));
        }
    }

    /// Open one resource into the pool, unless demand has reached minimum size in the meantime.
    async fn replenish(&self) {
        {
            let mut state = self.lock();
            state.scheduled -= 1;
            if state.draining || state.size() >= self.inner.config.min_resources {
                trace!("pool already at minimum size");
                return;
            }
            state.reserve_slot();
        }
        let reservation = Reservation::new(self);
        if let Err(err) = self.open_resource(reservation, OpenTarget::Pool).await {
            debug!(error = %err, "replenishment failed");
        }
        self.record_state();
    }

    /// Open resources inline until pool reaches [`PoolConfig::min_resources`].
    ///
    /// Returns number of resources opened.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::CreateFailed`] on the first factory error, or [`PoolError::Closed`]
    /// if pool is draining.
    pub async fn warm_up(&self) -> Result<usize, PoolError> {
        let mut opened = 0;
        loop {
            {
                let mut state = self.lock();
                if state.draining {
                    return Err(PoolError::Closed);
                }
                if state.size() >= self.inner.config.min_resources {
                    break;
                }
                state.reserve_slot();
            }
            let reservation = Reservation::new(self);
            self.open_resource(reservation, OpenTarget::Pool).await?;
            opened += 1;
        }
        self.record_state();
        Ok(opened)
    }

    /// Close idle resources unused for longer than [`PoolConfig::idle_timeout`].
    ///
    /// Pool is never shrunk below [`PoolConfig::min_resources`]. Returns number of resources
    /// closed.
    pub fn evict_idle(&self) -> usize {
        let Some(timeout) = self.inner.config.idle_timeout else {
            return 0;
        };
        let now = Instant::now();
        let expired = {
            let mut state = self.lock();
            if state.draining {
                return 0;
            }
            let mut removable = state.size().saturating_sub(self.inner.config.min_resources);
            let mut expired = Vec::new();
            // Oldest first.
            for res in mem::take(&mut state.idle) {
                if removable > 0 && res.idle_expired(Some(timeout), now) {
                    removable -= 1;
                    expired.push(res);
                } else {
                    state.idle.push(res);
                }
            }
            state.closed += expired.len() as u64;
            expired
        };
        let num = expired.len();
        for res in expired {
            self.close_resource(res, CloseReason::IdleTimeout);
        }
        if num > 0 {
            self.record_state();
        }
        num
    }

    /// Return a resource to the pool.
    ///
    /// Same as [`PooledResource::release`].
    pub fn release(&self, handle: PooledResource<F>) {
        handle.release();
    }

    /// Close a broken resource instead of returning it to the pool.
    ///
    /// Same as [`PooledResource::invalidate`].
    pub fn invalidate(&self, handle: PooledResource<F>) {
        handle.invalidate();
    }

    /// Current pool occupancy.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.lock().stats(self.inner.config.max_resources)
    }

    /// Owning context of a checked-out resource.
    #[must_use]
    pub fn owner_of(&self, id: ResourceId) -> Option<ContextId> {
        self.lock().busy.get(&id).and_then(|entry| entry.owner)
    }

    /// Whether pool stopped admitting acquisitions.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().draining
    }

    /// Shut the pool down.
    ///
    /// New acquisitions fail with [`PoolError::Closed`] from the moment this is called, as do
    /// all currently waiting ones. Idle resources are closed right away. Then this waits for
    /// checked-out resources to be returned, up to `deadline`. Resources still checked out at the
    /// deadline are written off: their holders get [`PoolError::DrainDeadlineExceeded`] on next
    /// access, and raw resources are closed as soon as holders let go of them.
    pub async fn drain(&self, deadline: Instant) -> DrainReport {
        let span = info_span!("pool_drain", name = %self.inner.name);
        self.drain_inner(deadline).instrument(span).await
    }

    async fn drain_inner(&self, deadline: Instant) -> DrainReport {
        self.inner.reaper.lock().stop();
        let (idle, mut report) = {
            let mut state = self.lock();
            state.draining = true;
            let idle = mem::take(&mut state.idle);
            state.closed += idle.len() as u64;
            let report = DrainReport {
                idle_closed: idle.len(),
                waiters_rejected: state.waiters.clear(),
                busy_at_start: state.busy.len(),
                forced: 0,
            };
            (idle, report)
        };
        for res in idle {
            self.close_resource(res, CloseReason::Drained);
        }
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.busy.is_empty() && state.pending == 0 {
                    break;
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                report.forced = self.force_close();
                break;
            }
        }
        self.record_state();
        info!(
            idle_closed = report.idle_closed,
            busy_at_start = report.busy_at_start,
            forced = report.forced,
            "pool drained"
        );
        report
    }

    /// Write off all checked-out resources.
    fn force_close(&self) -> usize {
        let mut state = self.lock();
        let forced = state.busy.len();
        for (id, entry) in state.busy.drain() {
            entry.revoked.store(true, Ordering::Release);
            warn!(
                name = %self.inner.name,
                resource_id = %id,
                owner = ?entry.owner,
                "resource still in use at drain deadline, force-closing"
            );
        }
        state.closed += forced as u64;
        forced
    }

    /// Update pool occupancy metrics, at most once per probe interval.
    pub(crate) fn record_state(&self) {
        let mut last_gathered_at = self.inner.last_gathered_at.lock();
        if last_gathered_at.elapsed() > PROBE_INTERVAL {
            *last_gathered_at = Instant::now();
            drop(last_gathered_at);
            self.inner.metrics.record_state(
                &self.inner.label,
                self.inner.config.min_resources,
                &self.stats(),
            );
        }
    }
}

/// Slot reserved for a resource being opened.
///
/// Gives the slot back if the opening future is dropped before completion.
struct Reservation<'a, F: ResourceFactory> {
    pool: &'a Pool<F>,
    armed: bool,
}

impl<'a, F: ResourceFactory> Reservation<'a, F> {
    /// Take over a slot already reserved in pool state.
    fn new(pool: &'a Pool<F>) -> Self {
        Self { pool, armed: true }
    }

    /// Give the slot back, under an already held lock.
    fn settle(mut self, state: &mut PoolState<F::Resource>) {
        self.armed = false;
        state.release_slot();
    }
}

impl<F: ResourceFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.lock();
            state.release_slot();
            self.pool.grant_slots(&mut state);
            self.pool.notify_if_drained(&state);
        }
    }
}

/// Acquisition suspended in the wait queue.
///
/// Removes its ticket if dropped, returning a resource that was handed over in the meantime.
struct Waiter<'a, F: ResourceFactory> {
    pool: &'a Pool<F>,
    ticket: u64,
    rx: oneshot::Receiver<Grant<F::Resource>>,
    done: bool,
}

impl<F: ResourceFactory> Waiter<'_, F> {
    fn abandon(&mut self) -> Option<Grant<F::Resource>> {
        self.done = true;
        self.pool.lock().waiters.remove(self.ticket);
        self.rx.close();
        self.rx.try_recv().ok()
    }
}

impl<F: ResourceFactory> Drop for Waiter<'_, F> {
    fn drop(&mut self) {
        if !self.done {
            if let Some(grant) = self.abandon() {
                self.pool.return_grant(grant);
            }
        }
    }
}
