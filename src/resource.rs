//! Pooled resource wrapper and its lifecycle state machine.

use std::fmt;

use tokio::time::Instant;
use tracing::trace;

use crate::context::ContextId;

/// Identifier of a resource, unique within its pool.
///
/// Identifiers are never reused, even after the resource is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ResourceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Lifecycle state of a pooled resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    /// Opened by the factory, not yet placed in the pool.
    Created,
    /// Owned by the pool, ready to be checked out.
    Idle,
    /// Checked out by exactly one owner.
    Busy,
    /// Terminal state, raw resource has been handed to the factory for closing.
    Closed,
}

impl ResourceState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Idle | Self::Closed)
                | (Self::Idle, Self::Busy | Self::Closed)
                | (Self::Busy, Self::Idle | Self::Closed)
        )
    }

    /// Lowercase state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw resource bundled with its lifecycle state and usage metadata.
pub(crate) struct PoolResource<R> {
    id: ResourceId,
    state: ResourceState,
    raw: R,
    /// Last time resource was handed out or returned.
    last_active_at: Instant,
    /// Number of checkouts so far.
    use_count: u64,
    /// Set only while busy.
    owner: Option<ContextId>,
}

impl<R> PoolResource<R> {
    /// Wrap freshly opened raw resource.
    pub(crate) fn new(id: ResourceId, raw: R) -> Self {
        Self {
            id,
            state: ResourceState::Created,
            raw,
            last_active_at: Instant::now(),
            use_count: 0,
            owner: None,
        }
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.id
    }

    pub(crate) fn use_count(&self) -> u64 {
        self.use_count
    }

    pub(crate) fn owner(&self) -> Option<ContextId> {
        self.owner
    }

    pub(crate) fn last_active_at(&self) -> Instant {
        self.last_active_at
    }

    pub(crate) fn raw(&self) -> &R {
        &self.raw
    }

    pub(crate) fn raw_mut(&mut self) -> &mut R {
        &mut self.raw
    }

    fn transition(&mut self, next: ResourceState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid resource transition {} -> {next}",
            self.state,
        );
        trace!(resource_id = %self.id, from = %self.state, to = %next, "resource state change");
        self.state = next;
    }

    /// Return resource to the pool.
    pub(crate) fn mark_idle(&mut self) {
        self.transition(ResourceState::Idle);
        self.owner = None;
        self.last_active_at = Instant::now();
    }

    /// Hand resource out to a single owner.
    pub(crate) fn mark_busy(&mut self, owner: Option<ContextId>) {
        self.transition(ResourceState::Busy);
        self.owner = owner;
        self.use_count += 1;
        self.last_active_at = Instant::now();
    }

    /// Undo a hand-out that the receiving side never picked up.
    pub(crate) fn cancel_checkout(&mut self) {
        self.transition(ResourceState::Idle);
        self.owner = None;
        self.use_count = self.use_count.saturating_sub(1);
    }

    /// Move to terminal state, giving up the raw resource for closing.
    pub(crate) fn into_closed(mut self) -> R {
        self.transition(ResourceState::Closed);
        self.raw
    }

    /// Whether resource has been idle for at least `timeout` at instant `now`.
    pub(crate) fn idle_expired(&self, timeout: Option<std::time::Duration>, now: Instant) -> bool {
        self.state == ResourceState::Idle
            && timeout.is_some_and(|t| now.saturating_duration_since(self.last_active_at) >= t)
    }
}

impl<R> fmt::Debug for PoolResource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolResource")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("use_count", &self.use_count)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
