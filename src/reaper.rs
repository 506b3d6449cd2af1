//! Background task closing resources that sat idle for too long.

use std::time::Duration;

use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, trace, trace_span, Instrument};

use crate::{factory::ResourceFactory, pool::Pool};

/// Shortest interval between idle sweeps.
const MIN_PERIOD: Duration = Duration::from_secs(1);
/// Longest interval between idle sweeps.
const MAX_PERIOD: Duration = Duration::from_secs(60);

/// Idle resource reaper.
///
/// Holds only a weak reference to the pool, and stops once the pool is gone.
#[derive(Debug, Default)]
pub(crate) struct IdleReaper {
    /// Reaper task handle.
    task: Option<JoinHandle<()>>,
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.stop();
    }
}

impl IdleReaper {
    /// Sweep interval for a given idle timeout.
    fn period(idle_timeout: Duration) -> Duration {
        (idle_timeout / 2).clamp(MIN_PERIOD, MAX_PERIOD)
    }

    /// Start reaper task.
    ///
    /// Does nothing outside of a Tokio runtime, or if already started.
    pub(crate) fn start<F: ResourceFactory>(&mut self, pool: &Pool<F>, idle_timeout: Duration) {
        if self.task.is_some() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            debug!(name = pool.name(), "no runtime available, idle reaper not started");
            return;
        };
        let period = Self::period(idle_timeout);
        // Sweeps are counted from pool creation, not from the first poll of the task.
        let first_sweep = Instant::now() + period;
        let weak = pool.downgrade();
        let span = trace_span!("idle_reaper", name = pool.name());
        let task = async move {
            let mut timer = interval_at(first_sweep, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let evicted = Pool::from_inner(inner).evict_idle();
                trace!(evicted, "idle sweep done");
            }
        }
        .instrument(span);
        self.task = Some(runtime.spawn(task));
    }

    /// Stop reaper task.
    pub(crate) fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
