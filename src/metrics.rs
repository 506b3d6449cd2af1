//! OpenTelemetry metrics for resource pools.
//!
//! Instrument names follow semantic conventions for database client connection pools.

use std::{
    borrow::Cow,
    sync::{Arc, LazyLock},
    time::Duration,
};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram},
    Key, KeyValue, StringValue, Value,
};

use crate::pool::PoolStats;

/// Central metrics singleton for pool metrics.
pub(crate) static POOL_METRICS: LazyLock<Arc<Metrics>> =
    LazyLock::new(|| Arc::new(Metrics::new()));

const KEY_POOL_NAME: Key = Key::from_static_str("db.client.connection.pool.name");
const KEY_STATE: Key = Key::from_static_str("db.client.connection.state");

/// Storage for pool metrics.
pub(crate) struct Metrics {
    /// The number of connections that are currently in state described by the state attribute.
    pub(crate) conn_count: Gauge<u64>,
    /// The maximum number of open connections allowed.
    pub(crate) conn_max: Gauge<u64>,
    /// The minimum number of idle open connections allowed.
    pub(crate) idle_min: Gauge<u64>,
    /// The number of current pending requests for an open connection.
    pub(crate) pending_requests: Gauge<u64>,
    /// The number of connection timeouts that have occurred trying to obtain a connection.
    pub(crate) timeouts: Counter<u64>,
    /// The time it took to create a new connection.
    pub(crate) create_time: Histogram<f64>,
    /// The time it took to obtain an open connection from the pool.
    pub(crate) wait_time: Histogram<f64>,
    /// The time between borrowing a connection and returning it to the pool.
    pub(crate) use_time: Histogram<f64>,
}

impl Metrics {
    /// Create new storage for pool metrics.
    ///
    /// All pools share [`POOL_METRICS`], this is only called once.
    fn new() -> Self {
        let meter = global::meter("respool");
        let conn_count = meter
            .u64_gauge("db.client.connection.count")
            .with_description("The number of connections that are currently in state described by the state attribute.")
            .build();
        let conn_max = meter
            .u64_gauge("db.client.connection.max")
            .with_description("The maximum number of open connections allowed.")
            .build();
        let idle_min = meter
            .u64_gauge("db.client.connection.idle.min")
            .with_description("The minimum number of idle open connections allowed.")
            .build();
        let pending_requests = meter
            .u64_gauge("db.client.connection.pending_requests")
            .with_description("The number of current pending requests for an open connection.")
            .build();
        let timeouts = meter
            .u64_counter("db.client.connection.timeouts")
            .with_description("The number of connection timeouts that have occurred trying to obtain a connection from the pool.")
            .build();
        let create_time = meter
            .f64_histogram("db.client.connection.create_time")
            .with_unit("s")
            .with_description("The time it took to create a new connection.")
            .build();
        let wait_time = meter
            .f64_histogram("db.client.connection.wait_time")
            .with_unit("s")
            .with_description("The time it took to obtain an open connection from the pool.")
            .build();
        let use_time = meter
            .f64_histogram("db.client.connection.use_time")
            .with_unit("s")
            .with_description(
                "The time between borrowing a connection and returning it to the pool.",
            )
            .build();
        Metrics {
            conn_count,
            conn_max,
            idle_min,
            pending_requests,
            timeouts,
            create_time,
            wait_time,
            use_time,
        }
    }

    /// Record current pool occupancy.
    pub(crate) fn record_state(&self, label: &[KeyValue; 1], min: usize, stats: &PoolStats) {
        self.conn_max.record(stats.max as u64, label);
        self.idle_min.record(min as u64, label);
        self.pending_requests.record(stats.waiting as u64, label);
        self.conn_count
            .record(stats.idle as u64, &status_kv(label[0].clone(), "idle"));
        self.conn_count
            .record(stats.busy as u64, &status_kv(label[0].clone(), "used"));
    }

    /// Record duration with a pool label.
    #[inline]
    pub(crate) fn record_time(hist: &Histogram<f64>, label: &[KeyValue; 1], time: Duration) {
        hist.record(time.as_secs_f64(), label);
    }
}

/// Premade pool name label.
pub(crate) fn pool_kv(name: Cow<'static, str>) -> [KeyValue; 1] {
    [KeyValue::new(KEY_POOL_NAME, name)]
}

fn status_kv(name: KeyValue, status: &'static str) -> [KeyValue; 2] {
    [
        name,
        KeyValue::new(KEY_STATE, Value::String(StringValue::from(status))),
    ]
}
