//! Process-wide collection of named pools.

use std::{any::Any, borrow::Cow, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};

use crate::{
    config::{ConfigError, PoolConfig, PoolsConfig},
    factory::ResourceFactory,
    pool::{DrainReport, Pool, PoolStats},
};

/// Error type returned by pool registry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Pool with this name is already registered.
    #[error("pool {0:?} is already registered")]
    Duplicate(String),
    /// No pool registered under this name.
    #[error("pool {0:?} is not registered")]
    NotFound(String),
    /// Pool exists, but manages resources of another type.
    #[error("pool {name:?} manages resources of a different type")]
    TypeMismatch {
        /// Pool name.
        name: String,
    },
    /// Invalid pool configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Pool with its resource type erased.
#[async_trait::async_trait]
trait ManagedPool: Send + Sync {
    fn stats(&self) -> PoolStats;
    async fn drain(&self, deadline: Instant) -> DrainReport;
    fn as_any(&self) -> &dyn Any;
}

#[async_trait::async_trait]
impl<F: ResourceFactory> ManagedPool for Pool<F> {
    fn stats(&self) -> PoolStats {
        Pool::stats(self)
    }

    async fn drain(&self, deadline: Instant) -> DrainReport {
        Pool::drain(self, deadline).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry of named pools, usually one per process or worker.
///
/// Pools of different resource types can be registered side by side.
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<String, Arc<dyn ManagedPool>>,
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.names())
            .finish()
    }
}

impl PoolRegistry {
    /// Create empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new pool.
    ///
    /// # Errors
    ///
    /// Returns `Err` if name is already taken, or if configuration is invalid.
    pub fn register<F: ResourceFactory>(
        &self,
        name: impl Into<String>,
        config: PoolConfig,
        factory: F,
    ) -> Result<Pool<F>, RegistryError> {
        let name = name.into();
        match self.pools.entry(name) {
            Entry::Occupied(entry) => Err(RegistryError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                let pool = Pool::new(Cow::Owned(entry.key().clone()), config, factory)?;
                debug!(name = %entry.key(), "pool registered");
                entry.insert(Arc::new(pool.clone()));
                Ok(pool)
            }
        }
    }

    /// Create and register a new pool using its section of process configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if configuration has no section for this pool. See
    /// [`Self::register`] for other errors.
    pub fn register_from_config<F: ResourceFactory>(
        &self,
        name: &str,
        config: &PoolsConfig,
        factory: F,
    ) -> Result<Pool<F>, RegistryError> {
        let pool_config = config
            .pool(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?
            .clone();
        self.register(name, pool_config, factory)
    }

    /// Look up a pool by name.
    ///
    /// # Errors
    ///
    /// Returns `Err` if pool does not exist, or if it was registered with another factory type.
    pub fn pool<F: ResourceFactory>(&self, name: &str) -> Result<Pool<F>, RegistryError> {
        let entry = self
            .pools
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        entry
            .as_any()
            .downcast_ref::<Pool<F>>()
            .cloned()
            .ok_or_else(|| RegistryError::TypeMismatch {
                name: name.to_string(),
            })
    }

    /// Check whether pool is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    /// Names of all registered pools, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Current occupancy of a pool.
    #[must_use]
    pub fn stats(&self, name: &str) -> Option<PoolStats> {
        self.pools.get(name).map(|pool| pool.stats())
    }

    /// Drain and unregister all pools concurrently, sharing one deadline.
    ///
    /// Returns drain reports keyed by pool name, sorted by name.
    pub async fn close_all(&self, deadline: Instant) -> Vec<(String, DrainReport)> {
        let names = self.names();
        let pools: Vec<_> = names
            .into_iter()
            .filter_map(|name| self.pools.remove(&name))
            .collect();
        let span = info_span!("registry_close_all", pools = pools.len());
        let reports = join_all(pools.into_iter().map(|(name, pool)| async move {
            let report = pool.drain(deadline).await;
            (name, report)
        }))
        .instrument(span)
        .await;
        let forced: usize = reports.iter().map(|(_, r)| r.forced).sum();
        info!(pools = reports.len(), forced, "all pools closed");
        reports
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::MockFactory;

    /// Another resource type, for type mismatch checks.
    #[derive(Clone, Debug, Default)]
    struct UnitFactory;

    #[async_trait::async_trait]
    impl ResourceFactory for UnitFactory {
        type Resource = ();

        async fn open(&self) -> Result<(), crate::error::BoxError> {
            Ok(())
        }
    }

    /// Pools are looked up by name and type.
    #[tokio::test]
    async fn register_and_lookup() {
        let registry = PoolRegistry::new();
        registry
            .register("db", PoolConfig::default(), MockFactory::default())
            .unwrap();
        registry
            .register("cache", PoolConfig::default(), UnitFactory)
            .unwrap();
        assert_eq!(registry.names(), vec!["cache", "db"]);
        assert!(registry.contains("db"));

        let pool = registry.pool::<MockFactory>("db").unwrap();
        assert_eq!(pool.name(), "db");
        drop(pool.acquire().await.unwrap());
        assert_eq!(registry.stats("db").unwrap().idle, 1);

        assert!(matches!(
            registry.pool::<UnitFactory>("db"),
            Err(RegistryError::TypeMismatch { .. })
        ));
        assert!(matches!(
            registry.pool::<UnitFactory>("queue"),
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.stats("queue").is_none());
    }

    /// Names are unique, invalid configuration is rejected.
    #[tokio::test]
    async fn register_errors() {
        let registry = PoolRegistry::new();
        registry
            .register("db", PoolConfig::default(), UnitFactory)
            .unwrap();
        assert!(matches!(
            registry.register("db", PoolConfig::default(), UnitFactory),
            Err(RegistryError::Duplicate(_))
        ));
        let bad = PoolConfig::default().with_min_resources(20);
        assert!(matches!(
            registry.register("bad", bad, UnitFactory),
            Err(RegistryError::Config(ConfigError::MinAboveMax { .. }))
        ));
        assert!(!registry.contains("bad"));
    }

    /// Pools are created from their configuration sections.
    #[tokio::test]
    async fn from_config() {
        let yaml = "pools:\n  db:\n    max_resources: 3\n    max_wait_time: 250ms\n";
        let config = PoolsConfig::builder()
            .with_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()
            .unwrap();
        let registry = PoolRegistry::new();
        let pool = registry
            .register_from_config("db", &config, UnitFactory)
            .unwrap();
        assert_eq!(pool.config().max_resources, 3);
        assert_eq!(pool.config().max_wait_time, Duration::from_millis(250));
        assert!(matches!(
            registry.register_from_config("cache", &config, UnitFactory),
            Err(RegistryError::NotFound(_))
        ));
    }

    /// All pools are drained together, and unregistered.
    #[tokio::test(start_paused = true)]
    async fn close_all() {
        let registry = PoolRegistry::new();
        let db = registry
            .register("db", PoolConfig::default(), MockFactory::default())
            .unwrap();
        let cache = registry
            .register("cache", PoolConfig::default(), UnitFactory)
            .unwrap();
        let straggler = db.acquire().await.unwrap();
        drop(cache.acquire().await.unwrap());

        let started = Instant::now();
        let reports = registry.close_all(started + Duration::from_secs(1)).await;
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, "cache");
        assert_eq!(reports[0].1.idle_closed, 1);
        assert_eq!(reports[1].0, "db");
        assert_eq!(reports[1].1.forced, 1);
        assert!(registry.names().is_empty());
        assert!(straggler.is_revoked());
        assert!(matches!(cache.acquire().await, Err(crate::PoolError::Closed)));
    }
}
