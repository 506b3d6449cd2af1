//! Pool configuration structures.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LoggingConfig;

/// Pool configuration error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Configuration builder error.
    #[error(transparent)]
    Source(#[from] config::ConfigError),
    /// Pool must be able to hold at least one resource.
    #[error("max_resources must be greater than 0")]
    ZeroCapacity,
    /// Lower pool size bound is above the upper one.
    #[error("min_resources ({min}) must not exceed max_resources ({max})")]
    MinAboveMax {
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Configuration of a single resource pool.
///
/// Immutable once the pool is created.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Number of resources the pool keeps open, whether used or not.
    ///
    /// Default is 0.
    #[serde(default)]
    pub min_resources: usize,
    /// Upper bound on idle and checked-out resources combined.
    ///
    /// Default is 10.
    #[serde(default = "PoolConfig::default_max_resources")]
    pub max_resources: usize,
    /// Time to wait for a free resource when acquiring without explicit timeout.
    ///
    /// Default is 30 seconds.
    #[serde(default = "PoolConfig::default_max_wait_time", with = "humantime_serde")]
    pub max_wait_time: Duration,
    /// Idle resources are closed after this much time without use.
    ///
    /// Never expire if not set.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub idle_timeout: Option<Duration>,
    /// Close a resource after this many checkouts.
    ///
    /// 0 means unlimited.
    #[serde(default)]
    pub max_uses_per_resource: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_resources: 0,
            max_resources: Self::default_max_resources(),
            max_wait_time: Self::default_max_wait_time(),
            idle_timeout: None,
            max_uses_per_resource: 0,
        }
    }
}

impl PoolConfig {
    /// Default value for [`Self::max_resources`].
    #[must_use]
    #[inline]
    fn default_max_resources() -> usize {
        10
    }

    /// Default value for [`Self::max_wait_time`].
    #[must_use]
    #[inline]
    fn default_max_wait_time() -> Duration {
        Duration::from_secs(30)
    }

    /// Set minimum pool size.
    #[must_use]
    pub fn with_min_resources(mut self, min_resources: usize) -> Self {
        self.min_resources = min_resources;
        self
    }

    /// Set maximum pool size.
    #[must_use]
    pub fn with_max_resources(mut self, max_resources: usize) -> Self {
        self.max_resources = max_resources;
        self
    }

    /// Set default acquisition timeout.
    #[must_use]
    pub fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    /// Set idle resource expiration time.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set maximum number of checkouts per resource.
    #[must_use]
    pub fn with_max_uses_per_resource(mut self, max_uses: u64) -> Self {
        self.max_uses_per_resource = max_uses;
        self
    }

    /// Check pool size bounds.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `max_resources` is zero, or if `min_resources` exceeds it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_resources == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.min_resources > self.max_resources {
            return Err(ConfigError::MinAboveMax {
                min: self.min_resources,
                max: self.max_resources,
            });
        }
        Ok(())
    }

    /// Whether a resource used `use_count` times must be retired.
    #[must_use]
    pub(crate) fn use_limit_reached(&self, use_count: u64) -> bool {
        self.max_uses_per_resource > 0 && use_count >= self.max_uses_per_resource
    }
}

/// Root container for process-wide pool configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolsConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named pool configurations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pools: HashMap<String, PoolConfig>,
}

impl PoolsConfig {
    /// Create builder for pool configuration.
    pub fn builder() -> PoolsConfigBuilder {
        PoolsConfigBuilder::new()
    }

    /// Get configuration of a named pool.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.get(name)
    }
}

/// Builder for pool configuration.
#[must_use]
pub struct PoolsConfigBuilder {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl Default for PoolsConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolsConfigBuilder {
    /// Alternative method to construct a pool configuration builder.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
        }
    }

    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration. Every pool section
    /// is validated.
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful, or if any pool has invalid
    /// size bounds.
    pub fn build(self) -> Result<PoolsConfig, ConfigError> {
        let cfg: PoolsConfig = self.builder.build()?.try_deserialize()?;
        cfg.pools.values().try_for_each(PoolConfig::validate)?;
        Ok(cfg)
    }

    /// Add a custom object implementing [`Source`] trait as a source of pool configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of pool configuration.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add environment variables as a source of pool configuration.
    ///
    /// Nested keys are separated by double underscores, e.g. `APP__POOLS__DB__MAX_RESOURCES=8`
    /// for prefix `APP`.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(
            config::Environment::with_prefix(prefix.as_ref())
                .separator("__")
                .prefix_separator("__"),
        )
    }
}

#[cfg(test)]
mod tests {
    use config::{File, FileFormat};
    use serde_json::{from_str, json, to_value};

    use super::*;

    /// Deserialize - default values.
    #[test]
    fn pool_config_de_default() {
        let deserialized: PoolConfig = from_str("{}").unwrap();
        assert_eq!(deserialized, PoolConfig::default());
        assert_eq!(deserialized.max_resources, 10);
        assert_eq!(deserialized.max_wait_time, Duration::from_secs(30));
    }

    /// Deserialize - all options set.
    #[test]
    fn pool_config_de_full() {
        let serialized = r#"{
            "min_resources": 1,
            "max_resources": 2,
            "max_wait_time": "100ms",
            "idle_timeout": "5m",
            "max_uses_per_resource": 1000
        }"#;
        let deserialized: PoolConfig = from_str(serialized).unwrap();
        assert_eq!(
            deserialized,
            PoolConfig::default()
                .with_min_resources(1)
                .with_max_resources(2)
                .with_max_wait_time(Duration::from_millis(100))
                .with_idle_timeout(Some(Duration::from_secs(300)))
                .with_max_uses_per_resource(1000)
        );
    }

    /// Serialize - unset idle timeout is omitted.
    #[test]
    fn pool_config_ser() {
        let serialized = to_value(PoolConfig::default().with_max_resources(4)).unwrap();
        assert_eq!(
            serialized,
            json!({
                "min_resources": 0,
                "max_resources": 4,
                "max_wait_time": "30s",
                "max_uses_per_resource": 0
            })
        );
    }

    /// Size bounds are validated.
    #[test]
    fn pool_config_validate() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(matches!(
            PoolConfig::default().with_max_resources(0).validate(),
            Err(ConfigError::ZeroCapacity)
        ));
        assert!(matches!(
            PoolConfig::default()
                .with_min_resources(3)
                .with_max_resources(2)
                .validate(),
            Err(ConfigError::MinAboveMax { min: 3, max: 2 })
        ));
    }

    /// Zero use limit means unlimited.
    #[test]
    fn pool_config_use_limit() {
        let unlimited = PoolConfig::default();
        assert!(!unlimited.use_limit_reached(u64::MAX));
        let limited = PoolConfig::default().with_max_uses_per_resource(3);
        assert!(!limited.use_limit_reached(2));
        assert!(limited.use_limit_reached(3));
    }

    /// Load named pools from YAML source.
    #[test]
    fn pools_config_from_yaml() {
        let yaml = "
pools:
  db:
    min_resources: 1
    max_resources: 5
    max_wait_time: 250ms
  cache:
    max_resources: 2
";
        let cfg = PoolsConfig::builder()
            .with_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap();
        assert_eq!(cfg.pools.len(), 2);
        let db = cfg.pool("db").unwrap();
        assert_eq!(db.min_resources, 1);
        assert_eq!(db.max_resources, 5);
        assert_eq!(db.max_wait_time, Duration::from_millis(250));
        assert_eq!(cfg.pool("cache").unwrap().max_resources, 2);
        assert!(cfg.pool("queue").is_none());
    }

    /// Invalid pool section fails the whole configuration.
    #[test]
    fn pools_config_invalid_pool() {
        let yaml = "
pools:
  db:
    min_resources: 8
    max_resources: 5
";
        let res = PoolsConfig::builder()
            .with_source(File::from_str(yaml, FileFormat::Yaml))
            .build();
        assert!(matches!(res, Err(ConfigError::MinAboveMax { .. })));
    }
}
