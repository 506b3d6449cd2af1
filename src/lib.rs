#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod config;
mod context;
mod error;
mod factory;
mod handle;
mod logging;
mod metrics;
mod pool;
mod reaper;
mod registry;
mod resource;
#[cfg(test)]
mod testing;
mod wait;

pub use self::{
    config::{ConfigError, PoolConfig, PoolsConfig, PoolsConfigBuilder},
    context::{
        BoundResource, ContextBinding, ContextError, ContextId, ContextLifecycle, ContextManager,
        DestroyCallback,
    },
    error::{BoxError, PoolError},
    factory::ResourceFactory,
    handle::PooledResource,
    logging::{
        LoggingConfig, LoggingDestination, LoggingError, LoggingFormat, LoggingLevel,
        LoggingSubscriberConfig,
    },
    pool::{DrainReport, Pool, PoolStats},
    registry::{PoolRegistry, RegistryError},
    resource::{ResourceId, ResourceState},
};
