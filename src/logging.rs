//! Logging configuration via [`tracing`] crate.
//!
//! Pools only emit [`tracing`] events and spans. Processes that don't set up their own
//! subscriber can build one from the `logging` section of [`PoolsConfig`].
//!
//! [`PoolsConfig`]: crate::PoolsConfig

use std::{collections::BTreeMap, fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt::{self, writer::BoxMakeWriter},
    layer::{Layer, Layered, SubscriberExt},
    registry::Registry,
    util::SubscriberInitExt,
};

type LoggingRegistry = Layered<Vec<Box<dyn Layer<Registry> + Send + Sync>>, Registry>;

/// Error type used in logging configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoggingError {
    /// Log destination I/O error.
    #[error("Log destination I/O error: {0}")]
    Io(#[from] io::Error),
    /// Global subscriber was already installed.
    #[error("Unable to install global subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct LoggingConfig {
    /// List of subscribers defined in configuration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribers: Vec<LoggingSubscriberConfig>,
}

impl LoggingConfig {
    /// Create registry subscriber from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the subscribers cannot be initialized.
    pub fn make_registry(&self) -> Result<(LoggingRegistry, Vec<WorkerGuard>), LoggingError> {
        let (subs, guards): (Vec<_>, Vec<_>) = self
            .subscribers
            .iter()
            .map(LoggingSubscriberConfig::make_layer::<Registry>)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .unzip();
        Ok((Registry::default().with(subs), guards))
    }

    /// Build registry subscriber and install it as a global default.
    ///
    /// Returned guards must be kept alive for as long as logging is needed. Dropping them
    /// flushes buffered output.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the subscribers cannot be initialized, or if global subscriber
    /// was already set.
    pub fn init(&self) -> Result<Vec<WorkerGuard>, LoggingError> {
        let (registry, guards) = self.make_registry()?;
        registry.try_init()?;
        Ok(guards)
    }
}

/// Individual logging subscriber configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct LoggingSubscriberConfig {
    /// Overall format for logging output.
    #[serde(default)]
    pub format: LoggingFormat,
    /// Minimum severity level to include in output.
    #[serde(default)]
    pub level: LoggingLevel,
    /// Custom minimum severity levels for span targets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub targets: BTreeMap<String, LoggingLevel>,
    /// Use ANSI escape sequences for output colors and formatting.
    #[serde(default)]
    pub color: bool,
    /// Print event target.
    #[serde(default)]
    pub print_target: bool,
    /// Maximum buffered lines to store in a non-blocking writer.
    ///
    /// Lines over the limit are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_lines: Option<usize>,
    /// Log destination configuration.
    #[serde(default)]
    pub output: LoggingDestination,
}

impl LoggingSubscriberConfig {
    /// Make [`tracing_subscriber::Layer`] from subscriber configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if output destination cannot be opened.
    pub fn make_layer<T>(
        &self,
    ) -> Result<(Box<dyn Layer<T> + Send + Sync>, WorkerGuard), LoggingError>
    where
        T: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let mut buf_builder = NonBlockingBuilder::default().lossy(true);
        if let Some(lines) = self.buffer_lines {
            buf_builder = buf_builder.buffered_lines_limit(lines);
        }
        let (buf_writer, buf_guard) = self.output.make_writer(buf_builder)?;
        let layer = fmt::layer()
            .with_writer(buf_writer)
            .with_ansi(self.color)
            .with_target(self.print_target);
        let boxed_layer = match self.format {
            LoggingFormat::Full => layer.boxed(),
            LoggingFormat::Compact => layer.compact().boxed(),
            LoggingFormat::Pretty => layer.pretty().boxed(),
            LoggingFormat::Json => layer.json().flatten_event(true).boxed(),
        };
        let boxed_layer = if self.targets.is_empty() {
            boxed_layer
                .with_filter(LevelFilter::from(self.level))
                .boxed()
        } else {
            boxed_layer
                .with_filter(
                    Targets::new()
                        .with_targets(
                            self.targets
                                .iter()
                                .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
                        )
                        .with_default(LevelFilter::from(self.level)),
                )
                .boxed()
        };
        Ok((boxed_layer, buf_guard))
    }
}

/// Format for logging output.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    /// Format which prints span context before log message.
    #[default]
    Full,
    /// More compact format, span names are hidden.
    Compact,
    /// Excessively verbose and pretty multiline format.
    Pretty,
    /// Newline-delimited JSON objects.
    Json,
}

/// Minimum event severity for log output.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoggingLevel {
    /// Disables logging altogether.
    #[serde(alias = "off", alias = "disabled")]
    Off,
    /// Write "error" level only.
    #[serde(alias = "error")]
    Error,
    /// Write "warn" and more severe levels.
    #[serde(alias = "warn", alias = "warning")]
    Warn,
    /// Write "info" and more severe levels.
    #[serde(alias = "info")]
    #[default]
    Info,
    /// Write "debug" and more severe levels.
    #[serde(alias = "debug")]
    Debug,
    /// Write everything.
    #[serde(alias = "trace")]
    Trace,
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::Off => LevelFilter::OFF,
            LoggingLevel::Error => LevelFilter::ERROR,
            LoggingLevel::Warn => LevelFilter::WARN,
            LoggingLevel::Info => LevelFilter::INFO,
            LoggingLevel::Debug => LevelFilter::DEBUG,
            LoggingLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Logging output destination configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum LoggingDestination {
    /// Output to standard output (stdout, fd 1).
    #[default]
    #[serde(alias = "out")]
    StdOut,
    /// Output to standard error (stderr, fd 2).
    #[serde(alias = "err")]
    StdErr,
    /// Append to file.
    File {
        /// Path to file.
        path: String,
    },
}

impl LoggingDestination {
    /// Make [`tracing_subscriber::fmt::writer::BoxMakeWriter`] from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if log file cannot be opened for writing.
    pub fn make_writer(
        &self,
        buf_builder: NonBlockingBuilder,
    ) -> Result<(BoxMakeWriter, WorkerGuard), LoggingError> {
        let (wr, wg) = match self {
            Self::StdOut => buf_builder.finish(io::stdout()),
            Self::StdErr => buf_builder.finish(io::stderr()),
            Self::File { path } => {
                let file = fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)?;
                buf_builder.finish(file)
            }
        };
        Ok((BoxMakeWriter::new(wr), wg))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::from_str;

    use super::*;

    /// Deserialize - subscriber with defaults.
    #[test]
    fn subscriber_de_default() {
        let deserialized: LoggingSubscriberConfig = from_str("{}").unwrap();
        assert_eq!(deserialized, LoggingSubscriberConfig::default());
        assert_eq!(deserialized.level, LoggingLevel::Info);
        assert_eq!(deserialized.output, LoggingDestination::StdOut);
    }

    /// Deserialize - level aliases and target overrides.
    #[test]
    fn subscriber_de_targets() {
        let serialized = r#"{
            "format": "json",
            "level": "warning",
            "targets": { "respool": "trace" },
            "output": { "type": "stderr" }
        }"#;
        let deserialized: LoggingSubscriberConfig = from_str(serialized).unwrap();
        assert_eq!(deserialized.format, LoggingFormat::Json);
        assert_eq!(deserialized.level, LoggingLevel::Warn);
        assert_eq!(deserialized.targets["respool"], LoggingLevel::Trace);
        assert_eq!(deserialized.output, LoggingDestination::StdErr);
    }

    /// Registry is built with one guard per subscriber.
    #[test]
    fn make_registry_guards() {
        let cfg: LoggingConfig = from_str(
            r#"{ "subscribers": [
                { "format": "compact" },
                { "format": "pretty", "output": { "type": "err" } }
            ] }"#,
        )
        .unwrap();
        let (_registry, guards) = cfg.make_registry().unwrap();
        assert_eq!(guards.len(), 2);
    }
}
