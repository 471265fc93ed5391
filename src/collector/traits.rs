//! Core collector traits and types.

use thiserror::Error;

use crate::sample::MetricSample;

/// Errors that can occur during a single collection cycle.
///
/// Always recovered by the plugin runtime: the cycle yields no samples and the
/// worker waits for its next trigger.
#[derive(Debug, Error)]
pub enum CollectionError {
    /// Network or file I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout elapsed.
    #[error("timeout elapsed")]
    Timeout,

    /// Upstream output could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A subprocess exited unsuccessfully.
    #[error("command '{command}' exited with status {status}")]
    CommandFailed { command: String, status: i32 },

    /// HTTP request failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The collector panicked mid-cycle.
    #[error("collector panicked: {0}")]
    Panicked(String),

    /// Anything else a collector wants to report.
    #[error("{0}")]
    Other(String),
}

/// Errors raised while constructing a collector from its config section.
#[derive(Debug, Error)]
pub enum PluginInitError {
    /// No constructor is registered for the implementation identifier.
    #[error("unknown plugin implementation '{0}'")]
    UnknownPlugin(String),

    /// Plugin-specific settings are missing or invalid.
    #[error("invalid config for plugin '{plugin}': {reason}")]
    InvalidConfig { plugin: String, reason: String },

    /// A resource the plugin depends on is not available yet.
    #[error("plugin '{plugin}' unavailable: {reason}")]
    Unavailable { plugin: String, reason: String },
}

impl PluginInitError {
    /// Whether retrying construction can possibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnknownPlugin(_))
    }

    pub fn invalid(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }
}

/// Core collector trait for implementing data sources.
///
/// A collector is owned by exactly one plugin worker, which calls
/// [`collect`](Collector::collect) once per triggered cycle. Collectors never
/// touch the result channel or the schedule; the runtime does both.
///
/// # Returns
///
/// - `Ok(samples)`: zero or more samples for this cycle. An empty vector means
///   nothing to report and no batch is emitted.
/// - `Err(CollectionError)`: the cycle failed; it is logged and skipped.
#[async_trait::async_trait]
pub trait Collector: Send + 'static {
    /// Perform one collection cycle.
    async fn collect(&mut self) -> Result<Vec<MetricSample>, CollectionError>;
}
