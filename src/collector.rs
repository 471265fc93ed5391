//! Collector Layer
//!
//! Pluggable data sources, each driven by its own worker task and feeding the
//! shared result channel.
//!
//! # Architecture
//!
//! - [`Collector`]: Core trait for implementing data sources
//! - [`PluginRuntime`]: Schedule state, trigger, and worker for one plugin
//! - [`CollectorFactory`]: Maps the `name` key of a section to a constructor
//!
//! # Example
//!
//! ```rust,no_run
//! use tithe::{CollectorFactory, PluginConfig, PluginRuntime, ScheduleMode, result_channel};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = CollectorFactory::with_builtins();
//! let config = PluginConfig::from_pairs("box", [("name", "system"), ("interval", "30")])?;
//! let (tx, _rx) = result_channel(None);
//!
//! let mut runtime = PluginRuntime::new(config.clone(), factory.build(&config)?, ScheduleMode::PhaseFixed);
//! runtime.start(tx);
//! runtime.run_now();
//! # Ok(())
//! # }
//! ```

pub mod conncheck;
pub mod httpcheck;
pub mod ping;
mod registry;
mod runtime;
pub mod system;
mod traits;

pub use registry::{CollectorFactory, Constructor};
pub use runtime::{PluginRuntime, PluginStats, now_millis};
pub(crate) use runtime::panic_message;
pub use traits::{CollectionError, Collector, PluginInitError};

use crate::config::PluginConfig;
use crate::sample::{MetricSample, SampleBuilder};

/// Start a sample for a built-in collector.
///
/// The plugin label is the implementation identifier; a section named
/// differently is carried as the plugin instance.
pub(crate) fn sample_for(identifier: &str, config: &PluginConfig) -> SampleBuilder {
    let builder = MetricSample::builder(identifier, config.interval());
    if config.section() == identifier {
        builder
    } else {
        builder.plugin_instance(config.section())
    }
}
