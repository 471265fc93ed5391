//! Tithe - Lightweight Telemetry Agent
//!
//! Runs a set of independently scheduled collector plugins, funnels their
//! samples through a shared channel, and forwards each batch to a metrics
//! backend as soon as it arrives.
//!
//! # Architecture
//!
//! - **Manager**: tick loop deciding when each plugin runs; supervises startup
//! - **Collectors**: one worker task per plugin, woken by a trigger
//! - **Result channel**: multi-producer queue from plugin workers to delivery
//! - **Submitter**: dedicated thread draining the channel into a [`SubmitClient`]
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tithe::{AgentConfig, CollectorFactory, HttpSubmitClient, Manager, ManagerHandle};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::load("/etc/tithe/tithe.yaml")?;
//!     let client = HttpSubmitClient::from_config(&config.main);
//!     let factory = CollectorFactory::with_builtins();
//!
//!     let handle = ManagerHandle::default();
//!     let mut manager = Manager::start(&config, &factory, Box::new(client), handle).await?;
//!     manager.run().await;
//!     manager.join(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod collector;
pub mod config;
pub mod manager;
pub mod sample;
pub mod submit;

pub use channel::{Batch, ChannelError, ResultReceiver, ResultSender, result_channel};
pub use collector::{
    CollectionError, Collector, CollectorFactory, PluginInitError, PluginRuntime, PluginStats,
};
pub use config::{AgentConfig, ConfigError, MainConfig, PluginConfig, ScheduleMode};
pub use manager::{
    Manager, ManagerError, ManagerHandle, ManagerOptions, RetryPolicy, compute_sleep,
};
pub use sample::{DsType, MetricSample, SampleBuilder};
pub use submit::{HttpSubmitClient, SubmissionError, SubmitClient, SubmitStats, Submitter};
