//! Scheduler and supervisor.
//!
//! The [`Manager`] owns every [`PluginRuntime`] and the [`Submitter`]. Its
//! tick loop only decides *when* each plugin runs; collection itself happens
//! on the plugins' own worker tasks and delivery on the submitter thread.
//!
//! Startup validates every enabled section before anything is spawned. A
//! plugin whose constructor keeps failing is retried with quadratic backoff
//! and then left out, without affecting the others.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;

use crate::channel::{ResultSender, result_channel};
use crate::collector::{CollectorFactory, PluginInitError, PluginRuntime, now_millis};
use crate::config::{AgentConfig, ConfigError, MainConfig, PluginConfig, ScheduleMode};
use crate::submit::{DEFAULT_POLL_INTERVAL, SubmitClient, SubmitStats, Submitter};

// =============================================================================
// Constants
// =============================================================================

/// Sleep ceiling for the tick loop.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_secs(60);

/// Sleep floor for the tick loop.
pub const DEFAULT_MIN_SLEEP: Duration = Duration::from_millis(100);

/// Submitter poll granularity while waiting in [`Manager::join`].
const JOIN_POLL: Duration = Duration::from_millis(10);

// =============================================================================
// Errors
// =============================================================================

/// Errors that prevent the manager from starting.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The delivery worker thread could not be spawned.
    #[error("failed to spawn submitter: {0}")]
    Spawn(#[from] std::io::Error),
}

// =============================================================================
// Options
// =============================================================================

/// Construction retry policy: `base_delay × attempt²` between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_mul(attempt))
    }
}

/// Tunables for the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    pub retry: RetryPolicy,
    pub idle_sleep: Duration,
    pub min_sleep: Duration,
    pub schedule: ScheduleMode,
    /// How long the submitter waits on the channel per poll.
    pub submit_poll: Duration,
    /// Result channel capacity; `None` is unbounded.
    pub channel_capacity: Option<usize>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            idle_sleep: DEFAULT_IDLE_SLEEP,
            min_sleep: DEFAULT_MIN_SLEEP,
            schedule: ScheduleMode::default(),
            submit_poll: DEFAULT_POLL_INTERVAL,
            channel_capacity: None,
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &MainConfig) -> Self {
        Self {
            schedule: config.schedule,
            channel_capacity: (config.channel_capacity > 0).then_some(config.channel_capacity),
            ..Self::default()
        }
    }
}

/// Time to sleep before the next tick.
///
/// Each plugin contributes `max(min_sleep, next_sched - now)`; the result is
/// the smallest contribution, capped at `idle_sleep` (which is also the
/// result when there are no plugins).
pub fn compute_sleep(
    next_scheds: impl IntoIterator<Item = i64>,
    now_ms: i64,
    min_sleep: Duration,
    idle_sleep: Duration,
) -> Duration {
    next_scheds
        .into_iter()
        .map(|next| {
            let until = u64::try_from(next.saturating_sub(now_ms)).unwrap_or(0);
            Duration::from_millis(until).max(min_sleep)
        })
        .fold(idle_sleep, Duration::min)
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug, Default)]
struct ManagerShared {
    stop: AtomicBool,
    wake: Notify,
}

/// Cloneable stop handle, safe to move into signal handlers.
#[derive(Debug, Clone, Default)]
pub struct ManagerHandle {
    shared: Arc<ManagerShared>,
}

impl ManagerHandle {
    /// Request shutdown and wake the tick loop.
    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::SeqCst) {
            tracing::info!("Stop requested");
        }
        self.shared.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Owns the plugin registry and the delivery worker.
#[derive(Debug)]
pub struct Manager {
    plugins: Vec<PluginRuntime>,
    submitter: Submitter,
    options: ManagerOptions,
    handle: ManagerHandle,
}

impl Manager {
    /// Validate `config`, spawn the delivery worker, and start every plugin
    /// that can be constructed.
    ///
    /// `handle` may be stopped while startup is still retrying constructors;
    /// the pending backoff is cut short and no further plugins are built.
    ///
    /// # Errors
    /// Any [`ConfigError`] aborts startup before a worker is spawned.
    pub async fn start(
        config: &AgentConfig,
        factory: &CollectorFactory,
        client: Box<dyn SubmitClient>,
        handle: ManagerHandle,
    ) -> Result<Self, ManagerError> {
        let options = ManagerOptions::from_config(&config.main);
        Self::start_with_options(config.plugin_configs()?, factory, client, options, handle).await
    }

    /// Start from already validated plugin sections, in order.
    pub async fn start_with_options(
        plugin_configs: Vec<PluginConfig>,
        factory: &CollectorFactory,
        client: Box<dyn SubmitClient>,
        options: ManagerOptions,
        handle: ManagerHandle,
    ) -> Result<Self, ManagerError> {
        let (tx, rx) = result_channel(options.channel_capacity);
        let submitter = Submitter::spawn(rx, client, options.submit_poll)?;

        let mut manager = Self {
            plugins: Vec::with_capacity(plugin_configs.len()),
            submitter,
            options,
            handle,
        };

        for config in plugin_configs {
            if manager.handle.is_stopped() {
                tracing::info!(plugin = %config.section(), "Stop requested, skipping remaining plugins");
                break;
            }
            manager.register(config, factory, &tx).await;
        }
        // Plugin workers hold the only senders from here on.
        drop(tx);

        tracing::info!(
            plugins = manager.plugins.len(),
            names = ?manager.plugin_names(),
            "Manager initialized"
        );
        Ok(manager)
    }

    async fn register(&mut self, config: PluginConfig, factory: &CollectorFactory, tx: &ResultSender) {
        let section = config.section().to_string();
        tracing::debug!(plugin = %section, implementation = %config.name(), "Initializing plugin");

        let collector = match self.construct(&config, factory).await {
            Ok(collector) => collector,
            Err(e) => {
                tracing::error!(plugin = %section, error = %e, "Plugin excluded from registry");
                return;
            }
        };

        let mut runtime = PluginRuntime::new(config, collector, self.options.schedule);
        runtime.start(tx.clone());
        self.plugins.push(runtime);
        tracing::info!(plugin = %section, "Plugin registered");
    }

    /// Build the collector, retrying with quadratic backoff.
    ///
    /// Every failed attempt, the last included, is followed by its backoff,
    /// so the default policy spends 1 + 4 + 9 + 16 + 25 = 55 s before giving
    /// up. A stop request ends the wait early.
    async fn construct(
        &self,
        config: &PluginConfig,
        factory: &CollectorFactory,
    ) -> Result<Box<dyn crate::collector::Collector>, PluginInitError> {
        let policy = self.options.retry;
        let mut attempt = 1;
        loop {
            let e = match factory.build(config) {
                Ok(collector) => return Ok(collector),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            let delay = policy.delay(attempt);
            tracing::warn!(
                plugin = %config.section(),
                attempt,
                max_attempts = policy.max_attempts,
                backoff_ms = delay.as_millis(),
                error = %e,
                "Plugin construction failed"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.handle.shared.wake.notified() => {}
            }
            if self.handle.is_stopped() || attempt >= policy.max_attempts {
                return Err(e);
            }
            attempt += 1;
        }
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Registered plugin names in configured order.
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(PluginRuntime::name).collect()
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginRuntime> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn submit_stats(&self) -> SubmitStats {
        self.submitter.stats()
    }

    /// Trigger every due plugin and return how long to sleep.
    pub fn tick(&self) -> Duration {
        let now = now_millis();
        for plugin in self.plugins.iter().filter(|p| p.is_due(now)) {
            tracing::debug!(plugin = %plugin.name(), "Triggering plugin");
            plugin.run_now();
        }

        compute_sleep(
            self.plugins.iter().map(PluginRuntime::next_sched),
            now_millis(),
            self.options.min_sleep,
            self.options.idle_sleep,
        )
    }

    /// Drive the tick loop until stop is requested, then stop every worker.
    ///
    /// Does not wait for workers; use [`join`](Self::join) for that.
    pub async fn run(&self) {
        tracing::info!("Manager running");

        while !self.handle.is_stopped() {
            let sleep = self.tick();
            tracing::trace!(sleep_ms = sleep.as_millis(), "Sleeping until next tick");
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.handle.shared.wake.notified() => {}
            }
        }

        self.shutdown();
    }

    /// Signal every plugin worker and the submitter to stop.
    pub fn shutdown(&self) {
        self.handle.stop();
        for plugin in &self.plugins {
            plugin.stop();
        }
        self.submitter.stop();
        tracing::info!("Stop signalled to all workers");
    }

    /// Wait up to `timeout` for every worker to exit. Returns `true` if all did.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut all_done = true;

        for plugin in &mut self.plugins {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !plugin.join(remaining).await {
                tracing::warn!(plugin = %plugin.name(), "Plugin worker still running after join timeout");
                all_done = false;
            }
        }

        while self.submitter.is_running() && Instant::now() < deadline {
            tokio::time::sleep(JOIN_POLL).await;
        }
        if !self.submitter.join(Duration::ZERO) {
            tracing::warn!("Submitter still running after join timeout");
            all_done = false;
        }

        let stats = self.submitter.stats();
        tracing::info!(
            delivered = stats.delivered,
            failed = stats.failed,
            clean = all_done,
            "Manager stopped"
        );
        all_done
    }
}
