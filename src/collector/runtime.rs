//! Per-plugin runtime: schedule state, trigger, and dedicated worker task.
//!
//! The manager never calls [`Collector::collect`] itself. It calls
//! [`PluginRuntime::run_now`], which wakes the plugin's own worker and
//! advances the schedule before the cycle finishes. The worker runs one cycle
//! at a time, so at most one collection is in flight per plugin.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::channel::{Batch, ResultSender};
use crate::collector::{CollectionError, Collector};
use crate::config::{PluginConfig, ScheduleMode};

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Snapshot of a plugin's cycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginStats {
    /// Times `run_now` armed the trigger.
    pub triggered: u64,
    /// Cycles that finished, successfully or not.
    pub completed: u64,
    /// Finished cycles that returned an error or panicked.
    pub failed: u64,
    /// Batches dropped because stop was requested mid-cycle.
    pub discarded: u64,
}

struct RuntimeShared {
    section: String,
    interval_ms: i64,
    mode: ScheduleMode,
    next_sched: AtomicI64,
    trigger: Notify,
    stop: AtomicBool,
    triggered: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl RuntimeShared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// A configured collector together with its schedule and worker.
pub struct PluginRuntime {
    config: PluginConfig,
    shared: Arc<RuntimeShared>,
    collector: Option<Box<dyn Collector>>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("section", &self.shared.section)
            .field("implementation", &self.config.name())
            .field("next_sched", &self.next_sched())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PluginRuntime {
    /// Wrap a freshly built collector. The plugin is due immediately.
    pub fn new(config: PluginConfig, collector: Box<dyn Collector>, mode: ScheduleMode) -> Self {
        let interval_ms = config.interval_millis();
        let shared = Arc::new(RuntimeShared {
            section: config.section().to_string(),
            interval_ms,
            mode,
            next_sched: AtomicI64::new(now_millis()),
            trigger: Notify::new(),
            stop: AtomicBool::new(false),
            triggered: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });

        Self {
            config,
            shared,
            collector: Some(collector),
            handle: None,
        }
    }

    /// Registry name (the config section).
    pub fn name(&self) -> &str {
        &self.shared.section
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Next scheduled run, epoch milliseconds.
    pub fn next_sched(&self) -> i64 {
        self.shared.next_sched.load(Ordering::Acquire)
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.next_sched() <= now_ms
    }

    /// Advance the schedule by one interval.
    ///
    /// Saturates at `i64::MAX`, so a huge interval parks the plugin instead
    /// of wrapping into the past.
    pub fn sched_next(&self) {
        let interval_ms = self.shared.interval_ms;
        match self.shared.mode {
            ScheduleMode::PhaseFixed => {
                // The closure always returns Some, so this cannot fail.
                let _ = self.shared.next_sched.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |prev| Some(prev.saturating_add(interval_ms)),
                );
            }
            ScheduleMode::DriftCorrected => {
                self.shared
                    .next_sched
                    .store(now_millis().saturating_add(interval_ms), Ordering::Release);
            }
        }
    }

    /// Arm the trigger for one cycle and advance the schedule right away.
    ///
    /// A trigger raised while a cycle is in flight is coalesced into a single
    /// follow-up cycle.
    pub fn run_now(&self) {
        self.shared.triggered.fetch_add(1, Ordering::Relaxed);
        self.shared.trigger.notify_one();
        self.sched_next();
    }

    /// Spawn the worker task. Must be called inside a Tokio runtime.
    ///
    /// Calling `start` on a runtime that already started is a no-op.
    pub fn start(&mut self, results: ResultSender) {
        let Some(collector) = self.collector.take() else {
            tracing::warn!(plugin = %self.name(), "Plugin worker already started");
            return;
        };

        let shared = Arc::clone(&self.shared);
        self.handle = Some(tokio::spawn(run_worker(shared, collector, results)));
        tracing::info!(
            plugin = %self.name(),
            implementation = %self.config.name(),
            interval_s = self.config.interval().get(),
            "Plugin worker started"
        );
    }

    /// Request the worker to exit after its current cycle.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.trigger.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait up to `timeout` for the worker to exit. Returns `true` if it did.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return true;
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {
                self.handle = None;
                true
            }
            Ok(Err(e)) => {
                tracing::error!(plugin = %self.shared.section, error = %e, "Plugin worker aborted");
                self.handle = None;
                true
            }
            Err(_) => false,
        }
    }

    pub fn stats(&self) -> PluginStats {
        PluginStats {
            triggered: self.shared.triggered.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    shared: Arc<RuntimeShared>,
    mut collector: Box<dyn Collector>,
    results: ResultSender,
) {
    while !shared.stopped() {
        shared.trigger.notified().await;
        if shared.stopped() {
            break;
        }
        run_cycle(&shared, collector.as_mut(), &results).await;
    }

    tracing::info!(plugin = %shared.section, "Plugin worker stopped");
}

/// Execute a single collection cycle and push its samples.
async fn run_cycle(shared: &RuntimeShared, collector: &mut dyn Collector, results: &ResultSender) {
    let start = Instant::now();
    tracing::debug!(plugin = %shared.section, "Running collection");

    let outcome = AssertUnwindSafe(collector.collect())
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(CollectionError::Panicked(panic_message(panic.as_ref()))));
    let duration_ms = start.elapsed().as_millis();
    shared.completed.fetch_add(1, Ordering::Relaxed);

    let samples = match outcome {
        Ok(samples) => samples,
        Err(e) => {
            shared.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(plugin = %shared.section, error = %e, duration_ms, "Collection failed");
            return;
        }
    };

    if samples.is_empty() {
        tracing::debug!(plugin = %shared.section, duration_ms, "Collection produced no samples");
        return;
    }

    if shared.stopped() {
        shared.discarded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            plugin = %shared.section,
            count = samples.len(),
            "Stop requested during collection, discarding batch"
        );
        return;
    }

    let count = samples.len();
    match results.send(Batch::new(shared.section.as_str(), samples)) {
        Ok(()) => {
            tracing::debug!(plugin = %shared.section, count, duration_ms, "Collection succeeded");
        }
        Err(e) => {
            tracing::warn!(plugin = %shared.section, error = %e, count, "Failed to enqueue batch");
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::result_channel;
    use crate::sample::MetricSample;
    use std::num::NonZeroU64;

    /// Scripted collector: fails on the cycles listed in `fail_on`.
    struct Scripted {
        calls: Arc<AtomicU64>,
        fail_on: Vec<u64>,
        panic_on: Option<u64>,
        delay: Duration,
    }

    impl Scripted {
        fn new(calls: Arc<AtomicU64>) -> Self {
            Self {
                calls,
                fail_on: Vec::new(),
                panic_on: None,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait::async_trait]
    impl Collector for Scripted {
        async fn collect(&mut self) -> Result<Vec<MetricSample>, CollectionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.panic_on == Some(n) {
                panic!("cycle {n} exploded");
            }
            if self.fail_on.contains(&n) {
                return Err(CollectionError::Other(format!("cycle {n} failed")));
            }
            Ok(MetricSample::builder("scripted", NonZeroU64::new(5).unwrap())
                .gauge("cycle", n as f64)
                .build()
                .into_iter()
                .collect())
        }
    }

    fn config(interval: u64) -> PluginConfig {
        PluginConfig::from_pairs(
            "scripted",
            [("name", "scripted".to_string()), ("interval", interval.to_string())],
        )
        .unwrap()
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_new_plugin_is_due_immediately() {
        let calls = Arc::new(AtomicU64::new(0));
        let runtime = PluginRuntime::new(
            config(30),
            Box::new(Scripted::new(calls)),
            ScheduleMode::PhaseFixed,
        );
        assert!(runtime.is_due(now_millis()));
        assert!(!runtime.is_running());
    }

    #[test]
    fn test_phase_fixed_sched_next_adds_interval_to_previous_value() {
        let calls = Arc::new(AtomicU64::new(0));
        let runtime = PluginRuntime::new(
            config(7),
            Box::new(Scripted::new(calls)),
            ScheduleMode::PhaseFixed,
        );
        let initial = runtime.next_sched();
        for _ in 0..5 {
            runtime.sched_next();
        }
        assert_eq!(runtime.next_sched(), initial + 5 * 7_000);
    }

    #[test]
    fn test_drift_corrected_sched_next_uses_wall_clock() {
        let calls = Arc::new(AtomicU64::new(0));
        let runtime = PluginRuntime::new(
            config(7),
            Box::new(Scripted::new(calls)),
            ScheduleMode::DriftCorrected,
        );
        runtime.sched_next();
        runtime.sched_next();
        let expected = now_millis() + 7_000;
        assert!((runtime.next_sched() - expected).abs() < 1_000);
    }

    #[test]
    fn test_huge_interval_never_wraps_into_the_past() {
        let max = i64::MAX / 1000;
        for mode in [ScheduleMode::PhaseFixed, ScheduleMode::DriftCorrected] {
            let calls = Arc::new(AtomicU64::new(0));
            let runtime = PluginRuntime::new(
                config(max as u64),
                Box::new(Scripted::new(calls)),
                mode,
            );
            let before = runtime.next_sched();

            runtime.run_now();
            assert!(runtime.next_sched() > before, "{mode:?} moved backwards");
            assert!(!runtime.is_due(now_millis()), "{mode:?} due again");

            runtime.sched_next();
            assert_eq!(runtime.next_sched(), i64::MAX);
        }
    }

    #[tokio::test]
    async fn test_cycles_advance_schedule_even_on_failure() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut collector = Scripted::new(Arc::clone(&calls));
        collector.fail_on = vec![2, 3];
        let mut runtime =
            PluginRuntime::new(config(5), Box::new(collector), ScheduleMode::PhaseFixed);
        let initial = runtime.next_sched();
        let (tx, rx) = result_channel(None);
        runtime.start(tx);

        for i in 1..=4u64 {
            runtime.run_now();
            wait_for(|| runtime.stats().completed == i).await;
        }

        let stats = runtime.stats();
        assert_eq!(stats.triggered, 4);
        assert_eq!(stats.failed, 2);
        assert_eq!(runtime.next_sched(), initial + 4 * 5_000);

        // Only cycles 1 and 4 produced batches, in order.
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_none());
        assert_eq!(first.samples[0].values(), [1.0]);
        assert_eq!(second.samples[0].values(), [4.0]);
        assert_eq!(first.source, "scripted");

        runtime.stop();
        assert!(runtime.join(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_collector() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut collector = Scripted::new(Arc::clone(&calls));
        collector.panic_on = Some(1);
        let mut runtime =
            PluginRuntime::new(config(5), Box::new(collector), ScheduleMode::PhaseFixed);
        let (tx, rx) = result_channel(None);
        runtime.start(tx);

        runtime.run_now();
        wait_for(|| runtime.stats().completed == 1).await;
        assert_eq!(runtime.stats().failed, 1);
        assert!(runtime.is_running());

        runtime.run_now();
        wait_for(|| runtime.stats().completed == 2).await;
        assert_eq!(rx.try_recv().unwrap().samples[0].values(), [2.0]);

        runtime.stop();
        assert!(runtime.join(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_stop_mid_cycle_discards_batch() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut collector = Scripted::new(Arc::clone(&calls));
        collector.delay = Duration::from_millis(200);
        let mut runtime =
            PluginRuntime::new(config(5), Box::new(collector), ScheduleMode::PhaseFixed);
        let (tx, rx) = result_channel(None);
        runtime.start(tx);

        runtime.run_now();
        wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
        runtime.stop();

        assert!(runtime.join(Duration::from_secs(2)).await);
        let stats = runtime.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.discarded, 1);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let calls = Arc::new(AtomicU64::new(0));
        let mut runtime = PluginRuntime::new(
            config(5),
            Box::new(Scripted::new(calls)),
            ScheduleMode::PhaseFixed,
        );
        let (tx, _rx) = result_channel(None);
        runtime.start(tx.clone());
        runtime.start(tx);
        assert!(runtime.is_running());

        runtime.stop();
        assert!(runtime.join(Duration::from_secs(1)).await);
        assert!(!runtime.is_running());
    }
}
