//! Pipeline Integration Tests for Tithe
//!
//! Drives the manager end to end with scripted collectors and an in-memory
//! submission client.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tithe::{
    AgentConfig, CollectionError, Collector, CollectorFactory, Manager, ManagerHandle,
    ManagerOptions, MetricSample, PluginConfig, PluginInitError, RetryPolicy, SubmissionError,
    SubmitClient,
};
use tokio::sync::Notify;

// =============================================================================
// Test Helpers
// =============================================================================

/// Emits one increasing gauge per cycle and counts its calls.
struct Sequence {
    calls: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl Collector for Sequence {
    async fn collect(&mut self) -> Result<Vec<MetricSample>, CollectionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MetricSample::builder("sequence", NonZeroU64::MIN)
            .gauge("n", n as f64)
            .build()
            .into_iter()
            .collect())
    }
}

/// Blocks mid-collection until released.
struct Slow {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    finished: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Collector for Slow {
    async fn collect(&mut self) -> Result<Vec<MetricSample>, CollectionError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(MetricSample::builder("slow", NonZeroU64::MIN)
            .gauge("v", 1.0)
            .build()
            .into_iter()
            .collect())
    }
}

/// Records every delivered batch; fails the first `fail_first` calls.
#[derive(Clone, Default)]
struct Recorder {
    batches: Arc<Mutex<Vec<Vec<MetricSample>>>>,
    calls: Arc<AtomicU32>,
    fail_first: u32,
}

impl Recorder {
    fn failing_first(n: u32) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    fn values(&self) -> Vec<f64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.iter().flat_map(|s| s.values().to_vec()))
            .collect()
    }

    fn len(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

impl SubmitClient for Recorder {
    fn submit(&mut self, batch: &[MetricSample]) -> Result<(), SubmissionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(SubmissionError::Status(503));
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

fn section(name: &str, implementation: &str, interval: u64) -> PluginConfig {
    PluginConfig::from_pairs(
        name,
        [
            ("name", implementation.to_string()),
            ("interval", interval.to_string()),
        ],
    )
    .unwrap()
}

fn sequence_factory(calls: &Arc<AtomicU64>) -> CollectorFactory {
    let mut factory = CollectorFactory::new();
    let calls = Arc::clone(calls);
    factory.register("sequence", move |_| {
        Ok(Box::new(Sequence {
            calls: Arc::clone(&calls),
        }))
    });
    factory
}

/// Run the manager's tick loop for `duration`, then stop and join it.
async fn run_for(manager: &mut Manager, duration: Duration) {
    let handle = manager.handle();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        handle.stop();
    });
    manager.run().await;
    assert!(manager.join(Duration::from_secs(2)).await);
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_single_plugin_collects_and_delivers_once() {
    let calls = Arc::new(AtomicU64::new(0));
    let recorder = Recorder::default();

    let mut manager = Manager::start_with_options(
        vec![section("seq", "sequence", 5)],
        &sequence_factory(&calls),
        Box::new(recorder.clone()),
        ManagerOptions::default(),
        ManagerHandle::default(),
    )
    .await
    .unwrap();

    run_for(&mut manager, Duration::from_secs(3)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.values(), [1.0]);
    assert_eq!(manager.submit_stats().delivered, 1);

    let stats = manager.plugin("seq").unwrap().stats();
    assert_eq!(stats.triggered, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_failing_constructor_does_not_block_other_plugins() {
    let calls = Arc::new(AtomicU64::new(0));
    let attempts = Arc::new(AtomicU32::new(0));
    let mut factory = sequence_factory(&calls);
    let seen = Arc::clone(&attempts);
    factory.register("flaky", move |config| {
        seen.fetch_add(1, Ordering::SeqCst);
        Err(PluginInitError::Unavailable {
            plugin: config.section().to_string(),
            reason: "device not ready".into(),
        })
    });

    let recorder = Recorder::default();
    let options = ManagerOptions {
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(2),
        },
        ..ManagerOptions::default()
    };

    let started = Instant::now();
    let mut manager = Manager::start_with_options(
        vec![section("broken", "flaky", 5), section("seq", "sequence", 5)],
        &factory,
        Box::new(recorder.clone()),
        options,
        ManagerHandle::default(),
    )
    .await
    .unwrap();

    // 2 × (1 + 4 + 9 + 16 + 25) ms of backoff across the five attempts.
    assert!(started.elapsed() >= Duration::from_millis(110));
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    assert_eq!(manager.plugin_names(), ["seq"]);

    run_for(&mut manager, Duration::from_millis(500)).await;
    assert_eq!(recorder.len(), 1);
}

#[tokio::test]
async fn test_failed_submission_is_not_retried() {
    let calls = Arc::new(AtomicU64::new(0));
    let recorder = Recorder::failing_first(1);

    let mut manager = Manager::start_with_options(
        vec![section("seq", "sequence", 1)],
        &sequence_factory(&calls),
        Box::new(recorder.clone()),
        ManagerOptions::default(),
        ManagerHandle::default(),
    )
    .await
    .unwrap();

    run_for(&mut manager, Duration::from_millis(1500)).await;

    // Cycle 1 was rejected and dropped; cycle 2 went through.
    assert!(calls.load(Ordering::SeqCst) >= 2);
    let values = recorder.values();
    assert_eq!(values.first(), Some(&2.0));
    assert!(!values.contains(&1.0));

    let stats = manager.submit_stats();
    assert_eq!(stats.failed, 1);
    assert!(stats.delivered >= 1);
}

#[tokio::test]
async fn test_stop_during_collection_delivers_nothing_more() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));

    let mut factory = CollectorFactory::new();
    {
        let (entered, release, finished) = (entered.clone(), release.clone(), finished.clone());
        factory.register("slow", move |_| {
            Ok(Box::new(Slow {
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
                finished: Arc::clone(&finished),
            }))
        });
    }

    let recorder = Recorder::default();
    let mut manager = Manager::start_with_options(
        vec![section("slow", "slow", 60)],
        &factory,
        Box::new(recorder.clone()),
        ManagerOptions::default(),
        ManagerHandle::default(),
    )
    .await
    .unwrap();

    manager.tick();
    entered.notified().await;

    // Stop while collect() is in flight, then let it finish.
    manager.shutdown();
    release.notify_one();

    assert!(manager.join(Duration::from_secs(2)).await);
    assert!(finished.load(Ordering::SeqCst));

    let runtime = manager.plugin("slow").unwrap();
    assert!(!runtime.is_running());
    let stats = runtime.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.discarded, 1);
    assert_eq!(recorder.len(), 0);
}

// =============================================================================
// Ordering & Schedule
// =============================================================================

#[tokio::test]
async fn test_batches_from_one_plugin_arrive_in_order() {
    let calls = Arc::new(AtomicU64::new(0));
    let recorder = Recorder::default();

    let mut manager = Manager::start_with_options(
        vec![section("seq", "sequence", 1)],
        &sequence_factory(&calls),
        Box::new(recorder.clone()),
        ManagerOptions::default(),
        ManagerHandle::default(),
    )
    .await
    .unwrap();

    run_for(&mut manager, Duration::from_millis(2500)).await;

    let values = recorder.values();
    assert!(values.len() >= 2, "expected several cycles, got {values:?}");
    assert!(values.windows(2).all(|w| w[0] < w[1]), "out of order: {values:?}");
}

#[tokio::test]
async fn test_schedule_advances_by_whole_intervals() {
    let calls = Arc::new(AtomicU64::new(0));
    let mut manager = Manager::start_with_options(
        vec![section("seq", "sequence", 1)],
        &sequence_factory(&calls),
        Box::new(Recorder::default()),
        ManagerOptions::default(),
        ManagerHandle::default(),
    )
    .await
    .unwrap();

    let initial = manager.plugin("seq").unwrap().next_sched();
    run_for(&mut manager, Duration::from_millis(2300)).await;

    let runtime = manager.plugin("seq").unwrap();
    let triggered = runtime.stats().triggered as i64;
    assert!(triggered >= 2);
    assert_eq!(runtime.next_sched(), initial + triggered * 1000);
}

#[tokio::test]
async fn test_start_from_yaml_config() {
    let calls = Arc::new(AtomicU64::new(0));
    let config = AgentConfig::from_yaml_str(
        r#"
main:
  submission_url: "http://127.0.0.1:9/collectd"
  plugins_enabled: "first second"
first:
  name: sequence
  interval: 5
second:
  name: sequence
  interval: 10
"#,
    )
    .unwrap();

    let recorder = Recorder::default();
    let mut manager = Manager::start(
        &config,
        &sequence_factory(&calls),
        Box::new(recorder.clone()),
        ManagerHandle::default(),
    )
    .await
    .unwrap();
    assert_eq!(manager.plugin_names(), ["first", "second"]);

    manager.tick();
    assert!(wait_until(Duration::from_secs(2), || recorder.len() == 2).await);

    manager.shutdown();
    assert!(manager.join(Duration::from_secs(2)).await);
}

#[test]
fn test_sample_config_builds_with_builtins() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/tithe.yaml");
    let config = AgentConfig::load(path).unwrap();
    let factory = CollectorFactory::with_builtins();

    let sections = config.plugin_configs().unwrap();
    assert_eq!(sections.len(), 4);
    for section in &sections {
        assert!(
            factory.build(section).is_ok(),
            "section '{}' failed to build",
            section.section()
        );
    }
}
