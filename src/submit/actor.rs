//! Delivery worker with a dedicated OS thread.
//!
//! Single-consumer pattern: one thread owns the [`ResultReceiver`] and the
//! [`SubmitClient`], polling the channel with a short timeout so a stop
//! request is noticed promptly even when no batches arrive.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::channel::{Batch, ChannelError, ResultReceiver};
use crate::collector::panic_message;
use crate::submit::{SubmissionError, SubmitClient};

// =============================================================================
// Constants
// =============================================================================

/// How long each poll of the result channel waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Granularity of the bounded wait in [`Submitter::join`].
const JOIN_POLL: Duration = Duration::from_millis(10);

const THREAD_NAME: &str = "tithe-submitter";

// =============================================================================
// Stats
// =============================================================================

/// Snapshot of delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitStats {
    /// Batches accepted by the backend.
    pub delivered: u64,
    /// Batches whose submission failed or panicked (dropped).
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Shared {
    stop: AtomicBool,
    delivered: AtomicU64,
    failed: AtomicU64,
}

// =============================================================================
// Submitter
// =============================================================================

/// Handle to the delivery worker thread.
#[derive(Debug)]
pub struct Submitter {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Submitter {
    /// Spawn the delivery worker.
    ///
    /// # Errors
    /// Returns the I/O error if the OS refuses to create the thread.
    pub fn spawn(
        rx: ResultReceiver,
        client: Box<dyn SubmitClient>,
        poll_interval: Duration,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let mut worker = Worker {
            rx,
            client,
            shared: Arc::clone(&shared),
            poll_interval,
        };

        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Request the worker to exit after its current poll or submission.
    ///
    /// Batches still queued are not drained.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Whether the worker thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait up to `timeout` for the worker thread to exit.
    ///
    /// Returns `true` if the thread has finished (or was already joined).
    pub fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                self.handle = Some(handle);
                return false;
            }
            thread::sleep(JOIN_POLL);
        }

        if handle.join().is_err() {
            tracing::error!("Submitter thread panicked");
        }
        true
    }

    pub fn stats(&self) -> SubmitStats {
        SubmitStats {
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    rx: ResultReceiver,
    client: Box<dyn SubmitClient>,
    shared: Arc<Shared>,
    poll_interval: Duration,
}

impl Worker {
    fn run(&mut self) {
        tracing::info!("Submitter started");

        while !self.shared.stop.load(Ordering::SeqCst) {
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(Some(batch)) => self.submit(batch),
                Ok(None) => {
                    // Poll timeout: re-check the stop flag
                }
                Err(ChannelError::Closed) => {
                    tracing::info!("Result channel closed, shutting down");
                    break;
                }
                Err(ChannelError::Full) => {}
            }
        }

        tracing::info!(
            delivered = self.shared.delivered.load(Ordering::Relaxed),
            failed = self.shared.failed.load(Ordering::Relaxed),
            "Submitter stopped"
        );
    }

    fn submit(&mut self, batch: Batch) {
        let start = Instant::now();
        let client = &mut self.client;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| client.submit(&batch.samples)))
            .unwrap_or_else(|panic| {
                Err(SubmissionError::Other(format!(
                    "client panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match outcome {
            Ok(()) => {
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    plugin = %batch.source,
                    count = batch.len(),
                    duration_ms = start.elapsed().as_millis(),
                    "Batch submitted"
                );
            }
            Err(e) => {
                self.shared.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    plugin = %batch.source,
                    count = batch.len(),
                    error = %e,
                    "Failed to submit batch"
                );
            }
        }
    }
}
