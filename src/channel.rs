//! Result channel between plugin workers and the delivery worker.
//!
//! Multi-producer, single-consumer queue of [`Batch`]es built on
//! `std::sync::mpsc`. Producers are plugin workers; the only consumer is the
//! [`Submitter`](crate::submit::Submitter) thread.
//!
//! - Unbounded (capacity `None`): reference behaviour, sends never fail while
//!   the consumer is alive.
//! - Bounded (capacity `Some(n)`): sends use `try_send`; when the queue is full
//!   the new batch is dropped and counted, so producers never block.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::time::Duration;

use thiserror::Error;

use crate::sample::MetricSample;

/// Errors returned when pushing a batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Bounded channel is at capacity; the batch was dropped.
    #[error("result channel full, batch dropped")]
    Full,

    /// The consumer has gone away.
    #[error("result channel closed")]
    Closed,
}

/// Samples emitted by one collection cycle of one plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Registry name of the emitting plugin.
    pub source: String,
    /// Samples in emission order.
    pub samples: Vec<MetricSample>,
}

impl Batch {
    pub fn new(source: impl Into<String>, samples: Vec<MetricSample>) -> Self {
        Self {
            source: source.into(),
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Clone)]
enum SenderKind {
    Unbounded(Sender<Batch>),
    Bounded(SyncSender<Batch>),
}

/// Producer half. Cheap to clone; one clone per plugin worker.
#[derive(Clone)]
pub struct ResultSender {
    tx: SenderKind,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for ResultSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSender")
            .field("bounded", &matches!(self.tx, SenderKind::Bounded(_)))
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl ResultSender {
    /// Push a batch without blocking.
    pub fn send(&self, batch: Batch) -> Result<(), ChannelError> {
        match &self.tx {
            SenderKind::Unbounded(tx) => tx.send(batch).map_err(|_| ChannelError::Closed),
            SenderKind::Bounded(tx) => match tx.try_send(batch) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(batch)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        plugin = %batch.source,
                        samples = batch.len(),
                        "Result channel full, dropping batch"
                    );
                    Err(ChannelError::Full)
                }
                Err(TrySendError::Disconnected(_)) => Err(ChannelError::Closed),
            },
        }
    }

    /// Total batches dropped because the bounded channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half, owned by the delivery worker.
#[derive(Debug)]
pub struct ResultReceiver {
    rx: Receiver<Batch>,
}

impl ResultReceiver {
    /// Wait up to `timeout` for the next batch.
    ///
    /// Returns `Ok(None)` on timeout and `Err(ChannelError::Closed)` once all
    /// senders are dropped and the queue is drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Batch>, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(batch) => Ok(Some(batch)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Closed),
        }
    }

    /// Take a batch if one is immediately available.
    pub fn try_recv(&self) -> Option<Batch> {
        self.rx.try_recv().ok()
    }
}

/// Create a result channel. `capacity` of `None` means unbounded.
pub fn result_channel(capacity: Option<usize>) -> (ResultSender, ResultReceiver) {
    let (tx, rx) = match capacity {
        None => {
            let (tx, rx) = mpsc::channel();
            (SenderKind::Unbounded(tx), rx)
        }
        Some(cap) => {
            let (tx, rx) = mpsc::sync_channel(cap.max(1));
            (SenderKind::Bounded(tx), rx)
        }
    };

    (
        ResultSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        ResultReceiver { rx },
    )
}
