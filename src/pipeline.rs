// ============================================================================
// DISPATCH PIPELINE
// ============================================================================
// Decouples the report timer from the network:
//
//   producer --try_send--> [bounded flume queue] --recv_async--> N workers
//
// The producer never waits. A full queue drops the batch and bumps a counter.
// Workers exit only when the queue is closed and drained, so every batch that
// was accepted is eventually handed to the transport.
// ============================================================================

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver as FlumeReceiver, Sender as FlumeSender, TrySendError};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::Batch;
use crate::transport::TransportClient;

/// Default final enqueue window on shutdown
pub const DEFAULT_FINAL_FLUSH_TIMEOUT: Duration = Duration::from_millis(100);

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// What happened to the batch offered on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalFlush {
    NotAttempted,
    Enqueued,
    TimedOut,
}

impl FinalFlush {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FinalFlush::Enqueued,
            2 => FinalFlush::TimedOut,
            _ => FinalFlush::NotAttempted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FinalFlush::NotAttempted => 0,
            FinalFlush::Enqueued => 1,
            FinalFlush::TimedOut => 2,
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    final_flush: AtomicU8,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_processed(&self) {
        self.processed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_final_flush(&self, outcome: FinalFlush) {
        self.final_flush.store(outcome.as_u8(), AtomicOrdering::Release);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            enqueued: self.enqueued.load(AtomicOrdering::Relaxed),
            dropped: self.dropped.load(AtomicOrdering::Relaxed),
            processed: self.processed.load(AtomicOrdering::Relaxed),
            final_flush: FinalFlush::from_u8(self.final_flush.load(AtomicOrdering::Acquire)),
        }
    }
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    /// Batches a worker handed to the transport, delivered or not
    pub processed: u64,
    pub final_flush: FinalFlush,
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

pub struct DispatchPipeline {
    sender: FlumeSender<Batch>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<DispatchStats>,
    capacity: usize,
}

impl std::fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("capacity", &self.capacity)
            .field("workers", &self.workers.len())
            .field("queued", &self.sender.len())
            .finish()
    }
}

impl DispatchPipeline {
    /// Spawn `rate_limit` workers behind a queue of the same capacity
    pub fn start(transport: Arc<dyn TransportClient>, origin: impl Into<Arc<str>>, rate_limit: usize) -> Self {
        let capacity = rate_limit.max(1);
        let origin = origin.into();
        let (sender, receiver) = flume::bounded(capacity);
        let stats = Arc::new(DispatchStats::new());

        let workers = (0..capacity)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    receiver.clone(),
                    transport.clone(),
                    origin.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        info!(
            target: "synapse::pipeline",
            transport = transport.name(),
            workers = capacity,
            capacity,
            "Dispatch pipeline started"
        );

        Self {
            sender,
            workers,
            stats,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    /// Never blocks. Returns false when the batch was dropped.
    pub fn try_enqueue(&self, batch: Batch) -> bool {
        let metrics = batch.len();
        match self.sender.try_send(batch) {
            Ok(()) => {
                self.stats.record_enqueued();
                debug!(target: "synapse::pipeline", metrics, queued = self.sender.len(), "Batch enqueued");
                true
            }
            Err(TrySendError::Full(_)) => {
                self.stats.record_dropped();
                warn!(
                    target: "synapse::pipeline",
                    metrics,
                    capacity = self.capacity,
                    dropped_total = self.stats.dropped(),
                    "Queue full, batch dropped"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.record_dropped();
                warn!(target: "synapse::pipeline", metrics, "Queue closed, batch dropped");
                false
            }
        }
    }

    /// Offer one last batch for at most `timeout`, close the queue and wait
    /// for the workers to drain it.
    pub async fn shutdown(self, final_batch: Option<Batch>, timeout: Duration) -> DispatchStatsSnapshot {
        let Self {
            sender,
            workers,
            stats,
            ..
        } = self;

        if let Some(batch) = final_batch {
            let metrics = batch.len();
            match tokio::time::timeout(timeout, sender.send_async(batch)).await {
                Ok(Ok(())) => {
                    stats.record_enqueued();
                    stats.record_final_flush(FinalFlush::Enqueued);
                    info!(target: "synapse::pipeline", metrics, "Final batch enqueued");
                }
                Ok(Err(_)) | Err(_) => {
                    stats.record_dropped();
                    stats.record_final_flush(FinalFlush::TimedOut);
                    warn!(
                        target: "synapse::pipeline",
                        metrics,
                        timeout_ms = timeout.as_millis() as u64,
                        "Final batch could not be enqueued"
                    );
                }
            }
        }

        // Workers see the closure once the queue is empty.
        drop(sender);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(target: "synapse::pipeline", error = %e, "Worker terminated abnormally");
            }
        }

        let snapshot = stats.snapshot();
        info!(
            target: "synapse::pipeline",
            enqueued = snapshot.enqueued,
            dropped = snapshot.dropped,
            processed = snapshot.processed,
            "Dispatch pipeline drained"
        );
        snapshot
    }
}

async fn run_worker(
    worker: usize,
    receiver: FlumeReceiver<Batch>,
    transport: Arc<dyn TransportClient>,
    origin: Arc<str>,
    stats: Arc<DispatchStats>,
) {
    debug!(target: "synapse::pipeline", worker, "Worker started");
    while let Ok(batch) = receiver.recv_async().await {
        transport.send_batch(&batch, &origin).await;
        stats.record_processed();
    }
    debug!(target: "synapse::pipeline", worker, "Worker stopped");
}

// ----------------------------------------------------------------------------
// Health loop
// ----------------------------------------------------------------------------

/// Health-checks the transport on its own interval until cancelled. Logging only.
pub fn spawn_health_loop(
    transport: Arc<dyn TransportClient>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match transport.health_check().await {
                        Ok(()) => debug!(target: "synapse::health", transport = transport.name(), "Server healthy"),
                        Err(e) => warn!(target: "synapse::health", transport = transport.name(), error = %e, "Server unhealthy"),
                    }
                }
            }
        }
        debug!(target: "synapse::health", "Health loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportResult;
    use crate::model::MetricSample;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    /// Holds every send until a permit is released
    #[derive(Debug)]
    struct Gated {
        gate: Semaphore,
        started: flume::Sender<usize>,
        delivered: AtomicUsize,
        health_checks: AtomicUsize,
    }

    impl Gated {
        fn new() -> (Arc<Self>, flume::Receiver<usize>) {
            let (started, started_rx) = flume::unbounded();
            let transport = Arc::new(Self {
                gate: Semaphore::new(0),
                started,
                delivered: AtomicUsize::new(0),
                health_checks: AtomicUsize::new(0),
            });
            (transport, started_rx)
        }
    }

    #[async_trait]
    impl TransportClient for Gated {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn try_send_batch(&self, batch: &Batch, _origin: &str) -> TransportResult<()> {
            let _ = self.started.send(batch.len());
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.delivered.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        async fn health_check(&self) -> TransportResult<()> {
            self.health_checks.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        async fn close(&self) {}
    }

    fn batch(n: i64) -> Batch {
        Batch::new(vec![MetricSample::counter("PollCount", n)])
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (transport, started) = Gated::new();
        let pipeline = DispatchPipeline::start(transport.clone(), "127.0.0.1", 1);

        assert!(pipeline.try_enqueue(batch(1)));
        // The only worker now holds the first batch.
        started.recv_async().await.unwrap();

        assert!(pipeline.try_enqueue(batch(2)));
        assert!(!pipeline.try_enqueue(batch(3)));
        assert!(!pipeline.try_enqueue(batch(4)));
        assert_eq!(pipeline.stats().dropped(), 2);

        transport.gate.add_permits(10);
        let snapshot = pipeline.shutdown(None, DEFAULT_FINAL_FLUSH_TIMEOUT).await;
        assert_eq!(snapshot.enqueued, 2);
        assert_eq!(snapshot.dropped, 2);
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.final_flush, FinalFlush::NotAttempted);
        assert_eq!(transport.delivered.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_and_final_batch() {
        let (transport, _started) = Gated::new();
        transport.gate.add_permits(100);
        let pipeline = DispatchPipeline::start(transport.clone(), "127.0.0.1", 3);
        assert_eq!(pipeline.capacity(), 3);

        for n in 0..3 {
            pipeline.try_enqueue(batch(n));
        }
        let snapshot = pipeline.shutdown(Some(batch(99)), DEFAULT_FINAL_FLUSH_TIMEOUT).await;
        assert_eq!(snapshot.final_flush, FinalFlush::Enqueued);
        assert_eq!(snapshot.processed, snapshot.enqueued);
        assert_eq!(
            transport.delivered.load(AtomicOrdering::SeqCst) as u64,
            snapshot.enqueued
        );
    }

    #[tokio::test]
    async fn test_final_flush_times_out_on_full_queue() {
        let (transport, started) = Gated::new();
        let pipeline = DispatchPipeline::start(transport.clone(), "127.0.0.1", 1);
        pipeline.try_enqueue(batch(1));
        started.recv_async().await.unwrap();
        pipeline.try_enqueue(batch(2));

        let release = {
            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                transport.gate.add_permits(10);
            })
        };

        let snapshot = pipeline.shutdown(Some(batch(3)), Duration::from_millis(20)).await;
        release.await.unwrap();
        assert_eq!(snapshot.final_flush, FinalFlush::TimedOut);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.processed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_runs_until_cancelled() {
        let (transport, _started) = Gated::new();
        let token = CancellationToken::new();
        let handle = spawn_health_loop(transport.clone(), Duration::from_secs(5), token.clone());

        tokio::time::sleep(Duration::from_secs(16)).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(transport.health_checks.load(AtomicOrdering::SeqCst), 3);
    }
}
