// ============================================================================
// TRANSPORT CLIENTS
// ============================================================================
// Two interchangeable clients share the `TransportClient` contract:
//
//   HttpTransport - one gzip POST per batch, fixed retry schedule
//   RpcTransport  - gRPC over one shared HTTP/2 channel
// ============================================================================

pub mod http;
pub mod processor;
pub mod rpc;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::TransportResult;
use crate::model::Batch;

pub use http::HttpTransport;
pub use processor::{Integrity, MetricProcessor};
pub use rpc::RpcTransport;

/// Client contract used by the dispatch pipeline
#[async_trait]
pub trait TransportClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver one batch, tagging it with the agent's origin address
    async fn try_send_batch(&self, batch: &Batch, origin: &str) -> TransportResult<()>;

    async fn health_check(&self) -> TransportResult<()>;

    async fn close(&self);

    /// Fire-and-report delivery: the outcome is logged, never returned
    async fn send_batch(&self, batch: &Batch, origin: &str) {
        match self.try_send_batch(batch, origin).await {
            Ok(()) => info!(
                target: "synapse::transport",
                transport = self.name(),
                metrics = batch.len(),
                origin,
                "Batch delivered"
            ),
            Err(e) => error!(
                target: "synapse::transport",
                transport = self.name(),
                metrics = batch.len(),
                origin,
                error = %e,
                "Batch dropped"
            ),
        }
    }
}

/// Selects which client the agent builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Rpc,
}

// ----------------------------------------------------------------------------
// Retry schedule
// ----------------------------------------------------------------------------

/// Literal, ordered list of delays. One attempt is made per entry and the
/// entry's delay is slept after that attempt fails, the last one included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn attempts(&self) -> usize {
        self.delays.len().max(1)
    }

    /// Delay to sleep after the failed attempt at `index` (zero-based)
    pub fn delay_after(&self, index: usize) -> Duration {
        self.delays.get(index).copied().unwrap_or_default()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(3),
            Duration::from_secs(5),
        ])
    }
}
