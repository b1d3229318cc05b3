// ============================================================================
// AGENT
// ============================================================================
// Three concurrent activities share one cancellation token:
//
//   poll tick    -> collector -> local MemStore
//   report tick  -> MemStore::get_all -> Batch -> DispatchPipeline::try_enqueue
//   health tick  -> TransportClient::health_check (logging only)
//
// The local store accumulates between reports and is never reset, so each
// batch carries the running counter totals.
// ============================================================================

use std::net::UdpSocket;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::{Collector, SystemCollector};
use crate::config::AgentConfig;
use crate::crypto::CryptoContext;
use crate::error::SynapseResult;
use crate::model::Batch;
use crate::pipeline::{spawn_health_loop, DispatchPipeline, DispatchStatsSnapshot};
use crate::signer::Signer;
use crate::store::{MemStore, MetricStore};
use crate::transport::http::HttpSettings;
use crate::transport::{HttpTransport, MetricProcessor, RetrySchedule, RpcTransport, TransportClient, TransportKind};

const FALLBACK_ORIGIN: &str = "127.0.0.1";

pub struct Agent {
    config: AgentConfig,
    collector: Box<dyn Collector>,
    transport: Arc<dyn TransportClient>,
    local: MemStore,
    origin: String,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("collector", &self.collector.name())
            .field("transport", &self.transport.name())
            .field("origin", &self.origin)
            .finish()
    }
}

impl Agent {
    /// System collector plus the transport the config selects
    pub fn new(config: AgentConfig) -> SynapseResult<Self> {
        let transport = build_transport(&config)?;
        let origin = detect_origin_ip(&config.address);
        Ok(Self::with_parts(config, Box::new(SystemCollector::new()), transport, origin))
    }

    pub fn with_parts(
        config: AgentConfig,
        collector: Box<dyn Collector>,
        transport: Arc<dyn TransportClient>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            config,
            collector,
            transport,
            local: MemStore::default(),
            origin: origin.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn poll(&mut self) {
        let samples = self.collector.collect();
        if let Err(e) = self.local.apply_batch(&samples) {
            warn!(target: "synapse::agent", collector = self.collector.name(), error = %e, "Discarding poll");
        }
    }

    /// Current local totals, `None` when nothing has been collected yet
    fn snapshot(&self) -> Option<Batch> {
        match self.local.get_all() {
            Ok(samples) if !samples.is_empty() => Some(Batch::new(samples)),
            Ok(_) => None,
            Err(e) => {
                warn!(target: "synapse::agent", error = %e, "Local snapshot failed");
                None
            }
        }
    }

    /// Run until `token` is cancelled, then flush and drain
    pub async fn run(mut self, token: CancellationToken) -> DispatchStatsSnapshot {
        info!(
            target: "synapse::agent",
            transport = self.transport.name(),
            address = %self.config.address,
            origin = %self.origin,
            poll = ?self.config.poll_interval,
            report = ?self.config.report_interval,
            rate_limit = self.config.rate_limit,
            "Agent started"
        );

        let pipeline = DispatchPipeline::start(self.transport.clone(), self.origin.as_str(), self.config.rate_limit);
        let health = spawn_health_loop(self.transport.clone(), self.config.health_interval, token.child_token());

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = tokio::time::interval(self.config.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Nothing to report before the first poll.
        report.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = poll.tick() => self.poll(),
                _ = report.tick() => {
                    if let Some(batch) = self.snapshot() {
                        pipeline.try_enqueue(batch);
                    } else {
                        debug!(target: "synapse::agent", "Nothing collected yet");
                    }
                }
            }
        }

        info!(target: "synapse::agent", "Shutdown requested, flushing");
        let stats = pipeline
            .shutdown(self.snapshot(), self.config.final_flush_timeout)
            .await;
        if let Err(e) = health.await {
            warn!(target: "synapse::agent", error = %e, "Health loop terminated abnormally");
        }
        self.transport.close().await;

        info!(
            target: "synapse::agent",
            enqueued = stats.enqueued,
            dropped = stats.dropped,
            processed = stats.processed,
            "Agent stopped"
        );
        stats
    }
}

pub fn build_transport(config: &AgentConfig) -> SynapseResult<Arc<dyn TransportClient>> {
    let crypto = CryptoContext::from_paths(config.crypto_key_path(), None)?;
    let processor = MetricProcessor::new(crypto, Signer::new(&config.key));

    let transport: Arc<dyn TransportClient> = match config.transport {
        TransportKind::Http => {
            let settings = HttpSettings {
                request_timeout: config.request_timeout,
                retry: RetrySchedule::new(config.retry_delays.clone()),
                ..HttpSettings::default()
            };
            Arc::new(HttpTransport::new(&config.address, processor, settings)?)
        }
        TransportKind::Rpc => Arc::new(RpcTransport::new(config.rpc_target(), processor)),
    };
    Ok(transport)
}

/// Local address of the interface that routes to `target`. No packet is sent.
pub fn detect_origin_ip(target: &str) -> String {
    let target = target
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');

    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect(target)?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| FALLBACK_ORIGIN.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportResult;
    use crate::model::MetricSample;
    use crate::pipeline::FinalFlush;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Recording {
        batches: Mutex<Vec<(Batch, String)>>,
    }

    #[async_trait]
    impl TransportClient for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn try_send_batch(&self, batch: &Batch, origin: &str) -> TransportResult<()> {
            self.batches.lock().push((batch.clone(), origin.to_string()));
            Ok(())
        }

        async fn health_check(&self) -> TransportResult<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    struct Fixed;

    impl Collector for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn collect(&mut self) -> Vec<MetricSample> {
            vec![MetricSample::gauge("Alloc", 1.0), MetricSample::counter("PollCount", 1)]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_running_totals_and_flushes_on_shutdown() {
        let config = AgentConfig {
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            ..AgentConfig::default()
        };
        let transport = Arc::new(Recording::default());
        let agent = Agent::with_parts(config, Box::new(Fixed), transport.clone(), "10.9.8.7");

        let token = CancellationToken::new();
        let running = tokio::spawn(agent.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(11)).await;
        token.cancel();
        let stats = running.await.unwrap();

        assert_eq!(stats.final_flush, FinalFlush::Enqueued);
        let batches = transport.batches.lock();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|(_, origin)| origin == "10.9.8.7"));

        // Polls at 0, 2, 4, 6, 8 and 10 seconds; the report at 10s may land
        // on either side of the last poll.
        let first = batches[0].0.iter().find(|s| s.id == "PollCount").unwrap().delta.unwrap();
        assert!((5..=6).contains(&first), "{first}");
        let last = batches[1].0.iter().find(|s| s.id == "PollCount").unwrap().delta.unwrap();
        assert_eq!(last, 6);
    }

    #[test]
    fn test_origin_falls_back_to_loopback() {
        assert_eq!(detect_origin_ip("not a socket address"), FALLBACK_ORIGIN);
        assert_eq!(detect_origin_ip("127.0.0.1:8080"), "127.0.0.1");
    }

    #[test]
    fn test_transport_selection() {
        let http = build_transport(&AgentConfig::default()).unwrap();
        assert_eq!(http.name(), "http");

        let rpc = build_transport(&AgentConfig {
            transport: TransportKind::Rpc,
            ..AgentConfig::default()
        })
        .unwrap();
        assert_eq!(rpc.name(), "rpc");
    }
}
