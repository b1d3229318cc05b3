//! Agent-side transports against a live server on ephemeral ports.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use synapse::agent::Agent;
use synapse::collector::Collector;
use synapse::config::{AgentConfig, ServerConfig};
use synapse::crypto::{keys, CryptoContext};
use synapse::error::{SynapseResult, TransportError};
use synapse::gateway::IngestionGateway;
use synapse::model::{Batch, MetricSample};
use synapse::server::Server;
use synapse::signer::Signer;
use synapse::transport::http::HttpSettings;
use synapse::transport::{HttpTransport, MetricProcessor, RetrySchedule, RpcTransport, TransportClient};

struct Running {
    http: String,
    rpc: String,
    gateway: Arc<IngestionGateway>,
    token: CancellationToken,
    handle: JoinHandle<SynapseResult<()>>,
}

impl Running {
    async fn stop(self) {
        self.token.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn start(config: ServerConfig) -> Running {
    let server = Server::new(config).unwrap();
    let gateway = server.gateway();

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let rpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = http_listener.local_addr().unwrap().to_string();
    let rpc = rpc_listener.local_addr().unwrap().to_string();

    let token = CancellationToken::new();
    let handle = tokio::spawn(server.serve(http_listener, Some(rpc_listener), token.clone()));
    Running {
        http,
        rpc,
        gateway,
        token,
        handle,
    }
}

fn server_config(dir: &Path) -> ServerConfig {
    ServerConfig {
        file_storage_path: dir.join("metrics.json"),
        ..ServerConfig::default()
    }
}

fn http_client(address: &str, crypto: CryptoContext, key: &str) -> HttpTransport {
    let settings = HttpSettings {
        retry: RetrySchedule::new(vec![Duration::from_millis(5)]),
        ..HttpSettings::default()
    };
    HttpTransport::new(address, MetricProcessor::new(crypto, Signer::new(key)), settings).unwrap()
}

fn sample_batch() -> Batch {
    Batch::new(vec![
        MetricSample::counter("PollCount", 3),
        MetricSample::gauge("Alloc", 1024.5),
    ])
}

#[tokio::test]
async fn signed_http_batches_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(ServerConfig {
        key: "shared".into(),
        ..server_config(dir.path())
    })
    .await;
    let client = http_client(&server.http, CryptoContext::disabled(), "shared");

    assert_ok!(client.health_check().await);
    assert_ok!(client.try_send_batch(&sample_batch(), "127.0.0.1").await);
    assert_ok!(client.try_send_batch(&sample_batch(), "127.0.0.1").await);

    assert_eq!(server.gateway.get_one("counter", "PollCount").unwrap().delta, Some(6));
    assert_eq!(server.gateway.get_one("gauge", "Alloc").unwrap().value, Some(1024.5));
    server.stop().await;
}

#[tokio::test]
async fn wrong_signing_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(ServerConfig {
        key: "shared".into(),
        ..server_config(dir.path())
    })
    .await;
    let client = http_client(&server.http, CryptoContext::disabled(), "guessed");

    let err = client.try_send_batch(&sample_batch(), "127.0.0.1").await.unwrap_err();
    assert!(matches!(err, TransportError::Exhausted { attempts: 1, .. }), "{err}");
    assert!(err.to_string().contains("400"), "{err}");
    assert!(server.gateway.get_all().unwrap().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn encrypted_http_batches_are_decrypted() {
    let dir = tempfile::tempdir().unwrap();
    let (private, public) = keys::write_key_pair(dir.path(), 1024).unwrap();
    let server = start(ServerConfig {
        key: "shared".into(),
        crypto_key: Some(private),
        ..server_config(dir.path())
    })
    .await;

    let crypto = CryptoContext::from_paths(Some(&public), None).unwrap();
    let client = http_client(&server.http, crypto, "shared");

    // Large enough to need several RSA chunks.
    let many: Vec<MetricSample> = (0..40).map(|i| MetricSample::gauge(format!("Gauge{i:02}"), i as f64)).collect();
    assert_ok!(client.try_send_batch(&Batch::new(many), "127.0.0.1").await);

    let stored = server.gateway.get_all().unwrap();
    assert_eq!(stored.len(), 40);
    assert_eq!(server.gateway.get_one("gauge", "Gauge39").unwrap().value, Some(39.0));
    server.stop().await;
}

#[tokio::test]
async fn plaintext_client_against_decrypting_server_still_works() {
    let dir = tempfile::tempdir().unwrap();
    let (private, _public) = keys::write_key_pair(dir.path(), 1024).unwrap();
    let server = start(ServerConfig {
        crypto_key: Some(private),
        ..server_config(dir.path())
    })
    .await;
    let client = http_client(&server.http, CryptoContext::disabled(), "");

    assert_ok!(client.try_send_batch(&sample_batch(), "127.0.0.1").await);
    assert_eq!(server.gateway.get_one("counter", "PollCount").unwrap().delta, Some(3));
    server.stop().await;
}

#[tokio::test]
async fn untrusted_origin_is_refused_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(ServerConfig {
        trusted_subnet: Some("10.0.0.0/8".into()),
        ..server_config(dir.path())
    })
    .await;
    let client = http_client(&server.http, CryptoContext::disabled(), "");

    let err = client.try_send_batch(&sample_batch(), "192.168.1.20").await.unwrap_err();
    assert!(err.to_string().contains("403"), "{err}");
    assert_ok!(client.try_send_batch(&sample_batch(), "10.4.3.2").await);
    assert_eq!(server.gateway.get_all().unwrap().len(), 2);
    server.stop().await;
}

#[tokio::test]
async fn encrypted_rpc_metrics_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let (private, public) = keys::write_key_pair(dir.path(), 1024).unwrap();
    let server = start(ServerConfig {
        crypto_key: Some(private),
        ..server_config(dir.path())
    })
    .await;

    let crypto = CryptoContext::from_paths(Some(&public), None).unwrap();
    let client = RpcTransport::new(server.rpc.clone(), MetricProcessor::new(crypto, Signer::disabled()));

    assert_ok!(client.health_check().await);
    assert_ok!(client.try_send_batch(&sample_batch(), "127.0.0.1").await);
    assert_ok!(client.try_send_batch(&sample_batch(), "127.0.0.1").await);

    assert_eq!(server.gateway.get_one("counter", "PollCount").unwrap().delta, Some(6));
    assert_eq!(server.gateway.get_one("gauge", "Alloc").unwrap().value, Some(1024.5));
    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn server_stop_persists_received_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let config = server_config(dir.path());
    let server = start(config.clone()).await;
    let client = http_client(&server.http, CryptoContext::disabled(), "");
    assert_ok!(client.try_send_batch(&sample_batch(), "127.0.0.1").await);
    server.stop().await;

    let restored = Server::new(ServerConfig {
        restore: true,
        ..config
    })
    .unwrap();
    assert_eq!(restored.gateway().get_one("counter", "PollCount").unwrap().delta, Some(3));
}

struct Ticking;

impl Collector for Ticking {
    fn name(&self) -> &'static str {
        "ticking"
    }

    fn collect(&mut self) -> Vec<MetricSample> {
        vec![MetricSample::counter("PollCount", 1), MetricSample::gauge("RandomValue", 0.25)]
    }
}

#[tokio::test]
async fn agent_delivers_to_server_and_flushes_on_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(ServerConfig {
        key: "shared".into(),
        ..server_config(dir.path())
    })
    .await;

    let config = AgentConfig {
        address: server.http.clone(),
        key: "shared".into(),
        poll_interval: Duration::from_millis(10),
        report_interval: Duration::from_millis(40),
        final_flush_timeout: Duration::from_secs(1),
        ..AgentConfig::default()
    };
    let transport: Arc<dyn TransportClient> =
        Arc::new(http_client(&server.http, CryptoContext::disabled(), "shared"));
    let agent = Agent::with_parts(config, Box::new(Ticking), transport, "127.0.0.1");

    let token = CancellationToken::new();
    let running = tokio::spawn(agent.run(token.clone()));
    tokio::time::sleep(Duration::from_millis(150)).await;
    token.cancel();
    let stats = running.await.unwrap();

    assert!(stats.processed >= 2, "{stats:?}");
    assert_eq!(stats.dropped, 0);
    // Each report carries the running total, so the server holds their sum.
    let received = server.gateway.get_one("counter", "PollCount").unwrap().delta.unwrap();
    assert!(received >= 2, "{received}");
    assert_eq!(server.gateway.get_one("gauge", "RandomValue").unwrap().value, Some(0.25));
    server.stop().await;
}
