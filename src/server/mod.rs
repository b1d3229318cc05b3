// ============================================================================
// SERVER
// ============================================================================
// Owns the store and the gateway and runs, until cancelled:
//
//   - the HTTP listener (always)
//   - the RPC listener (when an RPC address is configured)
//   - the periodic snapshot task (snapshottable backends, non-zero interval)
//
// On shutdown the listeners stop accepting, in-flight requests complete and
// the store is closed, which writes the final snapshot for the memory backend.
// ============================================================================

pub mod http;
pub mod rpc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::access::AccessGuard;
use crate::config::ServerConfig;
use crate::crypto::CryptoContext;
use crate::error::{SynapseError, SynapseResult};
use crate::gateway::IngestionGateway;
use crate::signer::Signer;
use crate::store::{open_store, SharedStore};

#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    store: SharedStore,
    gateway: Arc<IngestionGateway>,
}

impl Server {
    /// Open the store, restore it if asked to and assemble the gateway
    pub fn new(config: ServerConfig) -> SynapseResult<Self> {
        let store = open_store(&config.store_kind())?;
        if config.restore {
            restore(&store, &config.file_storage_path);
        }

        let crypto = CryptoContext::from_paths(None, config.crypto_key_path())?;
        let guard = AccessGuard::new(config.trusted_subnet.as_deref())?;
        let signer = Signer::new(&config.key);

        info!(
            target: "synapse::server",
            backend = store.backend(),
            decrypts = crypto.can_decrypt(),
            verifies = signer.is_enabled(),
            trusted_subnet = ?guard.subnet(),
            "Server assembled"
        );

        let gateway = Arc::new(IngestionGateway::new(store.clone(), crypto, signer, guard));
        Ok(Self { config, store, gateway })
    }

    pub fn gateway(&self) -> Arc<IngestionGateway> {
        self.gateway.clone()
    }

    /// Bind the configured addresses and serve until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> SynapseResult<()> {
        let http_listener = TcpListener::bind(self.config.bind_address()).await?;
        let rpc_listener = match self.config.rpc_bind_address() {
            Some(address) => Some(TcpListener::bind(address).await?),
            None => None,
        };
        self.serve(http_listener, rpc_listener, token).await
    }

    /// Serve on already-bound listeners
    pub async fn serve(
        self,
        http_listener: TcpListener,
        rpc_listener: Option<TcpListener>,
        token: CancellationToken,
    ) -> SynapseResult<()> {
        info!(target: "synapse::server", address = ?http_listener.local_addr().ok(), "HTTP server listening");

        let rpc_task = rpc_listener.map(|listener| tokio::spawn(rpc::serve(listener, self.gateway.clone(), token.clone())));
        let snapshot_task = self.spawn_snapshot_task(token.clone());

        let shutdown = token.clone();
        let served = axum::serve(http_listener, http::router(self.gateway.clone()))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        // Whatever stopped the HTTP server stops everything else.
        token.cancel();
        if let Err(e) = &served {
            error!(target: "synapse::server", error = %e, "HTTP server failed");
        }

        for task in [rpc_task, snapshot_task].into_iter().flatten() {
            if let Err(e) = task.await {
                warn!(target: "synapse::server", error = %e, "Background task terminated abnormally");
            }
        }

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.close())
            .await
            .map_err(|e| SynapseError::Internal(e.to_string()))??;
        info!(target: "synapse::server", "Server stopped, store closed");

        served.map_err(SynapseError::from)
    }

    fn spawn_snapshot_task(&self, token: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = self.config.store_interval;
        if interval.is_zero() || self.store.as_snapshottable().is_none() {
            return None;
        }
        let store = self.store.clone();
        let path = self.config.file_storage_path.clone();
        Some(tokio::spawn(snapshot_loop(store, path, interval, token)))
    }
}

fn restore(store: &SharedStore, path: &std::path::Path) {
    let Some(snapshottable) = store.as_snapshottable() else {
        info!(target: "synapse::server", backend = store.backend(), "Backend has no snapshots, restore skipped");
        return;
    };
    if !path.exists() {
        warn!(target: "synapse::server", path = %path.display(), "No snapshot to restore");
        return;
    }
    if let Err(e) = snapshottable.load_snapshot(path) {
        error!(target: "synapse::server", path = %path.display(), error = %e, "Snapshot restore failed");
    }
}

async fn snapshot_loop(store: SharedStore, path: PathBuf, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let store = store.clone();
                let path = path.clone();
                let saved = tokio::task::spawn_blocking(move || match store.as_snapshottable() {
                    Some(s) => s.save_snapshot(&path),
                    None => Ok(()),
                })
                .await;
                match saved {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(target: "synapse::server", error = %e, "Periodic snapshot failed"),
                    Err(e) => warn!(target: "synapse::server", error = %e, "Snapshot task panicked"),
                }
            }
        }
    }
}
