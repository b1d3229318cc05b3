//! gRPC listener for `synapse.v1.MetricsService`.
//!
//! Gateway calls are blocking and run on `spawn_blocking`. The access guard
//! sees the `x-real-ip` request metadata.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use crate::gateway::IngestionGateway;
use crate::model::WireMetric;
use crate::proto::{
    MetricsService, MetricsServiceServer, PingRequest, PingResponse, UpdateMetricsRequest, UpdateMetricsResponse,
    MAX_MESSAGE_LEN, ORIGIN_METADATA,
};

#[derive(Debug, Clone)]
pub struct MetricsEndpoint {
    gateway: Arc<IngestionGateway>,
}

impl MetricsEndpoint {
    pub fn new(gateway: Arc<IngestionGateway>) -> Self {
        Self { gateway }
    }

    pub fn into_service(self) -> MetricsServiceServer<Self> {
        MetricsServiceServer::new(self)
            .max_decoding_message_size(MAX_MESSAGE_LEN)
            .max_encoding_message_size(MAX_MESSAGE_LEN)
    }
}

#[tonic::async_trait]
impl MetricsService for MetricsEndpoint {
    async fn update_metrics(
        &self,
        request: Request<UpdateMetricsRequest>,
    ) -> Result<Response<UpdateMetricsResponse>, Status> {
        let origin = request
            .metadata()
            .get(ORIGIN_METADATA)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let metrics: Vec<WireMetric> = request.into_inner().metrics.into_iter().map(WireMetric::from).collect();
        debug!(target: "synapse::server::rpc", metrics = metrics.len(), origin = ?origin, "UpdateMetrics");

        let gateway = self.gateway.clone();
        let error = tokio::task::spawn_blocking(move || gateway.ingest_rpc(metrics, origin.as_deref()))
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(UpdateMetricsResponse { error }))
    }

    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        let gateway = self.gateway.clone();
        tokio::task::spawn_blocking(move || gateway.ping())
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .map_err(|e| Status::unavailable(e.to_string()))?;
        Ok(Response::new(PingResponse {}))
    }
}

/// Serve on `listener` until `token` is cancelled
pub async fn serve(listener: TcpListener, gateway: Arc<IngestionGateway>, token: CancellationToken) {
    let local = listener.local_addr().ok();
    info!(target: "synapse::server::rpc", address = ?local, "gRPC server listening");

    let served = Server::builder()
        .add_service(MetricsEndpoint::new(gateway).into_service())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move { token.cancelled().await })
        .await;

    match served {
        Ok(()) => info!(target: "synapse::server::rpc", "gRPC server stopped"),
        Err(e) => error!(target: "synapse::server::rpc", error = %e, "gRPC server failed"),
    }
}
