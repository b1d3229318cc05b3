//! gRPC transport for `synapse.v1.MetricsService`.
//!
//! One HTTP/2 channel is opened on the first call and shared by every call
//! after it; concurrent workers multiplex over it. The agent's origin address
//! rides in the `x-real-ip` metadata. A channel that fails with `Unavailable`
//! or times out is dropped and reopened on the next call.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, warn};

use super::processor::MetricProcessor;
use super::TransportClient;
use crate::error::{TransportError, TransportResult};
use crate::model::Batch;
use crate::proto::{
    Metric, MetricsServiceClient, PingRequest, UpdateMetricsRequest, MAX_MESSAGE_LEN, ORIGIN_METADATA,
};

/// Deadline for a bulk `UpdateMetrics` call, connect included
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a `Ping`
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

type Client = MetricsServiceClient<Channel>;

#[derive(Debug)]
pub struct RpcTransport {
    address: String,
    processor: MetricProcessor,
    client: TokioMutex<Option<Client>>,
    call_timeout: Duration,
    health_timeout: Duration,
}

impl RpcTransport {
    /// No connection is opened until the first call
    pub fn new(address: impl Into<String>, processor: MetricProcessor) -> Self {
        Self {
            address: address.into(),
            processor,
            client: TokioMutex::new(None),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, call: Duration, health: Duration) -> Self {
        self.call_timeout = call;
        self.health_timeout = health;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn uri(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.clone()
        } else {
            format!("http://{}", self.address)
        }
    }

    fn connection_error(&self, message: impl ToString) -> TransportError {
        TransportError::Connection {
            endpoint: self.address.clone(),
            message: message.to_string(),
        }
    }

    /// Shared client, connecting first if needed
    async fn client(&self) -> TransportResult<Client> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let channel = Endpoint::from_shared(self.uri())
            .map_err(|e| self.connection_error(e))?
            .connect_timeout(self.call_timeout)
            .tcp_nodelay(true)
            .connect()
            .await
            .map_err(|e| self.connection_error(e))?;
        debug!(target: "synapse::transport::rpc", address = %self.address, "Connected");

        let client = MetricsServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_LEN)
            .max_encoding_message_size(MAX_MESSAGE_LEN);
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn reset(&self) {
        self.client.lock().await.take();
    }

    /// Run `call` on the shared client under `timeout`
    async fn invoke<T, F, Fut>(&self, timeout: Duration, call: F) -> TransportResult<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<tonic::Response<T>, Status>>,
    {
        let outcome = tokio::time::timeout(timeout, async {
            let client = self.client().await?;
            call(client).await.map_err(|status| self.status_error(status))
        })
        .await;

        match outcome {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(e)) => {
                if matches!(e, TransportError::Connection { .. }) {
                    self.reset().await;
                }
                Err(e)
            }
            Err(_) => {
                self.reset().await;
                Err(TransportError::Timeout {
                    endpoint: self.address.clone(),
                    timeout,
                })
            }
        }
    }

    fn status_error(&self, status: Status) -> TransportError {
        match status.code() {
            Code::Unavailable => self.connection_error(status.message()),
            Code::DeadlineExceeded => TransportError::Timeout {
                endpoint: self.address.clone(),
                timeout: self.call_timeout,
            },
            Code::PermissionDenied | Code::Unauthenticated | Code::InvalidArgument | Code::FailedPrecondition => {
                TransportError::Rejected {
                    message: status.message().to_string(),
                }
            }
            code => TransportError::Request {
                endpoint: self.address.clone(),
                message: format!("{code:?}: {}", status.message()),
            },
        }
    }
}

#[async_trait]
impl TransportClient for RpcTransport {
    fn name(&self) -> &'static str {
        "rpc"
    }

    /// A non-empty error in the reply is returned as `Rejected` and not retried
    async fn try_send_batch(&self, batch: &Batch, origin: &str) -> TransportResult<()> {
        let metrics: Vec<Metric> = self.processor.to_wire_batch(batch).into_iter().map(Metric::from).collect();
        if metrics.is_empty() {
            warn!(target: "synapse::transport::rpc", "No sendable metrics in batch");
            return Ok(());
        }

        let count = metrics.len();
        let mut request = tonic::Request::new(UpdateMetricsRequest { metrics });
        match origin.parse::<AsciiMetadataValue>() {
            Ok(value) => {
                request.metadata_mut().insert(ORIGIN_METADATA, value);
            }
            Err(_) => warn!(target: "synapse::transport::rpc", origin, "Origin is not valid metadata, omitted"),
        }

        let response = self
            .invoke(self.call_timeout, move |mut client| async move { client.update_metrics(request).await })
            .await?;
        if !response.error.is_empty() {
            return Err(TransportError::Rejected { message: response.error });
        }

        debug!(target: "synapse::transport::rpc", metrics = count, "Metrics accepted");
        Ok(())
    }

    async fn health_check(&self) -> TransportResult<()> {
        self.invoke(self.health_timeout, |mut client| async move { client.ping(PingRequest {}).await })
            .await
            .map(|_| ())
    }

    async fn close(&self) {
        // Dropping the last clone of the channel shuts the connection down.
        self.reset().await;
        debug!(target: "synapse::transport::rpc", address = %self.address, "RPC transport closed");
    }
}
