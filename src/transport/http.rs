//! Request/response transport over HTTP.
//!
//! Each batch becomes one gzip-compressed `POST /updates/`. Failed attempts,
//! whether a network error or a non-success status, are retried following the
//! [`RetrySchedule`]; once it is exhausted the batch is dropped.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tracing::{debug, warn};

use super::processor::MetricProcessor;
use super::{RetrySchedule, TransportClient};
use crate::error::{TransportError, TransportResult};
use crate::model::Batch;
use crate::{
    CONTENT_TYPE_BINARY, CONTENT_TYPE_JSON, ENCRYPTION_ALGORITHM, ENCRYPTION_MODE,
    HEADER_ENCRYPTED, HEADER_ENCRYPTION_ALGORITHM, HEADER_ENCRYPTION_MODE, HEADER_REAL_IP,
    HEADER_SIGNATURE,
};

/// Per-attempt timeout for batch uploads
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for each health request
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Tunables for [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub request_timeout: Duration,
    pub health_timeout: Duration,
    pub retry: RetrySchedule,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            retry: RetrySchedule::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    client: HttpClient,
    base_url: String,
    processor: MetricProcessor,
    settings: HttpSettings,
}

/// `host:port` becomes `http://host:port`; explicit schemes are kept
pub fn base_url(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

impl HttpTransport {
    pub fn new(address: &str, processor: MetricProcessor, settings: HttpSettings) -> TransportResult<Self> {
        let base_url = base_url(address);
        let client = HttpClient::builder()
            .timeout(settings.request_timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| TransportError::Connection {
                endpoint: base_url.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url,
            processor,
            settings,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn updates_url(&self) -> String {
        format!("{}/updates/", self.base_url)
    }

    fn classify(&self, endpoint: &str, e: reqwest::Error, timeout: Duration) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                endpoint: endpoint.to_string(),
                timeout,
            }
        } else if e.is_connect() {
            TransportError::Connection {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            }
        } else {
            TransportError::Request {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl TransportClient for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn try_send_batch(&self, batch: &Batch, origin: &str) -> TransportResult<()> {
        let body = self.processor.encode_body(batch)?;
        let url = self.updates_url();
        let attempts = self.settings.retry.attempts();
        let mut last_error = None;

        for attempt in 0..attempts {
            let content_type = if body.encrypted { CONTENT_TYPE_BINARY } else { CONTENT_TYPE_JSON };
            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", content_type)
                .header("Content-Encoding", "gzip")
                .header(HEADER_REAL_IP, origin)
                .body(body.payload.clone());
            if let Some(signature) = &body.signature {
                request = request.header(HEADER_SIGNATURE, signature.as_str());
            }
            if body.encrypted {
                request = request
                    .header(HEADER_ENCRYPTED, "true")
                    .header(HEADER_ENCRYPTION_ALGORITHM, ENCRYPTION_ALGORITHM)
                    .header(HEADER_ENCRYPTION_MODE, ENCRYPTION_MODE);
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        target: "synapse::transport::http",
                        attempt = attempt + 1,
                        status = response.status().as_u16(),
                        compressed_len = body.payload.len(),
                        "Batch accepted"
                    );
                    return Ok(());
                }
                Ok(response) => TransportError::Status {
                    endpoint: url.clone(),
                    status: response.status().as_u16(),
                },
                Err(e) => self.classify(&url, e, self.settings.request_timeout),
            };

            let delay = self.settings.retry.delay_after(attempt);
            warn!(
                target: "synapse::transport::http",
                attempt = attempt + 1,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                encrypted = body.encrypted,
                error = %error,
                "Attempt failed"
            );
            last_error = Some(error);
            tokio::time::sleep(delay).await;
        }

        Err(TransportError::Exhausted {
            attempts,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Healthy when `HEAD /` or `HEAD /ping` answers below 500
    async fn health_check(&self) -> TransportResult<()> {
        let mut last_error = None;
        for path in ["/", "/ping"] {
            let url = format!("{}{}", self.base_url, path);
            match self
                .client
                .head(&url)
                .timeout(self.settings.health_timeout)
                .send()
                .await
            {
                Ok(response) if response.status().as_u16() < 500 => return Ok(()),
                Ok(response) => {
                    last_error = Some(TransportError::Status {
                        endpoint: url,
                        status: response.status().as_u16(),
                    })
                }
                Err(e) => last_error = Some(self.classify(&url, e, self.settings.health_timeout)),
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::Request {
            endpoint: self.base_url.clone(),
            message: "no health endpoint answered".into(),
        }))
    }

    async fn close(&self) {
        debug!(target: "synapse::transport::http", base_url = %self.base_url, "HTTP transport closed");
    }
}
