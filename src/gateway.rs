// ============================================================================
// INGESTION GATEWAY
// ============================================================================
// Every inbound write passes the same stages, in this order:
//
//   access check -> gunzip -> decrypt -> verify signature -> decode -> validate -> apply
//
// The access check runs before the body is touched. The signature is always
// computed over the final plaintext. Nothing is applied unless every sample
// of the request validates.
//
// The gateway is transport-agnostic and blocking; the HTTP and RPC servers
// call it from `spawn_blocking`.
// ============================================================================

use std::io::Read;

use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::access::AccessGuard;
use crate::crypto::CryptoContext;
use crate::error::{CryptoError, GatewayError, StorageResult, ValidationError};
use crate::model::{Batch, MetricKind, MetricSample, WireMetric};
use crate::signer::Signer;
use crate::store::SharedStore;

/// Transport-neutral view of one inbound request
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub body: Vec<u8>,
    /// `Content-Encoding: gzip`
    pub gzip: bool,
    /// `X-Encrypted: true`
    pub encrypted: bool,
    /// `HashSHA256` header, base64
    pub signature: Option<String>,
    /// `X-Real-IP` header
    pub real_ip: Option<String>,
}

impl IngestRequest {
    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_real_ip(mut self, ip: impl Into<String>) -> Self {
        self.real_ip = Some(ip.into());
        self
    }

    pub fn with_signature(mut self, signature: Option<String>) -> Self {
        self.signature = signature;
        self
    }
}

#[derive(Debug)]
pub struct IngestionGateway {
    store: SharedStore,
    crypto: CryptoContext,
    signer: Signer,
    guard: AccessGuard,
}

impl IngestionGateway {
    pub fn new(store: SharedStore, crypto: CryptoContext, signer: Signer, guard: AccessGuard) -> Self {
        Self {
            store,
            crypto,
            signer,
            guard,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ------------------------------------------------------------------------
    // Body pipeline
    // ------------------------------------------------------------------------

    /// Gunzip, decrypt and verify. Returns the verified plaintext.
    fn open_body(&self, request: IngestRequest) -> Result<Vec<u8>, GatewayError> {
        let mut body = request.body;

        if request.gzip {
            body = gunzip(&body)?;
        }

        if request.encrypted {
            if !self.crypto.can_decrypt() {
                return Err(CryptoError::NoPrivateKey.into());
            }
            body = self.crypto.decrypt(&body)?;
        }

        self.signer.verify_base64(&body, request.signature.as_deref())?;
        Ok(body)
    }

    /// Guarded variant of [`open_body`](Self::open_body) for writes
    fn open_guarded(&self, request: IngestRequest) -> Result<Vec<u8>, GatewayError> {
        self.guard.check(request.real_ip.as_deref())?;
        self.open_body(request)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub fn ingest_batch(&self, request: IngestRequest) -> Result<Batch, GatewayError> {
        let body = self.open_guarded(request)?;
        let batch = Batch::from_json(&body).map_err(GatewayError::malformed)??;
        batch.validate()?;
        self.store.apply_batch(&batch.metrics)?;

        debug!(target: "synapse::gateway", metrics = batch.len(), "Batch applied");
        Ok(batch)
    }

    /// Single JSON sample. Returns the sample as stored after the merge.
    pub fn update_one(&self, request: IngestRequest) -> Result<MetricSample, GatewayError> {
        let body = self.open_guarded(request)?;
        let wire: WireMetric = serde_json::from_slice(&body).map_err(GatewayError::malformed)?;
        let sample = MetricSample::try_from(wire)?;
        self.store.apply(&sample)?;
        Ok(self.store.get_one(sample.kind.as_str(), &sample.id)?)
    }

    /// Plain-text form: counters parse as i64, gauges as f64
    pub fn update_from_path(
        &self,
        kind: &str,
        id: &str,
        raw_value: &str,
        real_ip: Option<&str>,
    ) -> Result<MetricSample, GatewayError> {
        self.guard.check(real_ip)?;
        if id.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        let sample = MetricSample::parse(kind, id, raw_value)?;
        self.store.apply(&sample)?;
        Ok(sample)
    }

    /// Per-metric persistent-connection path. Returns the empty string on
    /// full success, otherwise a summary of what failed. Accepted metrics are
    /// still applied when others fail.
    pub fn ingest_rpc(&self, metrics: Vec<WireMetric>, real_ip: Option<&str>) -> String {
        if let Err(e) = self.guard.check(real_ip) {
            warn!(target: "synapse::gateway", error = %e, "RPC update rejected");
            return e.to_string();
        }

        let mut accepted = Vec::with_capacity(metrics.len());
        let mut failures = Vec::new();
        for wire in metrics {
            let id = wire.id.clone();
            match self.accept_wire(wire) {
                Ok(sample) => accepted.push(sample),
                Err(e) => failures.push(format!("{id}: {e}")),
            }
        }

        if !accepted.is_empty() {
            if let Err(e) = self.store.apply_batch(&accepted) {
                failures.push(format!("apply: {e}"));
            }
        }

        if failures.is_empty() {
            debug!(target: "synapse::gateway", metrics = accepted.len(), "RPC metrics applied");
            String::new()
        } else {
            warn!(target: "synapse::gateway", failed = failures.len(), "RPC update partially failed");
            format!("failed to process {} metrics: [{}]", failures.len(), failures.join("; "))
        }
    }

    /// With a private key a non-empty `hash` is the encrypted scalar,
    /// otherwise it is the HMAC tag.
    fn accept_wire(&self, mut wire: WireMetric) -> Result<MetricSample, GatewayError> {
        let hash = wire.hash.take().filter(|h| !h.is_empty());

        match hash {
            Some(hash) if self.crypto.can_decrypt() => {
                let kind: MetricKind = wire.kind.parse()?;
                let cipher = hex::decode(&hash).map_err(GatewayError::malformed)?;
                let plain = self.crypto.decrypt(&cipher)?;
                let text = std::str::from_utf8(&plain).map_err(GatewayError::malformed)?;
                let invalid = || ValidationError::InvalidValue {
                    id: wire.id.clone(),
                    kind: kind.to_string(),
                    raw: text.to_string(),
                };
                match kind {
                    MetricKind::Counter => wire.delta = Some(text.trim().parse().map_err(|_| invalid())?),
                    MetricKind::Gauge => wire.value = Some(text.trim().parse().map_err(|_| invalid())?),
                }
                Ok(MetricSample::try_from(wire)?)
            }
            Some(hash) => {
                let sample = MetricSample::try_from(wire)?;
                self.signer.verify_metric(&sample, &hash)?;
                Ok(sample)
            }
            None => Ok(MetricSample::try_from(wire)?),
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn get_one(&self, kind: &str, id: &str) -> Result<MetricSample, GatewayError> {
        Ok(self.store.get_one(kind, id)?)
    }

    /// `{"id":..,"type":..}` lookup. Not guarded.
    pub fn get_value_json(&self, request: IngestRequest) -> Result<MetricSample, GatewayError> {
        let body = self.open_body(request)?;
        let wire: WireMetric = serde_json::from_slice(&body).map_err(GatewayError::malformed)?;
        if wire.id.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        self.get_one(&wire.kind, &wire.id)
    }

    pub fn get_all(&self) -> StorageResult<Vec<MetricSample>> {
        self.store.get_all()
    }

    pub fn ping(&self) -> StorageResult<()> {
        self.store.ping()
    }

    /// `HashSHA256` value for a response body, when a key is configured
    pub fn response_signature(&self, body: &[u8]) -> Option<String> {
        self.signer.sign_base64(body)
    }
}

/// Upper bound on an inflated request body
pub const MAX_DECOMPRESSED: u64 = 16 * 1024 * 1024;

fn gunzip(data: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(MAX_DECOMPRESSED as usize));
    GzDecoder::new(data)
        .take(MAX_DECOMPRESSED + 1)
        .read_to_end(&mut out)
        .map_err(|e| GatewayError::Decompress { message: e.to_string() })?;
    if out.len() as u64 > MAX_DECOMPRESSED {
        return Err(GatewayError::Decompress {
            message: format!("decompressed body exceeds {MAX_DECOMPRESSED} bytes"),
        });
    }
    Ok(out)
}
