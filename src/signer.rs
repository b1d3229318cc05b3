// ============================================================================
// SIGNER
// ============================================================================
// HMAC-SHA256 integrity tags over plaintext bytes. An empty key disables the
// signer: it emits nothing and accepts everything.
// ============================================================================

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::SignatureError;
use crate::model::{MetricKind, MetricSample};

type HmacSha256 = Hmac<Sha256>;

/// Length of an HMAC-SHA256 tag in bytes
pub const TAG_LEN: usize = 32;

#[derive(Clone)]
pub struct Signer {
    mac: Option<HmacSha256>,
}

impl Signer {
    pub fn new(key: &str) -> Self {
        let mac = if key.is_empty() {
            None
        } else {
            HmacSha256::new_from_slice(key.as_bytes()).ok()
        };
        Self { mac }
    }

    pub fn disabled() -> Self {
        Self { mac: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.mac.is_some()
    }

    /// Raw tag, `None` when signing is disabled
    pub fn sign(&self, data: &[u8]) -> Option<[u8; TAG_LEN]> {
        let mut mac = self.mac.clone()?;
        mac.update(data);
        Some(mac.finalize().into_bytes().into())
    }

    /// Tag in the form carried by the `HashSHA256` header
    pub fn sign_base64(&self, data: &[u8]) -> Option<String> {
        self.sign(data).map(|tag| BASE64.encode(tag))
    }

    /// Compare `tag` against the tag of `data` in constant time
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> Result<(), SignatureError> {
        let Some(expected) = self.sign(data) else {
            return Ok(());
        };
        if bool::from(expected.as_slice().ct_eq(tag)) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Check a base64 header value. With a key configured the header is mandatory.
    pub fn verify_base64(&self, data: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return Err(SignatureError::Missing);
        };
        let tag = BASE64.decode(header).map_err(|e| SignatureError::Malformed {
            message: e.to_string(),
        })?;
        self.verify(data, &tag)
    }

    /// Hex tag over the per-metric canonical form used by the RPC transport
    pub fn sign_metric(&self, sample: &MetricSample) -> Option<String> {
        self.sign(canonical_metric(sample).as_bytes()).map(hex::encode)
    }

    pub fn verify_metric(&self, sample: &MetricSample, hex_tag: &str) -> Result<(), SignatureError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let tag = hex::decode(hex_tag).map_err(|e| SignatureError::Malformed {
            message: e.to_string(),
        })?;
        self.verify(canonical_metric(sample).as_bytes(), &tag)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("enabled", &self.is_enabled()).finish()
    }
}

/// `id:counter:delta` or `id:gauge:value` with six decimals
pub fn canonical_metric(sample: &MetricSample) -> String {
    match sample.kind {
        MetricKind::Counter => format!("{}:counter:{}", sample.id, sample.delta.unwrap_or_default()),
        MetricKind::Gauge => format!("{}:gauge:{:.6}", sample.id, sample.value.unwrap_or_default()),
    }
}
