// ============================================================================
// METRIC PROCESSOR
// ============================================================================
// Shared by both transports. Turns samples into what goes on the wire:
//
//   HTTP: one JSON body, signed as plaintext, then optionally encrypted whole,
//         then gzip-compressed.
//   RPC:  one `WireMetric` per sample whose `hash` slot carries either the
//         hex ciphertext of the scalar or the hex HMAC tag, never both.
// ============================================================================

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use crate::crypto::CryptoContext;
use crate::error::{CryptoError, TransportError, TransportResult};
use crate::model::{Batch, MetricKind, MetricSample, WireMetric};
use crate::signer::{canonical_metric, Signer};

/// What occupies the per-metric `hash` slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    Signature(Vec<u8>),
    Cipher(Vec<u8>),
    None,
}

impl Integrity {
    /// Both variants travel hex-encoded in the same field
    pub fn to_wire(&self) -> Option<String> {
        match self {
            Integrity::Signature(bytes) | Integrity::Cipher(bytes) => Some(hex::encode(bytes)),
            Integrity::None => None,
        }
    }
}

/// Request body ready to POST
#[derive(Debug, Clone)]
pub struct EncodedBody {
    /// Gzip-compressed payload
    pub payload: Vec<u8>,
    /// Base64 HMAC over the plaintext JSON
    pub signature: Option<String>,
    pub encrypted: bool,
    pub plaintext_len: usize,
}

#[derive(Debug, Clone)]
pub struct MetricProcessor {
    crypto: CryptoContext,
    signer: Signer,
}

impl MetricProcessor {
    pub fn new(crypto: CryptoContext, signer: Signer) -> Self {
        Self { crypto, signer }
    }

    pub fn encrypts(&self) -> bool {
        self.crypto.can_encrypt()
    }

    pub fn signs(&self) -> bool {
        self.signer.is_enabled()
    }

    // ------------------------------------------------------------------------
    // Request/response body
    // ------------------------------------------------------------------------

    pub fn encode_body(&self, batch: &Batch) -> TransportResult<EncodedBody> {
        let json = serde_json::to_vec(batch).map_err(TransportError::encode)?;
        let signature = self.signer.sign_base64(&json);

        let encrypted = self.crypto.can_encrypt();
        let body = if encrypted { self.crypto.encrypt(&json)? } else { json.clone() };
        let payload = gzip(&body)?;

        debug!(
            target: "synapse::transport",
            json_len = json.len(),
            body_len = body.len(),
            compressed_len = payload.len(),
            encrypted,
            "Request body prepared"
        );

        Ok(EncodedBody {
            payload,
            signature,
            encrypted,
            plaintext_len: json.len(),
        })
    }

    // ------------------------------------------------------------------------
    // Per-metric RPC form
    // ------------------------------------------------------------------------

    /// Encryption takes the slot when a public key is configured, otherwise
    /// the signature does if a key is configured.
    pub fn integrity_for(&self, sample: &MetricSample) -> Result<Integrity, CryptoError> {
        if self.crypto.can_encrypt() {
            let cipher = self.crypto.encrypt(scalar_plaintext(sample).as_bytes())?;
            return Ok(Integrity::Cipher(cipher));
        }
        Ok(match self.signer.sign(canonical_metric(sample).as_bytes()) {
            Some(tag) => Integrity::Signature(tag.to_vec()),
            None => Integrity::None,
        })
    }

    pub fn to_wire(&self, sample: &MetricSample) -> Result<WireMetric, CryptoError> {
        let integrity = self.integrity_for(sample)?;
        let mut wire = WireMetric::from(sample);

        // An encrypted scalar must not also travel in the clear.
        if let Integrity::Cipher(_) = integrity {
            match sample.kind {
                MetricKind::Counter => wire.delta = Some(0),
                MetricKind::Gauge => wire.value = Some(0.0),
            }
        }
        wire.hash = integrity.to_wire();
        Ok(wire)
    }

    /// Samples that fail to convert are logged and skipped
    pub fn to_wire_batch(&self, batch: &Batch) -> Vec<WireMetric> {
        batch
            .iter()
            .filter_map(|sample| match self.to_wire(sample) {
                Ok(wire) => Some(wire),
                Err(e) => {
                    warn!(target: "synapse::transport", id = %sample.id, error = %e, "Skipping metric");
                    None
                }
            })
            .collect()
    }
}

/// Plaintext encrypted into the `hash` slot: the scalar in decimal
pub fn scalar_plaintext(sample: &MetricSample) -> String {
    match sample.kind {
        MetricKind::Counter => sample.delta.unwrap_or_default().to_string(),
        MetricKind::Gauge => sample.value.unwrap_or_default().to_string(),
    }
}

pub fn gzip(data: &[u8]) -> TransportResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder.write_all(data).map_err(TransportError::encode)?;
    encoder.finish().map_err(TransportError::encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys::{TEST_PRIVATE_KEY, TEST_PUBLIC_KEY};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    fn batch() -> Batch {
        Batch::new(vec![MetricSample::gauge("Alloc", 1.25), MetricSample::counter("PollCount", 9)])
    }

    #[test]
    fn test_plain_body_is_signed_json() {
        let processor = MetricProcessor::new(CryptoContext::disabled(), Signer::new("key"));
        let body = processor.encode_body(&batch()).unwrap();
        assert!(!body.encrypted);

        let json = gunzip(&body.payload);
        assert_eq!(json, serde_json::to_vec(&batch()).unwrap());
        assert_eq!(body.signature, Signer::new("key").sign_base64(&json));
    }

    #[test]
    fn test_encrypted_body_signature_covers_plaintext() {
        let processor = MetricProcessor::new(
            CryptoContext::disabled().with_public_key(TEST_PUBLIC_KEY.clone()),
            Signer::new("key"),
        );
        let body = processor.encode_body(&batch()).unwrap();
        assert!(body.encrypted);

        let receiver = CryptoContext::disabled().with_private_key(TEST_PRIVATE_KEY.clone());
        let json = receiver.decrypt(&gunzip(&body.payload)).unwrap();
        assert_eq!(json.len(), body.plaintext_len);
        assert_eq!(Signer::new("key").verify_base64(&json, body.signature.as_deref()), Ok(()));
    }

    #[test]
    fn test_wire_metric_carries_signature() {
        let processor = MetricProcessor::new(CryptoContext::disabled(), Signer::new("key"));
        let sample = MetricSample::counter("PollCount", 9);
        let wire = processor.to_wire(&sample).unwrap();
        assert_eq!(wire.delta, Some(9));
        assert_eq!(wire.hash, Signer::new("key").sign_metric(&sample));
    }

    #[test]
    fn test_wire_metric_cipher_replaces_signature_and_hides_value() {
        let processor = MetricProcessor::new(
            CryptoContext::disabled().with_public_key(TEST_PUBLIC_KEY.clone()),
            Signer::new("key"),
        );
        let wire = processor.to_wire(&MetricSample::gauge("Alloc", 1.25)).unwrap();
        assert_eq!(wire.value, Some(0.0));

        let cipher = hex::decode(wire.hash.unwrap()).unwrap();
        let plain = decrypt_with_test_key(&cipher);
        assert_eq!(plain, b"1.25");
    }

    #[test]
    fn test_no_key_no_hash() {
        let processor = MetricProcessor::new(CryptoContext::disabled(), Signer::disabled());
        let wires = processor.to_wire_batch(&batch());
        assert_eq!(wires.len(), 2);
        assert!(wires.iter().all(|w| w.hash.is_none()));
        assert_eq!(Integrity::None.to_wire(), None);
    }

    fn decrypt_with_test_key(cipher: &[u8]) -> Vec<u8> {
        CryptoContext::disabled()
            .with_private_key(TEST_PRIVATE_KEY.clone())
            .decrypt(cipher)
            .unwrap()
    }
}
