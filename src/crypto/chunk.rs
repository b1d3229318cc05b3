// ============================================================================
// CHUNK CIPHER
// ============================================================================
// RSA-OAEP (SHA-256) over payloads of any length.
//
// Payloads that fit one OAEP block are sent as a bare ciphertext of exactly the
// key size. Larger payloads are split into `max_plain_len` slices, each
// encrypted on its own, and framed as:
//
//   version: u8 | chunk_count: u32 | chunk_sizes: [u32; chunk_count] | data
//
// All integers big-endian.
// ============================================================================

use bytes::{Buf, BufMut, BytesMut};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::{debug, trace};

use crate::error::{CryptoError, CryptoResult};

/// Envelope format version
pub const CHUNK_PROTOCOL_VERSION: u8 = 1;

/// `version(1) + chunk_count(4)`
pub const CHUNK_HEADER_SIZE: usize = 5;

/// Width of one entry in the chunk size table
pub const CHUNK_SIZE_FIELD: usize = 4;

/// SHA-256 output size, counted twice by OAEP padding
const OAEP_HASH_SIZE: usize = 32;

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Largest plaintext a single OAEP operation accepts for a key of `key_size` bytes
pub fn max_plain_len(key_size: usize) -> usize {
    key_size.saturating_sub(2 * OAEP_HASH_SIZE + 2)
}

// ----------------------------------------------------------------------------
// Envelope framing
// ----------------------------------------------------------------------------

/// Parsed chunk envelope. Holds ciphertext slices borrowed from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEnvelope<'a> {
    chunks: Vec<&'a [u8]>,
}

impl<'a> ChunkEnvelope<'a> {
    pub fn new(chunks: Vec<&'a [u8]>) -> Self {
        Self { chunks }
    }

    pub fn chunks(&self) -> &[&'a [u8]] {
        &self.chunks
    }

    /// Cheap prefix test: a leading version byte and room for at least one size entry
    pub fn looks_like(data: &[u8]) -> bool {
        data.len() >= CHUNK_HEADER_SIZE + CHUNK_SIZE_FIELD && data[0] == CHUNK_PROTOCOL_VERSION
    }

    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_SIZE
            + self.chunks.len() * CHUNK_SIZE_FIELD
            + self.chunks.iter().map(|c| c.len()).sum::<usize>()
    }

    pub fn encode(&self) -> CryptoResult<Vec<u8>> {
        let count = u32::try_from(self.chunks.len())
            .map_err(|_| CryptoError::format("too many chunks for envelope"))?;

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(CHUNK_PROTOCOL_VERSION);
        buf.put_u32(count);
        for chunk in &self.chunks {
            let size = u32::try_from(chunk.len())
                .map_err(|_| CryptoError::format("chunk larger than u32::MAX"))?;
            buf.put_u32(size);
        }
        for chunk in &self.chunks {
            buf.put_slice(chunk);
        }
        Ok(buf.to_vec())
    }

    /// Parse a full envelope. Trailing bytes after the last chunk are rejected.
    pub fn parse(data: &'a [u8]) -> CryptoResult<Self> {
        if data.len() < CHUNK_HEADER_SIZE {
            return Err(CryptoError::format("envelope shorter than its header"));
        }

        let mut header = data;
        let version = header.get_u8();
        if version != CHUNK_PROTOCOL_VERSION {
            return Err(CryptoError::format(format!(
                "unsupported envelope version {version}"
            )));
        }

        let count = header.get_u32() as usize;
        if count == 0 {
            return Err(CryptoError::format("envelope declares zero chunks"));
        }
        let table_len = count
            .checked_mul(CHUNK_SIZE_FIELD)
            .filter(|len| *len <= header.remaining())
            .ok_or_else(|| CryptoError::format(format!("size table for {count} chunks is truncated")))?;

        let mut sizes = Vec::with_capacity(count);
        for _ in 0..count {
            sizes.push(header.get_u32() as usize);
        }

        let mut rest = &data[CHUNK_HEADER_SIZE + table_len..];
        let mut chunks = Vec::with_capacity(count);
        for (index, size) in sizes.into_iter().enumerate() {
            if rest.len() < size {
                return Err(CryptoError::format(format!(
                    "chunk {index} truncated: need {size} bytes, {} left",
                    rest.len()
                )));
            }
            let (chunk, tail) = rest.split_at(size);
            chunks.push(chunk);
            rest = tail;
        }

        if !rest.is_empty() {
            return Err(CryptoError::format(format!(
                "{} trailing bytes after last chunk",
                rest.len()
            )));
        }

        Ok(Self { chunks })
    }
}

// ----------------------------------------------------------------------------
// Encryption
// ----------------------------------------------------------------------------

fn encrypt_block(key: &RsaPublicKey, index: usize, block: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut rng = rand::thread_rng();
    key.encrypt(&mut rng, oaep(), block)
        .map_err(|e| CryptoError::Encryption {
            index,
            message: e.to_string(),
        })
}

/// Encrypt a payload of any length. `None` disables encryption and returns
/// the plaintext unchanged.
pub fn encrypt_large(key: Option<&RsaPublicKey>, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let Some(key) = key else {
        return Ok(plaintext.to_vec());
    };

    let max_plain = max_plain_len(key.size());
    if max_plain == 0 {
        return Err(CryptoError::format(format!(
            "{}-byte key is too small for OAEP-SHA256",
            key.size()
        )));
    }

    if plaintext.len() <= max_plain {
        trace!(target: "synapse::crypto", len = plaintext.len(), "Payload fits a single block");
        return encrypt_block(key, 0, plaintext);
    }

    let ciphertexts = plaintext
        .chunks(max_plain)
        .enumerate()
        .map(|(index, block)| encrypt_block(key, index, block))
        .collect::<CryptoResult<Vec<_>>>()?;

    let envelope = ChunkEnvelope::new(ciphertexts.iter().map(Vec::as_slice).collect());
    let encoded = envelope.encode()?;

    debug!(
        target: "synapse::crypto",
        plaintext_len = plaintext.len(),
        chunks = ciphertexts.len(),
        envelope_len = encoded.len(),
        "Payload encrypted as chunk envelope"
    );

    Ok(encoded)
}

// ----------------------------------------------------------------------------
// Decryption
// ----------------------------------------------------------------------------

fn decrypt_block(key: &RsaPrivateKey, index: usize, block: &[u8]) -> CryptoResult<Vec<u8>> {
    if block.len() != key.size() {
        return Err(CryptoError::Decryption {
            index,
            message: format!("chunk is {} bytes, key size is {}", block.len(), key.size()),
        });
    }
    key.decrypt(oaep(), block).map_err(|e| CryptoError::Decryption {
        index,
        message: e.to_string(),
    })
}

fn decrypt_all<'a>(
    key: &RsaPrivateKey,
    blocks: impl Iterator<Item = &'a [u8]>,
) -> CryptoResult<Vec<u8>> {
    let mut plaintext = Vec::new();
    for (index, block) in blocks.enumerate() {
        plaintext.extend_from_slice(&decrypt_block(key, index, block)?);
    }
    Ok(plaintext)
}

/// Decrypt anything produced by [`encrypt_large`], plus the legacy framing of
/// back-to-back key-sized ciphertexts. `None` returns the data unchanged.
pub fn decrypt_large(key: Option<&RsaPrivateKey>, data: &[u8]) -> CryptoResult<Vec<u8>> {
    let Some(key) = key else {
        return Ok(data.to_vec());
    };
    let key_size = key.size();

    // A bare ciphertext can start with the version byte by chance, so a failed
    // envelope parse falls through to the size-based paths when they apply.
    if ChunkEnvelope::looks_like(data) {
        match ChunkEnvelope::parse(data) {
            Ok(envelope) => {
                trace!(target: "synapse::crypto", chunks = envelope.chunks().len(), "Decrypting chunk envelope");
                return decrypt_all(key, envelope.chunks().iter().copied());
            }
            Err(e) if data.len() % key_size != 0 => return Err(e),
            Err(_) => {}
        }
    }

    if data.len() == key_size {
        return decrypt_block(key, 0, data);
    }

    if !data.is_empty() && data.len() % key_size == 0 {
        debug!(
            target: "synapse::crypto",
            chunks = data.len() / key_size,
            "Decrypting manually split ciphertext"
        );
        return decrypt_all(key, data.chunks(key_size));
    }

    Err(CryptoError::format(format!(
        "ciphertext of {} bytes is neither an envelope nor a multiple of the {key_size}-byte key size",
        data.len()
    )))
}
