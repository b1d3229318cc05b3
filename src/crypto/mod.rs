// ============================================================================
// CRYPTO CONTEXT
// ============================================================================
// Key material is owned by an explicit `CryptoContext` handed to the agent's
// pipeline and the server's gateway. There is no process-wide key state.
// ============================================================================

pub mod chunk;
pub mod keys;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::CryptoResult;

pub use chunk::{decrypt_large, encrypt_large, max_plain_len, ChunkEnvelope, CHUNK_PROTOCOL_VERSION};

/// Optional public key (agent side) and optional private key (server side)
#[derive(Clone, Default)]
pub struct CryptoContext {
    public: Option<Arc<RsaPublicKey>>,
    private: Option<Arc<RsaPrivateKey>>,
}

impl CryptoContext {
    /// Context that neither encrypts nor decrypts
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_public_key(mut self, key: RsaPublicKey) -> Self {
        self.public = Some(Arc::new(key));
        self
    }

    pub fn with_private_key(mut self, key: RsaPrivateKey) -> Self {
        self.private = Some(Arc::new(key));
        self
    }

    /// Load whichever key paths are set. `None` leaves that side disabled.
    pub fn from_paths(public: Option<&Path>, private: Option<&Path>) -> CryptoResult<Self> {
        let mut ctx = Self::disabled();
        if let Some(path) = public {
            ctx = ctx.with_public_key(keys::load_public_key(path)?);
        }
        if let Some(path) = private {
            ctx = ctx.with_private_key(keys::load_private_key(path)?);
        }
        Ok(ctx)
    }

    pub fn can_encrypt(&self) -> bool {
        self.public.is_some()
    }

    pub fn can_decrypt(&self) -> bool {
        self.private.is_some()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        encrypt_large(self.public.as_deref(), plaintext)
    }

    pub fn decrypt(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        decrypt_large(self.private.as_deref(), data)
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("public_key_bytes", &self.public.as_ref().map(|k| k.size()))
            .field("private_key", &self.private.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_keys {
    use once_cell::sync::Lazy;
    use rsa::{RsaPrivateKey, RsaPublicKey};

    /// 1024-bit key: 128-byte blocks, 62-byte plaintext limit
    pub static TEST_PRIVATE_KEY: Lazy<RsaPrivateKey> = Lazy::new(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("test key generation")
    });

    pub static TEST_PUBLIC_KEY: Lazy<RsaPublicKey> = Lazy::new(|| RsaPublicKey::from(&*TEST_PRIVATE_KEY));
}

#[cfg(test)]
mod tests {
    use super::test_keys::{TEST_PRIVATE_KEY, TEST_PUBLIC_KEY};
    use super::*;

    #[test]
    fn test_context_round_trip() {
        let sender = CryptoContext::disabled().with_public_key(TEST_PUBLIC_KEY.clone());
        let receiver = CryptoContext::disabled().with_private_key(TEST_PRIVATE_KEY.clone());
        assert!(sender.can_encrypt() && !sender.can_decrypt());

        let payload = br#"{"metrics":[{"id":"Alloc","type":"gauge","value":12.5}]}"#.repeat(4);
        let cipher = sender.encrypt(&payload).unwrap();
        assert_ne!(cipher, payload);
        assert_eq!(receiver.decrypt(&cipher).unwrap(), payload);
    }

    #[test]
    fn test_disabled_context_is_identity() {
        let ctx = CryptoContext::disabled();
        assert_eq!(ctx.encrypt(b"abc").unwrap(), b"abc");
        assert_eq!(ctx.decrypt(b"abc").unwrap(), b"abc");
        assert_eq!(format!("{ctx:?}"), "CryptoContext { public_key_bytes: None, private_key: false }");
    }
}
