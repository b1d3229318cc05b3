//! PEM key loading and key pair generation.
//!
//! Both PKCS#8 (`PUBLIC KEY` / `PRIVATE KEY`) and PKCS#1 (`RSA PUBLIC KEY` /
//! `RSA PRIVATE KEY`) encodings are accepted. Generated keys are written as
//! PKCS#8.

use std::fs;
use std::path::{Path, PathBuf};

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::info;

use crate::error::{CryptoError, CryptoResult};

/// Smallest modulus accepted by [`generate_key_pair`]
pub const MIN_KEY_BITS: usize = 1024;

pub const DEFAULT_KEY_BITS: usize = 2048;

pub const PRIVATE_KEY_FILE: &str = "private.pem";
pub const PUBLIC_KEY_FILE: &str = "public.pem";

pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, String> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|pkcs8| {
            RsaPublicKey::from_pkcs1_pem(pem).map_err(|pkcs1| format!("not PKCS#8 ({pkcs8}) nor PKCS#1 ({pkcs1})"))
        })
}

pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey, String> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|pkcs8| {
            RsaPrivateKey::from_pkcs1_pem(pem).map_err(|pkcs1| format!("not PKCS#8 ({pkcs8}) nor PKCS#1 ({pkcs1})"))
        })
}

pub fn load_public_key(path: &Path) -> CryptoResult<RsaPublicKey> {
    let pem = fs::read_to_string(path).map_err(|e| CryptoError::key_load(path, e))?;
    parse_public_key_pem(&pem).map_err(|e| CryptoError::key_load(path, e))
}

pub fn load_private_key(path: &Path) -> CryptoResult<RsaPrivateKey> {
    let pem = fs::read_to_string(path).map_err(|e| CryptoError::key_load(path, e))?;
    parse_private_key_pem(&pem).map_err(|e| CryptoError::key_load(path, e))
}

pub fn generate_key_pair(bits: usize) -> CryptoResult<(RsaPrivateKey, RsaPublicKey)> {
    if bits < MIN_KEY_BITS {
        return Err(CryptoError::KeyGeneration {
            message: format!("{bits}-bit keys are below the {MIN_KEY_BITS}-bit minimum"),
        });
    }
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, bits).map_err(|e| CryptoError::KeyGeneration {
        message: e.to_string(),
    })?;
    let public = RsaPublicKey::from(&private);
    Ok((private, public))
}

/// Generate a key pair and write `private.pem` / `public.pem` into `dir`
pub fn write_key_pair(dir: &Path, bits: usize) -> CryptoResult<(PathBuf, PathBuf)> {
    let (private, public) = generate_key_pair(bits)?;
    let generation = |e: &dyn std::fmt::Display| CryptoError::KeyGeneration { message: e.to_string() };

    let private_pem = private.to_pkcs8_pem(LineEnding::LF).map_err(|e| generation(&e))?;
    let public_pem = public.to_public_key_pem(LineEnding::LF).map_err(|e| generation(&e))?;

    fs::create_dir_all(dir).map_err(|e| generation(&e))?;
    let private_path = dir.join(PRIVATE_KEY_FILE);
    let public_path = dir.join(PUBLIC_KEY_FILE);
    fs::write(&private_path, private_pem.as_bytes()).map_err(|e| generation(&e))?;
    fs::write(&public_path, public_pem.as_bytes()).map_err(|e| generation(&e))?;

    info!(
        target: "synapse::crypto",
        bits,
        private = %private_path.display(),
        public = %public_path.display(),
        "Key pair written"
    );
    Ok((private_path, public_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys::{TEST_PRIVATE_KEY, TEST_PUBLIC_KEY};
    use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};

    #[test]
    fn test_load_pkcs8_and_pkcs1() {
        let dir = tempfile::tempdir().unwrap();

        let pkcs8_pub = dir.path().join("pub8.pem");
        fs::write(&pkcs8_pub, TEST_PUBLIC_KEY.to_public_key_pem(LineEnding::LF).unwrap()).unwrap();
        let pkcs1_pub = dir.path().join("pub1.pem");
        fs::write(&pkcs1_pub, TEST_PUBLIC_KEY.to_pkcs1_pem(LineEnding::LF).unwrap()).unwrap();
        assert_eq!(load_public_key(&pkcs8_pub).unwrap(), *TEST_PUBLIC_KEY);
        assert_eq!(load_public_key(&pkcs1_pub).unwrap(), *TEST_PUBLIC_KEY);

        let pkcs1_priv = dir.path().join("priv1.pem");
        fs::write(&pkcs1_priv, TEST_PRIVATE_KEY.to_pkcs1_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
        assert_eq!(load_private_key(&pkcs1_priv).unwrap(), *TEST_PRIVATE_KEY);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.pem");
        fs::write(&path, "not a key").unwrap();
        assert!(matches!(load_public_key(&path), Err(CryptoError::KeyLoad { .. })));
        assert!(matches!(
            load_private_key(&dir.path().join("missing.pem")),
            Err(CryptoError::KeyLoad { .. })
        ));
    }

    #[test]
    fn test_generate_refuses_tiny_keys() {
        assert!(matches!(generate_key_pair(512), Err(CryptoError::KeyGeneration { .. })));
    }

    #[test]
    fn test_write_key_pair_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (private_path, public_path) = write_key_pair(dir.path(), MIN_KEY_BITS).unwrap();
        let private = load_private_key(&private_path).unwrap();
        let public = load_public_key(&public_path).unwrap();
        assert_eq!(RsaPublicKey::from(&private), public);
    }
}
