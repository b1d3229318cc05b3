// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, all folded into `SynapseError`.
// Every failure stays scoped to the request or batch that produced it.
// ============================================================================

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use thiserror::Error;

/// Result alias used across the crate
pub type SynapseResult<T> = Result<T, SynapseError>;

pub type StorageResult<T> = Result<T, StorageError>;
pub type TransportResult<T> = Result<T, TransportError>;
pub type CryptoResult<T> = Result<T, CryptoError>;

// ----------------------------------------------------------------------------
// Top-level error
// ----------------------------------------------------------------------------

/// Root error type. All subsystem errors convert into it.
#[derive(Error, Debug)]
pub enum SynapseError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SynapseError {
    /// Whether the operation can sensibly be retried
    pub fn is_recoverable(&self) -> bool {
        match self {
            SynapseError::Config(_) => false,
            SynapseError::Validation(_) => false,
            SynapseError::Crypto(_) => false,
            SynapseError::Signature(_) => false,
            SynapseError::Storage(e) => e.is_recoverable(),
            SynapseError::Transport(e) => e.is_retryable(),
            SynapseError::Access(_) => false,
            SynapseError::Gateway(e) => e.is_recoverable(),
            SynapseError::Io(_) => true,
            SynapseError::Internal(_) => false,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            SynapseError::Config(_) => "config",
            SynapseError::Validation(_) => "validation",
            SynapseError::Crypto(_) => "crypto",
            SynapseError::Signature(_) => "signature",
            SynapseError::Storage(_) => "storage",
            SynapseError::Transport(_) => "transport",
            SynapseError::Access(_) => "access",
            SynapseError::Gateway(e) => e.category(),
            SynapseError::Io(_) => "io",
            SynapseError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Validation errors
// ----------------------------------------------------------------------------

/// A sample with a bad id, kind or value combination
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("metric name must not be empty")]
    EmptyName,

    #[error("unknown metric type '{kind}'")]
    UnknownKind { kind: String },

    #[error("counter '{id}' requires an integer delta")]
    MissingDelta { id: String },

    #[error("gauge '{id}' requires a numeric value")]
    MissingValue { id: String },

    #[error("{kind} '{id}' carries a field that belongs to the other metric type")]
    ConflictingFields { id: String, kind: String },

    #[error("gauge '{id}' value must be finite")]
    NonFiniteValue { id: String },

    #[error("invalid {kind} value '{raw}' for '{id}'")]
    InvalidValue { id: String, kind: String, raw: String },
}

// ----------------------------------------------------------------------------
// Crypto errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption of chunk {index} failed: {message}")]
    Encryption { index: usize, message: String },

    #[error("decryption of chunk {index} failed: {message}")]
    Decryption { index: usize, message: String },

    #[error("malformed ciphertext: {message}")]
    Format { message: String },

    #[error("failed to load key '{path}': {message}")]
    KeyLoad { path: PathBuf, message: String },

    #[error("key generation failed: {message}")]
    KeyGeneration { message: String },

    #[error("payload is marked encrypted but no private key is configured")]
    NoPrivateKey,
}

impl CryptoError {
    pub fn format(message: impl Into<String>) -> Self {
        CryptoError::Format {
            message: message.into(),
        }
    }

    pub fn key_load(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        CryptoError::KeyLoad {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Signature errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature mismatch")]
    Mismatch,

    #[error("missing HashSHA256 signature")]
    Missing,

    #[error("malformed signature: {message}")]
    Malformed { message: String },
}

// ----------------------------------------------------------------------------
// Storage errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("metric '{id}' of type '{kind}' not found")]
    NotFound { kind: String, id: String },

    #[error("unknown metric type '{kind}'")]
    UnknownKind { kind: String },

    #[error("invalid metric: {0}")]
    Invalid(#[from] ValidationError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("snapshot '{path}' failed: {message}")]
    Snapshot { path: PathBuf, message: String },
}

impl StorageError {
    pub fn not_found(kind: impl ToString, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn snapshot(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        StorageError::Snapshot {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::Database(_) | StorageError::Snapshot { .. })
    }
}

// ----------------------------------------------------------------------------
// Transport errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request to '{endpoint}' failed: {message}")]
    Request { endpoint: String, message: String },

    #[error("'{endpoint}' answered with status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("call to '{endpoint}' timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("connection to '{endpoint}' failed: {message}")]
    Connection { endpoint: String, message: String },

    #[error("failed to encode payload: {message}")]
    Encode { message: String },

    #[error("remote rejected metrics: {message}")]
    Rejected { message: String },

    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: usize, last: String },

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

impl TransportError {
    pub fn encode(message: impl ToString) -> Self {
        TransportError::Encode {
            message: message.to_string(),
        }
    }

    /// Network-level failures are retried, payload and remote rejections are not
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Request { .. }
                | TransportError::Status { .. }
                | TransportError::Timeout { .. }
                | TransportError::Connection { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// Access errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("client address header is missing")]
    MissingAddress,

    #[error("client address '{raw}' is not a valid IP")]
    InvalidAddress { raw: String },

    #[error("client {ip} is outside trusted subnet {subnet}")]
    Untrusted { ip: IpAddr, subnet: IpNet },
}

// ----------------------------------------------------------------------------
// Gateway errors
// ----------------------------------------------------------------------------

/// Outcome of a rejected inbound request
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("access denied: {0}")]
    AccessDenied(#[from] AccessError),

    #[error("failed to decompress body: {message}")]
    Decompress { message: String },

    #[error("decryption failed: {0}")]
    Decryption(#[from] CryptoError),

    #[error("signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("malformed request body: {message}")]
    MalformedBody { message: String },

    #[error("invalid metric: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Storage(#[from] StorageError),
}

impl GatewayError {
    pub fn malformed(message: impl ToString) -> Self {
        GatewayError::MalformedBody {
            message: message.to_string(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            GatewayError::Storage(e) => e.is_recoverable(),
            _ => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::AccessDenied(_) => "access",
            GatewayError::Decompress { .. } => "decompress",
            GatewayError::Decryption(_) => "crypto",
            GatewayError::Signature(_) => "signature",
            GatewayError::MalformedBody { .. } => "decode",
            GatewayError::Validation(_) => "validation",
            GatewayError::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_retryable_classification() {
        let timeout = TransportError::Timeout {
            endpoint: "localhost:8080".into(),
            timeout: Duration::from_secs(3),
        };
        assert!(timeout.is_retryable());
        assert!(!TransportError::Rejected { message: "bad".into() }.is_retryable());
        assert!(!TransportError::encode("oops").is_retryable());
    }

    #[test]
    fn test_error_categories() {
        let err = SynapseError::from(GatewayError::from(AccessError::MissingAddress));
        assert_eq!(err.category(), "access");
        assert!(!err.is_recoverable());

        let err = SynapseError::from(StorageError::not_found("gauge", "Alloc"));
        assert_eq!(err.category(), "storage");
        assert_eq!(
            err.to_string(),
            "Storage error: metric 'Alloc' of type 'gauge' not found"
        );
    }

    #[test]
    fn test_decryption_error_names_chunk() {
        let err = CryptoError::Decryption {
            index: 3,
            message: "decryption error".into(),
        };
        assert!(err.to_string().contains("chunk 3"));
    }
}
