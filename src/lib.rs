//! # Synapse Telemetry
//!
//! A telemetry pipeline made of two halves that share one wire protocol:
//!
//! * the **agent** polls a metric source on a timer, snapshots its local store
//!   into a [`Batch`] on a second timer and hands batches to a bounded worker
//!   pool that signs, encrypts, compresses and ships them over either HTTP or a
//!   gRPC channel;
//! * the **server** runs every inbound request through the
//!   [`IngestionGateway`](gateway::IngestionGateway) (access check, decompress,
//!   decrypt, verify, validate, apply) into a [`MetricStore`](store::MetricStore).
//!
//! The pieces are usable on their own: [`crypto`] implements the RSA-OAEP chunk
//! envelope, [`signer`] the HMAC integrity tags, [`store`] the counter/gauge
//! merge semantics over an in-memory or SQLite backend.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ============================================================================
// MODULES
// ============================================================================

pub mod access;
pub mod agent;
pub mod collector;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod proto;
pub mod server;
pub mod signer;
pub mod store;
pub mod transport;

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Full product name
pub const FULL_NAME: &str = "Synapse Telemetry";

/// Header carrying the base64 HMAC of the plaintext body
pub const HEADER_SIGNATURE: &str = "HashSHA256";

/// Header carrying the forwarded client address checked by the access guard
pub const HEADER_REAL_IP: &str = "X-Real-IP";

/// Header marking a body as chunk-encrypted
pub const HEADER_ENCRYPTED: &str = "X-Encrypted";

/// Header naming the encryption algorithm
pub const HEADER_ENCRYPTION_ALGORITHM: &str = "X-Encryption-Algorithm";

/// Header naming the encryption framing
pub const HEADER_ENCRYPTION_MODE: &str = "X-Encryption-Mode";

pub const ENCRYPTION_ALGORITHM: &str = "RSA-OAEP";
pub const ENCRYPTION_MODE: &str = "chunk-protocol";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use error::{SynapseError, SynapseResult};
pub use model::{Batch, MetricKind, MetricSample, WireMetric};
