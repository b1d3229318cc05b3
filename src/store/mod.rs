// ============================================================================
// METRIC STORE
// ============================================================================
// Two interchangeable backends with identical merge semantics:
//
//   - counter apply adds the delta to the stored accumulator
//   - gauge apply overwrites the stored value
//
// `apply_batch` validates every sample before touching any state.
// ============================================================================

pub mod memory;
pub mod sqlite;

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::error::StorageResult;
use crate::model::{MetricKind, MetricSample};

pub use memory::MemStore;
pub use sqlite::SqliteStore;

/// Storage contract shared by every backend. Calls are blocking.
pub trait MetricStore: Send + Sync + Debug {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Gauges first, then counters, each ordered by id
    fn get_all(&self) -> StorageResult<Vec<MetricSample>>;

    /// Fails with `UnknownKind` for a kind string that is neither gauge nor
    /// counter, `NotFound` when the pair has never been applied
    fn get_one(&self, kind: &str, id: &str) -> StorageResult<MetricSample>;

    fn apply(&self, sample: &MetricSample) -> StorageResult<()>;

    /// All-or-nothing: either every sample is applied or none is
    fn apply_batch(&self, samples: &[MetricSample]) -> StorageResult<()>;

    /// Backend health
    fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    fn close(&self) -> StorageResult<()>;

    /// Snapshot capability, only offered by backends that can honour it
    fn as_snapshottable(&self) -> Option<&dyn Snapshottable> {
        None
    }
}

/// Whole-store save and restore through a JSON file
pub trait Snapshottable {
    fn save_snapshot(&self, path: &Path) -> StorageResult<()>;
    fn load_snapshot(&self, path: &Path) -> StorageResult<()>;
}

pub type SharedStore = Arc<dyn MetricStore>;

/// Validate everything up front so a failing sample leaves the store untouched
pub(crate) fn validate_all(samples: &[MetricSample]) -> StorageResult<()> {
    for sample in samples {
        sample.validate()?;
    }
    Ok(())
}

pub(crate) fn parse_kind(kind: &str) -> StorageResult<MetricKind> {
    kind.parse()
        .map_err(|_| crate::error::StorageError::UnknownKind { kind: kind.to_string() })
}

/// Which backend to open and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Memory { snapshot_path: Option<PathBuf> },
    Sqlite { path: PathBuf },
}

pub fn open_store(kind: &StoreKind) -> StorageResult<SharedStore> {
    let store: SharedStore = match kind {
        StoreKind::Memory { snapshot_path } => Arc::new(MemStore::new(snapshot_path.clone())),
        StoreKind::Sqlite { path } => Arc::new(SqliteStore::open(path)?),
    };
    info!(target: "synapse::store", backend = store.backend(), "Metric store opened");
    Ok(store)
}
