//! In-memory backend guarded by a single store-wide lock.
//!
//! Snapshots are written with a plain create-truncate-write. There is no fsync
//! and no rename, so a crash mid-write can leave a truncated file behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{parse_kind, validate_all, MetricStore, Snapshottable};
use crate::error::{StorageError, StorageResult};
use crate::model::{MetricKind, MetricSample};

/// Snapshot document: `{"gauges":{..},"counters":{..}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct MemState {
    #[serde(default)]
    gauges: BTreeMap<String, f64>,
    #[serde(default)]
    counters: BTreeMap<String, i64>,
}

impl MemState {
    fn apply(&mut self, sample: &MetricSample) {
        match sample.kind {
            MetricKind::Gauge => {
                self.gauges
                    .insert(sample.id.to_string(), sample.value.unwrap_or_default());
            }
            MetricKind::Counter => {
                let slot = self.counters.entry(sample.id.to_string()).or_insert(0);
                *slot = slot.saturating_add(sample.delta.unwrap_or_default());
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemStore {
    state: Mutex<MemState>,
    snapshot_path: Option<PathBuf>,
}

impl MemStore {
    /// `snapshot_path`, when set, receives a final snapshot on [`MetricStore::close`]
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            snapshot_path,
        }
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.gauges.len() + state.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricStore for MemStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn get_all(&self) -> StorageResult<Vec<MetricSample>> {
        let state = self.state.lock();
        let gauges = state
            .gauges
            .iter()
            .map(|(id, value)| MetricSample::gauge(id.as_str(), *value));
        let counters = state
            .counters
            .iter()
            .map(|(id, delta)| MetricSample::counter(id.as_str(), *delta));
        Ok(gauges.chain(counters).collect())
    }

    fn get_one(&self, kind: &str, id: &str) -> StorageResult<MetricSample> {
        let kind = parse_kind(kind)?;
        let state = self.state.lock();
        let found = match kind {
            MetricKind::Gauge => state.gauges.get(id).map(|v| MetricSample::gauge(id, *v)),
            MetricKind::Counter => state.counters.get(id).map(|d| MetricSample::counter(id, *d)),
        };
        found.ok_or_else(|| StorageError::not_found(kind, id))
    }

    fn apply(&self, sample: &MetricSample) -> StorageResult<()> {
        sample.validate()?;
        self.state.lock().apply(sample);
        Ok(())
    }

    fn apply_batch(&self, samples: &[MetricSample]) -> StorageResult<()> {
        validate_all(samples)?;
        let mut state = self.state.lock();
        for sample in samples {
            state.apply(sample);
        }
        debug!(target: "synapse::store::memory", applied = samples.len(), "Batch applied");
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        if let Some(path) = &self.snapshot_path {
            self.save_snapshot(path)?;
        }
        Ok(())
    }

    fn as_snapshottable(&self) -> Option<&dyn Snapshottable> {
        Some(self)
    }
}

impl Snapshottable for MemStore {
    fn save_snapshot(&self, path: &Path) -> StorageResult<()> {
        // Serialize under the lock, write after releasing it.
        let document = {
            let state = self.state.lock();
            serde_json::to_vec_pretty(&*state).map_err(|e| StorageError::snapshot(path, e))?
        };
        fs::write(path, &document).map_err(|e| StorageError::snapshot(path, e))?;
        debug!(target: "synapse::store::memory", path = %path.display(), bytes = document.len(), "Snapshot saved");
        Ok(())
    }

    /// Replaces the current contents with the file's
    fn load_snapshot(&self, path: &Path) -> StorageResult<()> {
        let raw = fs::read(path).map_err(|e| StorageError::snapshot(path, e))?;
        let loaded: MemState = serde_json::from_slice(&raw).map_err(|e| StorageError::snapshot(path, e))?;
        let (gauges, counters) = (loaded.gauges.len(), loaded.counters.len());
        *self.state.lock() = loaded;
        info!(target: "synapse::store::memory", path = %path.display(), gauges, counters, "Snapshot restored");
        Ok(())
    }
}
