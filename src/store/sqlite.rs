//! Transactional backend on SQLite.
//!
//! `apply_batch` runs inside one transaction and rolls back on the first
//! failure. A single `apply` performs its read-then-upsert without an explicit
//! transaction. Counter increments are a read followed by an upsert, so two
//! processes writing the same counter through separate connections can lose
//! an update. Within one `SqliteStore` the connection mutex serializes writers.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{parse_kind, validate_all, MetricStore};
use crate::error::{StorageError, StorageResult};
use crate::model::{MetricKind, MetricSample};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    id      TEXT    NOT NULL,
    m_type  TEXT    NOT NULL CHECK (m_type IN ('gauge', 'counter')),
    delta   INTEGER,
    value   REAL,
    PRIMARY KEY (id, m_type)
);
";

const UPSERT: &str = "
INSERT INTO metrics (id, m_type, delta, value) VALUES (?1, ?2, ?3, ?4)
ON CONFLICT (id, m_type) DO UPDATE SET delta = excluded.delta, value = excluded.value
";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    location: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn, Some(path.to_path_buf()))?;
        info!(target: "synapse::store::sqlite", path = %path.display(), "Database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, location: Option<PathBuf>) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }
}

fn read_counter(conn: &Connection, id: &str) -> StorageResult<i64> {
    let current: Option<Option<i64>> = conn
        .query_row(
            "SELECT delta FROM metrics WHERE id = ?1 AND m_type = 'counter'",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(current.flatten().unwrap_or(0))
}

/// Read-then-upsert for one sample on whatever connection or transaction is given
fn upsert(conn: &Connection, sample: &MetricSample) -> StorageResult<()> {
    let id = sample.id.as_str();
    match sample.kind {
        MetricKind::Counter => {
            let total = read_counter(conn, id)?.saturating_add(sample.delta.unwrap_or_default());
            conn.execute(UPSERT, params![id, "counter", total, Option::<f64>::None])?;
        }
        MetricKind::Gauge => {
            conn.execute(UPSERT, params![id, "gauge", Option::<i64>::None, sample.value])?;
        }
    }
    Ok(())
}

fn row_to_sample(row: &Row<'_>) -> rusqlite::Result<(String, String, Option<i64>, Option<f64>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_sample(
    (id, kind, delta, value): (String, String, Option<i64>, Option<f64>),
) -> StorageResult<MetricSample> {
    Ok(match parse_kind(&kind)? {
        MetricKind::Counter => MetricSample::counter(id, delta.unwrap_or_default()),
        MetricKind::Gauge => MetricSample::gauge(id, value.unwrap_or_default()),
    })
}

impl MetricStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn get_all(&self) -> StorageResult<Vec<MetricSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, m_type, delta, value FROM metrics
             ORDER BY CASE m_type WHEN 'gauge' THEN 0 ELSE 1 END, id",
        )?;
        let rows = stmt.query_map([], row_to_sample)?;
        let samples: StorageResult<Vec<_>> = rows.map(|row| into_sample(row?)).collect();
        samples
    }

    fn get_one(&self, kind: &str, id: &str) -> StorageResult<MetricSample> {
        let kind = parse_kind(kind)?;
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, m_type, delta, value FROM metrics WHERE id = ?1 AND m_type = ?2",
                params![id, kind.as_str()],
                row_to_sample,
            )
            .optional()?;
        match row {
            Some(row) => into_sample(row),
            None => Err(StorageError::not_found(kind, id)),
        }
    }

    fn apply(&self, sample: &MetricSample) -> StorageResult<()> {
        sample.validate()?;
        let conn = self.conn.lock();
        upsert(&conn, sample)
    }

    fn apply_batch(&self, samples: &[MetricSample]) -> StorageResult<()> {
        validate_all(samples)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for sample in samples {
            // Dropping `tx` on the early return rolls the batch back.
            upsert(&tx, sample)?;
        }
        tx.commit()?;
        debug!(target: "synapse::store::sqlite", applied = samples.len(), "Batch committed");
        Ok(())
    }

    fn ping(&self) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        // The connection itself closes on drop.
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }
}
