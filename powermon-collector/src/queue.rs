//! Durable store-and-forward queue
//!
//! Readings that could not be uploaded immediately land here and are drained
//! later by the forwarding loop.
//!
//! - SQLite file (WAL), survives restarts
//! - One pooled connection: store/fetch/mark/purge are serialized
//! - Timestamps stored as Unix milliseconds so ordering is numeric

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::Reading;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS power_data_cache (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    collector_id  TEXT    NOT NULL,
    timestamp_ms  INTEGER NOT NULL,
    voltage       REAL    NOT NULL,
    current       REAL    NOT NULL,
    power         REAL    NOT NULL,
    energy        REAL    NOT NULL,
    frequency     REAL    NOT NULL,
    power_factor  REAL    NOT NULL,
    uploaded      INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_collector ON power_data_cache (collector_id);
CREATE INDEX IF NOT EXISTS idx_cache_pending ON power_data_cache (uploaded, timestamp_ms);
"#;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid data in queue: {0}")]
    InvalidData(String),
}

/// A persisted reading awaiting (or past) upload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: i64,
    pub collector_id: String,
    pub timestamp: DateTime<Utc>,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy: f64,
    pub frequency: f64,
    pub power_factor: f64,
    pub uploaded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: i64,
    pub uploaded: i64,
    pub unuploaded: i64,
}

#[derive(Clone)]
pub struct DurableQueue {
    pool: SqlitePool,
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue").finish_non_exhaustive()
    }
}

impl DurableQueue {
    /// Open (or create) the queue database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let queue = Self::connect(options).await?;
        info!("Cache database opened at {}", path.display());
        Ok(queue)
    }

    /// Volatile queue, for tests and dry runs
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StorageError> {
        // Single connection: SQLite has one writer anyway, and an in-memory
        // database only exists inside the connection that created it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Append a reading as not-yet-uploaded
    pub async fn store(&self, collector_id: &str, reading: &Reading) -> Result<i64, StorageError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO power_data_cache \
             (collector_id, timestamp_ms, voltage, current, power, energy, frequency, power_factor, \
              uploaded, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(collector_id)
        .bind(reading.timestamp.timestamp_millis())
        .bind(reading.voltage)
        .bind(reading.current)
        .bind(reading.power)
        .bind(reading.energy)
        .bind(reading.frequency)
        .bind(reading.power_factor)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Oldest-first pending entries, at most `limit`
    pub async fn fetch_unuploaded(&self, limit: u32) -> Result<Vec<QueueEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM power_data_cache WHERE uploaded = 0 \
             ORDER BY timestamp_ms ASC, id ASC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Flip entries to uploaded. Already-uploaded and unknown ids are ignored.
    pub async fn mark_uploaded(&self, ids: &[i64]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE power_data_cache SET uploaded = 1, updated_at_ms = ");
        builder.push_bind(Utc::now().timestamp_millis());
        builder.push(" WHERE uploaded = 0 AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        debug!("Marked {} cache entries as uploaded", result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Delete uploaded entries last touched more than `retention` ago
    pub async fn purge_older_than(&self, retention: Duration) -> Result<u64, StorageError> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| StorageError::InvalidData(format!("retention out of range: {}", e)))?;
        self.purge_uploaded_before(Utc::now() - retention).await
    }

    /// Delete uploaded entries last touched before `cutoff`. Pending entries are never deleted.
    pub async fn purge_uploaded_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM power_data_cache WHERE uploaded = 1 AND updated_at_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            info!("Purged {} uploaded cache entries", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<QueueStats, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COALESCE(SUM(CASE WHEN uploaded = 0 THEN 1 ELSE 0 END), 0) AS pending \
             FROM power_data_cache",
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let unuploaded: i64 = row.try_get("pending")?;
        Ok(QueueStats {
            total,
            uploaded: total - unuploaded,
            unuploaded,
        })
    }

    /// Newest-first entries for one collector, uploaded or not
    pub async fn latest(&self, collector_id: &str, limit: u32) -> Result<Vec<QueueEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM power_data_cache WHERE collector_id = ? \
             ORDER BY timestamp_ms DESC, id DESC LIMIT ?",
        )
        .bind(collector_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<QueueEntry, StorageError> {
    Ok(QueueEntry {
        id: row.try_get("id")?,
        collector_id: row.try_get("collector_id")?,
        timestamp: millis_to_utc(row.try_get("timestamp_ms")?)?,
        voltage: row.try_get("voltage")?,
        current: row.try_get("current")?,
        power: row.try_get("power")?,
        energy: row.try_get("energy")?,
        frequency: row.try_get("frequency")?,
        power_factor: row.try_get("power_factor")?,
        uploaded: row.try_get("uploaded")?,
        created_at: millis_to_utc(row.try_get("created_at_ms")?)?,
        updated_at: millis_to_utc(row.try_get("updated_at_ms")?)?,
    })
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::InvalidData(format!("timestamp out of range: {}", ms)))
}
