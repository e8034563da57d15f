//! SQLite-backed persistence for operation records and update history.
//!
//! Schema:
//! - operations: one row per dashboard operation (container start, pull, ...)
//! - update_history: one row per self-update attempt
//!
//! Timestamps are stored as Unix milliseconds so age queries are plain integer
//! comparisons.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nodedash_common::{HistoryEntry, HistoryStatus, OperationRecord, OperationStatus};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// What the stale-operation janitor needs from persistence
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Records whose status is in `statuses` and that were created before `cutoff`
    async fn operations_older_than(
        &self,
        statuses: &[OperationStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OperationRecord>>;

    async fn update_operation_status(
        &self,
        id: &str,
        status: OperationStatus,
        message: &str,
    ) -> Result<()>;
}

/// What the update orchestrator records per attempt
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record_attempt(
        &self,
        version: &str,
        channel: &str,
        started_at: DateTime<Utc>,
    ) -> Result<i64>;

    /// `version` is final here; the attempt may have been recorded before
    /// the target version was known
    async fn finish_attempt(
        &self,
        id: i64,
        version: &str,
        status: HistoryStatus,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS operations (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        message TEXT NOT NULL DEFAULT ''
    );

    CREATE INDEX IF NOT EXISTS idx_operations_status_created
        ON operations(status, created_at);

    CREATE TABLE IF NOT EXISTS update_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version TEXT NOT NULL,
        channel TEXT NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        started_at INTEGER NOT NULL,
        completed_at INTEGER
    );
"#;

pub struct Database {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Database {
    /// Open or create the database at `path`, creating parent directories
    pub async fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)
                .with_context(|| format!("Failed to open database {}", path.display()))?;

            // WAL so status reads don't block the janitor's writes
            conn.pragma_update(None, "journal_mode", "WAL")
                .context("Failed to enable WAL mode")?;
            conn.execute_batch(SCHEMA)
                .context("Failed to initialize schema")?;

            info!("Database ready at {}", path.display());
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` against the connection on the blocking pool
    pub async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            let conn = guard.as_ref().ok_or_else(|| anyhow!("database is closed"))?;
            f(conn)
        })
        .await?
    }

    pub async fn create_operation(&self, record: &OperationRecord) -> Result<()> {
        let record = record.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO operations (id, kind, created_at, status, message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    &record.id,
                    &record.kind,
                    record.created_at.timestamp_millis(),
                    record.status.as_str(),
                    &record.message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>> {
        let id = id.to_string();
        self.execute(move |conn| {
            let record = conn
                .query_row(
                    "SELECT id, kind, created_at, status, message FROM operations WHERE id = ?1",
                    params![id],
                    operation_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    pub async fn set_operation_status(
        &self,
        id: &str,
        status: OperationStatus,
        message: &str,
    ) -> Result<bool> {
        let id = id.to_string();
        let message = message.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE operations SET status = ?2, message = ?3 WHERE id = ?1",
                params![id, status.as_str(), message],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn recent_operations(&self, limit: usize) -> Result<Vec<OperationRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, created_at, status, message FROM operations
                 ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], operation_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, version, channel, status, error_message, started_at, completed_at
                 FROM update_history ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], history_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Fold the write-ahead log into the main database file
    pub async fn checkpoint(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection. Later calls fail with "database is closed".
    pub async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let taken = conn.blocking_lock().take();
            if let Some(conn) = taken {
                conn.close()
                    .map_err(|(_, e)| e)
                    .context("Failed to close database")?;
                info!("Database closed");
            }
            Ok(())
        })
        .await?
    }

    pub async fn is_closed(&self) -> bool {
        self.conn.lock().await.is_none()
    }
}

#[async_trait]
impl OperationStore for Database {
    async fn operations_older_than(
        &self,
        statuses: &[OperationStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OperationRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..statuses.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, kind, created_at, status, message FROM operations
             WHERE created_at < ?1 AND status IN ({})
             ORDER BY created_at",
            placeholders
        );
        let mut values: Vec<rusqlite::types::Value> = vec![cutoff.timestamp_millis().into()];
        values.extend(statuses.iter().map(|s| s.as_str().to_string().into()));

        self.execute(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), operation_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn update_operation_status(
        &self,
        id: &str,
        status: OperationStatus,
        message: &str,
    ) -> Result<()> {
        self.set_operation_status(id, status, message).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for Database {
    async fn record_attempt(
        &self,
        version: &str,
        channel: &str,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        let version = version.to_string();
        let channel = channel.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO update_history (version, channel, status, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    version,
                    channel,
                    HistoryStatus::InProgress.as_str(),
                    started_at.timestamp_millis()
                ],
            )
            .context("Failed to record update attempt")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn finish_attempt(
        &self,
        id: i64,
        version: &str,
        status: HistoryStatus,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let version = version.to_string();
        let error_message = error_message.map(str::to_string);
        self.execute(move |conn| {
            conn.execute(
                "UPDATE update_history
                 SET version = ?2, status = ?3, error_message = ?4, completed_at = ?5
                 WHERE id = ?1",
                params![
                    id,
                    version,
                    status.as_str(),
                    error_message,
                    completed_at.timestamp_millis()
                ],
            )
            .context("Failed to finalize update attempt")?;
            Ok(())
        })
        .await
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<OperationRecord> {
    let status: String = row.get(3)?;
    Ok(OperationRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        created_at: millis_to_datetime(row.get(2)?),
        // Unknown strings come from a newer schema; treat them as failed
        status: OperationStatus::parse(&status).unwrap_or(OperationStatus::Failed),
        message: row.get(4)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let status: String = row.get(3)?;
    let completed_at: Option<i64> = row.get(6)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        version: row.get(1)?,
        channel: row.get(2)?,
        status: HistoryStatus::parse(&status).unwrap_or(HistoryStatus::Failed),
        error_message: row.get(4)?,
        started_at: millis_to_datetime(row.get(5)?),
        completed_at: completed_at.map(millis_to_datetime),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn test_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("nodedash.db")).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_create_and_fetch_operation() {
        let (_dir, db) = test_db().await;
        let record = OperationRecord::new("image-pull");
        db.create_operation(&record).await.unwrap();

        let fetched = db.get_operation(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.kind, "image-pull");
        assert_eq!(fetched.status, OperationStatus::Pending);
        assert_eq!(
            fetched.created_at.timestamp_millis(),
            record.created_at.timestamp_millis()
        );
        assert!(db.get_operation("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_older_than_filters_status_and_age() {
        let (_dir, db) = test_db().await;
        let now = Utc::now();
        let old_pending = OperationRecord::new("a").with_created_at(now - Duration::minutes(6));
        let old_running = OperationRecord::new("b")
            .with_created_at(now - Duration::minutes(7))
            .with_status(OperationStatus::InProgress);
        let old_done = OperationRecord::new("c")
            .with_created_at(now - Duration::minutes(8))
            .with_status(OperationStatus::Succeeded);
        let young = OperationRecord::new("d").with_created_at(now - Duration::minutes(1));
        for record in [&old_pending, &old_running, &old_done, &young] {
            db.create_operation(record).await.unwrap();
        }

        let stale = db
            .operations_older_than(&OperationStatus::RECLAIMABLE, now - Duration::minutes(5))
            .await
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![old_running.id.as_str(), old_pending.id.as_str()]);
    }

    #[tokio::test]
    async fn test_history_lifecycle() {
        let (_dir, db) = test_db().await;
        let id = db.record_attempt("1.2.0", "stable", Utc::now()).await.unwrap();
        db.finish_attempt(id, "1.2.0", HistoryStatus::Failed, Some("checksum mismatch"), Utc::now())
            .await
            .unwrap();

        let rows = db.recent_history(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, HistoryStatus::Failed);
        assert_eq!(rows[0].error_message.as_deref(), Some("checksum mismatch"));
        assert!(rows[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_history_table_is_an_error_not_a_panic() {
        let (_dir, db) = test_db().await;
        db.execute(|conn| Ok(conn.execute_batch("DROP TABLE update_history;")?))
            .await
            .unwrap();
        assert!(db.record_attempt("1.2.0", "stable", Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_and_close() {
        let (_dir, db) = test_db().await;
        db.create_operation(&OperationRecord::new("x")).await.unwrap();
        db.checkpoint().await.unwrap();
        db.close().await.unwrap();
        assert!(db.is_closed().await);
        assert!(db.recent_operations(10).await.is_err());
        // Closing twice is fine
        db.close().await.unwrap();
    }
}
