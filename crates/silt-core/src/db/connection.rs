//! Database connection management

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use tokio::sync::Mutex;

use crate::config::RetryPolicy;
use crate::error::Result;

use super::migrations;
use super::store::LibSqlRecordStore;

/// Database wrapper for libSQL connections
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
    // Serializes multi-statement transactions issued through record stores
    // sharing this connection.
    write_gate: Arc<Mutex<()>>,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations and crash recovery automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        let database = Self {
            _db: db,
            conn,
            write_gate: Arc::new(Mutex::new(())),
        };
        database.configure().await?;
        database.migrate().await?;
        database.recover().await?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        let database = Self {
            _db: db,
            conn,
            write_gate: Arc::new(Mutex::new(())),
        };
        database.configure().await?;
        database.migrate().await?;
        database.recover().await?;
        Ok(database)
    }

    /// Configure `SQLite` for this workload
    async fn configure(&self) -> Result<()> {
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok(); // in-memory databases reject WAL
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    /// Reclassify records left in-flight by a crash.
    ///
    /// A record found `syncing` at startup has an unknown remote outcome;
    /// it is moved to `error` so the next cycle redelivers it and the
    /// remote deduplicates on the content hash.
    async fn recover(&self) -> Result<()> {
        let recovered = recover_interrupted(&self.conn).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "reclassified interrupted deliveries to error");
        }
        Ok(())
    }

    /// Build a record store sharing this database's connection and write gate
    #[must_use]
    pub fn record_store(&self, policy: RetryPolicy) -> LibSqlRecordStore {
        LibSqlRecordStore::new(self.conn.clone(), policy, Arc::clone(&self.write_gate))
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Move every `syncing` record to `error` and log the transition, atomically
async fn recover_interrupted(conn: &Connection) -> Result<u64> {
    let mut interrupted = Vec::new();
    let mut rows = conn
        .query("SELECT id FROM records WHERE sync_status = 'syncing'", ())
        .await?;
    while let Some(row) = rows.next().await? {
        let id: String = row.get(0)?;
        interrupted.push(id);
    }

    if interrupted.is_empty() {
        return Ok(0);
    }

    let now_ms = Utc::now().timestamp_millis();

    conn.execute("BEGIN TRANSACTION", ()).await?;

    let result = async {
        conn.execute(
            "UPDATE records SET sync_status = 'error' WHERE sync_status = 'syncing'",
            (),
        )
        .await?;

        for id in &interrupted {
            conn.execute(
                "INSERT INTO attempt_log (record_id, action, resulting_status, message, logged_at)
                 VALUES (?, 'crash_recovery', 'error', 'delivery outcome unknown after restart', ?)",
                libsql::params![id.clone(), now_ms],
            )
            .await?;
        }

        Ok::<(), crate::error::Error>(())
    }
    .await;

    match result {
        Ok(()) => {
            conn.execute("COMMIT", ()).await?;
            Ok(interrupted.len() as u64)
        }
        Err(error) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataType, Location, OfflineRecord, SyncStatus};
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_record() -> OfflineRecord {
        OfflineRecord::new(
            DataType::Observation,
            json!({"scientificName": "Tursiops truncatus"}),
            Location::new(-8.8, 13.2),
            "researcher_001",
            "mobile_001",
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().await.unwrap();
        let mut rows = db.connection().query("SELECT 1", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let value: i32 = row.get(0).unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reopen_reclassifies_interrupted_deliveries() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("silt.db");
        let record = sample_record();

        {
            let db = Database::open(&db_path).await.unwrap();
            let store = db.record_store(RetryPolicy::default());
            store.put(&record).await.unwrap();
            store
                .mark(&record.id, SyncStatus::Syncing, "dispatching")
                .await
                .unwrap();
        }

        let db = Database::open(&db_path).await.unwrap();
        let store = db.record_store(RetryPolicy::default());
        let recovered = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(recovered.sync_status, SyncStatus::Error);

        let history = store.attempt_history(&record.id).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.action, "crash_recovery");
        assert_eq!(last.resulting_status, SyncStatus::Error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reopen_leaves_settled_records_alone() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("silt.db");
        let record = sample_record();

        {
            let db = Database::open(&db_path).await.unwrap();
            let store = db.record_store(RetryPolicy::default());
            store.put(&record).await.unwrap();
        }

        let db = Database::open(&db_path).await.unwrap();
        let store = db.record_store(RetryPolicy::default());
        let reloaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(reloaded.sync_status, SyncStatus::Pending);
    }
}
