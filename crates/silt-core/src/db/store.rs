//! Record store implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{params, Connection, Row, Value};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::models::{AttemptLogEntry, DataType, Location, OfflineRecord, RecordId, SyncStatus};

const RECORD_COLUMNS: &str = "id, captured_at, data_type, content, latitude, longitude, \
     collector_id, device_id, sync_status, sync_attempts, last_sync_attempt, content_hash";

/// Result of inserting a record into the local queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// A record with the same fingerprint is already queued; the re-capture
    /// is a silent no-op
    Duplicate { existing_id: RecordId },
}

/// Per-status record counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub error: u64,
    pub conflict: u64,
}

/// Per-data-type breakdown
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DataTypeStats {
    pub count: u64,
    pub average_attempts: f64,
}

/// Snapshot of queue health, consumed by external dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub status_counts: StatusCounts,
    pub total_records: u64,
    pub oldest_capture: Option<DateTime<Utc>>,
    pub newest_capture: Option<DateTime<Utc>>,
    pub average_attempts: f64,
    pub by_data_type: BTreeMap<String, DataTypeStats>,
    /// Error records at or above the attempt cap; these are never retried
    /// automatically
    pub needs_attention: u64,
}

/// libSQL-backed store for offline records and their attempt history.
///
/// Clones share the underlying connection and write gate, so a store can be
/// handed to concurrent delivery tasks while multi-statement transactions
/// stay serialized.
#[derive(Clone)]
pub struct LibSqlRecordStore {
    conn: Connection,
    policy: RetryPolicy,
    write_gate: Arc<Mutex<()>>,
}

impl LibSqlRecordStore {
    pub(crate) fn new(conn: Connection, policy: RetryPolicy, write_gate: Arc<Mutex<()>>) -> Self {
        Self {
            conn,
            policy,
            write_gate,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a captured record for delivery.
    ///
    /// A fingerprint collision means the same content was already captured;
    /// the caller gets the existing record's id instead of an error.
    pub async fn put(&self, record: &OfflineRecord) -> Result<PutOutcome> {
        let _guard = self.write_gate.lock().await;
        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        match self.put_inner(record).await {
            Ok(outcome) => match self.conn.execute("COMMIT", ()).await {
                Ok(_) => Ok(outcome),
                Err(e) => {
                    self.conn.execute("ROLLBACK", ()).await.ok();
                    Err(e.into())
                }
            },
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    async fn put_inner(&self, record: &OfflineRecord) -> Result<PutOutcome> {
        let rows = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO records \
                 (id, captured_at, data_type, content, latitude, longitude, \
                  collector_id, device_id, sync_status, sync_attempts, \
                  last_sync_attempt, content_hash, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)",
                params![
                    record.id.to_string(),
                    record.captured_at.timestamp_millis(),
                    record.data_type.as_str().to_string(),
                    serde_json::to_string(&record.content)?,
                    record.location.latitude,
                    record.location.longitude,
                    record.collector_id.clone(),
                    record.device_id.clone(),
                    record.sync_status.as_str(),
                    i64::from(record.sync_attempts),
                    record.content_hash.clone(),
                    Utc::now().timestamp_millis(),
                ],
            )
            .await?;

        if rows == 0 {
            let mut found = self
                .conn
                .query(
                    "SELECT id FROM records WHERE content_hash = ?",
                    params![record.content_hash.clone()],
                )
                .await?;
            let Some(row) = found.next().await? else {
                return Err(Error::Database(
                    "duplicate insert without a matching fingerprint row".to_string(),
                ));
            };
            let raw: String = row.get(0)?;
            let existing_id = raw
                .parse()
                .map_err(|_| Error::Database(format!("invalid record id in store: {raw}")))?;

            tracing::debug!(fingerprint = %record.content_hash, "duplicate capture ignored");
            return Ok(PutOutcome::Duplicate { existing_id });
        }

        self.append_log(&record.id, "capture", record.sync_status, "record captured locally")
            .await?;
        Ok(PutOutcome::Inserted)
    }

    /// Get a record by ID
    pub async fn get(&self, id: &RecordId) -> Result<Option<OfflineRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?"),
                params![id.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Records ready for delivery, oldest capture first.
    ///
    /// Selects `pending` records plus `error` records whose backoff window
    /// has elapsed at `now`. Error records at or above the attempt cap are
    /// never returned; they surface through [`Self::stats`] instead.
    pub async fn list_eligible(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OfflineRecord>> {
        let sql = self.eligibility_sql(limit, now);
        let mut rows = self.conn.query(&sql, ()).await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_record(&row)?);
        }
        Ok(records)
    }

    // The backoff gate is compiled into the predicate so LIMIT applies to
    // eligible rows only. Every embedded value is a locally computed integer.
    fn eligibility_sql(&self, limit: usize, now: DateTime<Utc>) -> String {
        let now_ms = now.timestamp_millis();
        let delays = self.policy.delays();

        let mut arms = String::new();
        for (index, delay) in delays.iter().enumerate().take(delays.len() - 1) {
            let _ = write!(
                arms,
                " WHEN {} THEN {}",
                index + 1,
                now_ms - delay.num_milliseconds()
            );
        }
        let final_threshold = now_ms - delays[delays.len() - 1].num_milliseconds();

        format!(
            "SELECT {RECORD_COLUMNS} FROM records \
             WHERE sync_status = 'pending' \
                OR (sync_status = 'error' \
                    AND sync_attempts < {cap} \
                    AND COALESCE(last_sync_attempt, 0) <= \
                        CASE sync_attempts{arms} ELSE {final_threshold} END) \
             ORDER BY captured_at ASC \
             LIMIT {limit}",
            cap = self.policy.max_attempts(),
        )
    }

    /// Move a record to a new delivery state.
    ///
    /// One transaction covers the status update, the `last_sync_attempt`
    /// stamp, the attempt increment (on the `syncing` transition only), and
    /// the appended log entry; state and log never diverge.
    pub async fn mark(&self, id: &RecordId, new_status: SyncStatus, message: &str) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();

        let _guard = self.write_gate.lock().await;
        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        match self.mark_inner(id, new_status, message, now_ms).await {
            Ok(()) => match self.conn.execute("COMMIT", ()).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    self.conn.execute("ROLLBACK", ()).await.ok();
                    Err(e.into())
                }
            },
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    async fn mark_inner(
        &self,
        id: &RecordId,
        new_status: SyncStatus,
        message: &str,
        now_ms: i64,
    ) -> Result<()> {
        // An attempt starts at the syncing transition; outcome marks must
        // not count a second time.
        let sql = if new_status == SyncStatus::Syncing {
            "UPDATE records \
             SET sync_status = ?, sync_attempts = sync_attempts + 1, last_sync_attempt = ? \
             WHERE id = ?"
        } else {
            "UPDATE records SET sync_status = ?, last_sync_attempt = ? WHERE id = ?"
        };

        let rows = self
            .conn
            .execute(sql, params![new_status.as_str(), now_ms, id.to_string()])
            .await?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }

        let action = match new_status {
            SyncStatus::Syncing => "dispatch",
            SyncStatus::Synced => "delivered",
            SyncStatus::Conflict => "remote_duplicate",
            SyncStatus::Error => "delivery_failed",
            SyncStatus::Pending => "requeue",
        };
        self.append_log(id, action, new_status, message).await
    }

    async fn append_log(
        &self,
        record_id: &RecordId,
        action: &str,
        resulting_status: SyncStatus,
        message: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO attempt_log (record_id, action, resulting_status, message, logged_at) \
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    record_id.to_string(),
                    action,
                    resulting_status.as_str(),
                    message,
                    Utc::now().timestamp_millis(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Queue health counters for dashboards and alerting
    pub async fn stats(&self) -> Result<StoreStatistics> {
        let mut status_counts = StatusCounts::default();
        let mut rows = self
            .conn
            .query(
                "SELECT sync_status, COUNT(*) FROM records GROUP BY sync_status",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count = u64::try_from(row.get::<i64>(1)?).unwrap_or(0);
            match status.parse::<SyncStatus>()? {
                SyncStatus::Pending => status_counts.pending = count,
                SyncStatus::Syncing => status_counts.syncing = count,
                SyncStatus::Synced => status_counts.synced = count,
                SyncStatus::Error => status_counts.error = count,
                SyncStatus::Conflict => status_counts.conflict = count,
            }
        }

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*), MIN(captured_at), MAX(captured_at), AVG(sync_attempts) \
                 FROM records",
                (),
            )
            .await?;
        let (total_records, oldest_capture, newest_capture, average_attempts) =
            match rows.next().await? {
                Some(row) => {
                    let total = u64::try_from(row.get::<i64>(0)?).unwrap_or(0);
                    let oldest = optional_timestamp(row.get_value(1)?)?;
                    let newest = optional_timestamp(row.get_value(2)?)?;
                    let average = optional_real(row.get_value(3)?)?;
                    (total, oldest, newest, average)
                }
                None => (0, None, None, 0.0),
            };

        let mut by_data_type = BTreeMap::new();
        let mut rows = self
            .conn
            .query(
                "SELECT data_type, COUNT(*), AVG(sync_attempts) \
                 FROM records GROUP BY data_type",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            let data_type: String = row.get(0)?;
            let count = u64::try_from(row.get::<i64>(1)?).unwrap_or(0);
            let average_attempts = optional_real(row.get_value(2)?)?;
            by_data_type.insert(
                data_type,
                DataTypeStats {
                    count,
                    average_attempts,
                },
            );
        }

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM records \
                 WHERE sync_status = 'error' AND sync_attempts >= ?",
                params![i64::from(self.policy.max_attempts())],
            )
            .await?;
        let needs_attention = match rows.next().await? {
            Some(row) => u64::try_from(row.get::<i64>(0)?).unwrap_or(0),
            None => 0,
        };

        Ok(StoreStatistics {
            status_counts,
            total_records,
            oldest_capture,
            newest_capture,
            average_attempts,
            by_data_type,
            needs_attention,
        })
    }

    /// Delete synced records captured before the cutoff.
    ///
    /// Attempt logs go with their records through the cascading foreign key,
    /// inside the same transaction. Returns the number of deleted records.
    pub async fn purge_synced_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let _guard = self.write_gate.lock().await;
        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let deleted = match self
            .conn
            .execute(
                "DELETE FROM records WHERE sync_status = 'synced' AND captured_at < ?",
                params![cutoff.timestamp_millis()],
            )
            .await
        {
            Ok(deleted) => deleted,
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
        };

        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        if deleted > 0 {
            tracing::info!(deleted, "purged synced records older than horizon");
        }
        Ok(deleted)
    }

    /// A page of records in capture order, optionally filtered by status.
    ///
    /// Export flows walk pages until a short one comes back.
    pub async fn list(
        &self,
        status_filter: Option<SyncStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OfflineRecord>> {
        let mut rows = match status_filter {
            Some(status) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {RECORD_COLUMNS} FROM records \
                             WHERE sync_status = ? \
                             ORDER BY captured_at ASC LIMIT ? OFFSET ?"
                        ),
                        params![status.as_str(), limit as i64, offset as i64],
                    )
                    .await?
            }
            None => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {RECORD_COLUMNS} FROM records \
                             ORDER BY captured_at ASC LIMIT ? OFFSET ?"
                        ),
                        params![limit as i64, offset as i64],
                    )
                    .await?
            }
        };

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_record(&row)?);
        }
        Ok(records)
    }

    /// Append-only attempt history for one record, oldest entry first
    pub async fn attempt_history(&self, id: &RecordId) -> Result<Vec<AttemptLogEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, record_id, action, resulting_status, message, logged_at \
                 FROM attempt_log WHERE record_id = ? ORDER BY id ASC",
                params![id.to_string()],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let raw_record_id: String = row.get(1)?;
            let status: String = row.get(3)?;
            entries.push(AttemptLogEntry {
                id: row.get(0)?,
                record_id: raw_record_id.parse().map_err(|_| {
                    Error::Database(format!("invalid record id in log: {raw_record_id}"))
                })?,
                action: row.get(2)?,
                resulting_status: status.parse()?,
                message: row.get(4)?,
                logged_at: timestamp_from_ms(row.get(5)?)?,
            });
        }
        Ok(entries)
    }
}

fn timestamp_from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Database(format!("invalid stored timestamp: {ms}")))
}

fn optional_timestamp(value: Value) -> Result<Option<DateTime<Utc>>> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(ms) => timestamp_from_ms(ms).map(Some),
        other => Err(Error::Database(format!(
            "unexpected timestamp value: {other:?}"
        ))),
    }
}

fn optional_real(value: Value) -> Result<f64> {
    match value {
        Value::Null => Ok(0.0),
        Value::Real(average) => Ok(average),
        other => Err(Error::Database(format!(
            "unexpected aggregate value: {other:?}"
        ))),
    }
}

/// Parse a record from a database row
fn parse_record(row: &Row) -> Result<OfflineRecord> {
    let raw_id: String = row.get(0)?;
    let data_type: String = row.get(2)?;
    let content: String = row.get(3)?;
    let status: String = row.get(8)?;
    let attempts: i64 = row.get(9)?;

    let last_sync_attempt = match row.get_value(10)? {
        Value::Null => None,
        Value::Integer(ms) => Some(timestamp_from_ms(ms)?),
        other => {
            return Err(Error::Database(format!(
                "unexpected last_sync_attempt value: {other:?}"
            )))
        }
    };

    Ok(OfflineRecord {
        id: raw_id
            .parse()
            .map_err(|_| Error::Database(format!("invalid record id in store: {raw_id}")))?,
        captured_at: timestamp_from_ms(row.get(1)?)?,
        data_type: DataType::from(data_type),
        content: serde_json::from_str(&content)?,
        location: Location::new(row.get(4)?, row.get(5)?),
        collector_id: row.get(6)?,
        device_id: row.get(7)?,
        sync_status: status.parse()?,
        sync_attempts: u32::try_from(attempts)
            .map_err(|_| Error::Database(format!("invalid attempt count: {attempts}")))?,
        last_sync_attempt,
        content_hash: row.get(11)?,
    })
}
