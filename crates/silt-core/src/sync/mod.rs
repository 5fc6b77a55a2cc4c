//! Sync engine: bounded-concurrency delivery of eligible records

pub mod scheduler;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

pub use scheduler::AutoSync;
pub use transport::{
    DeliveryOutcome, HttpIngestClient, IngestTransport, RecordSubmission, SubmissionLocation,
    TransportError,
};

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::SyncSettings;
use crate::db::LibSqlRecordStore;
use crate::error::Result;
use crate::models::{OfflineRecord, SyncStatus};

/// Outcome counters for one sync batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub conflict: u64,
}

enum DeliveryResult {
    Synced,
    Conflict,
    Errored,
}

/// Delivers eligible records to the remote ingestion service.
///
/// Selection is oldest-first; dispatch runs under a fixed-size permit pool
/// so the ceiling holds regardless of batch size. One delivery's failure
/// never aborts its siblings.
pub struct SyncEngine {
    store: LibSqlRecordStore,
    transport: Arc<dyn IngestTransport>,
    concurrency_ceiling: usize,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        store: LibSqlRecordStore,
        transport: Arc<dyn IngestTransport>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            store,
            transport,
            concurrency_ceiling: settings.concurrency_ceiling.max(1),
        }
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn IngestTransport> {
        Arc::clone(&self.transport)
    }

    /// Deliver up to `max_records` eligible records and classify outcomes
    pub async fn sync_batch(&self, max_records: usize) -> Result<SyncReport> {
        let eligible = self.store.list_eligible(max_records, Utc::now()).await?;
        if eligible.is_empty() {
            return Ok(SyncReport::default());
        }

        let mut report = SyncReport {
            total: eligible.len() as u64,
            ..SyncReport::default()
        };

        let permits = Arc::new(Semaphore::new(self.concurrency_ceiling));
        let mut deliveries = JoinSet::new();
        for record in eligible {
            let store = self.store.clone();
            let transport = Arc::clone(&self.transport);
            let permits = Arc::clone(&permits);

            deliveries.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(error) => {
                        tracing::error!(%error, "permit pool closed before dispatch");
                        return DeliveryResult::Errored;
                    }
                };
                deliver_record(&store, transport.as_ref(), record).await
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok(DeliveryResult::Synced) => report.success += 1,
                Ok(DeliveryResult::Conflict) => report.conflict += 1,
                Ok(DeliveryResult::Errored) => report.error += 1,
                Err(error) => {
                    tracing::error!(%error, "delivery task failed to join");
                    report.error += 1;
                }
            }
        }

        tracing::info!(
            total = report.total,
            success = report.success,
            error = report.error,
            conflict = report.conflict,
            "sync batch complete"
        );
        Ok(report)
    }
}

/// Mark, deliver, and classify one record.
///
/// The `syncing` mark lands transactionally before the network call, so a
/// crash between the two leaves a recoverable marker rather than a silent
/// double-send.
async fn deliver_record(
    store: &LibSqlRecordStore,
    transport: &dyn IngestTransport,
    record: OfflineRecord,
) -> DeliveryResult {
    if let Err(error) = store
        .mark(&record.id, SyncStatus::Syncing, "dispatching to ingestion service")
        .await
    {
        tracing::warn!(record_id = %record.id, %error, "failed to mark record in flight");
        return DeliveryResult::Errored;
    }

    let submission = RecordSubmission::from_record(&record);
    let (status, message, result) = match transport.deliver(&submission).await {
        Ok(DeliveryOutcome::Accepted) => (
            SyncStatus::Synced,
            "accepted by ingestion service".to_string(),
            DeliveryResult::Synced,
        ),
        Ok(DeliveryOutcome::AlreadyExists) => (
            SyncStatus::Conflict,
            "remote already holds equivalent data".to_string(),
            DeliveryResult::Conflict,
        ),
        Ok(DeliveryOutcome::Rejected { status, body }) => (
            SyncStatus::Error,
            format!("HTTP {status}: {body}"),
            DeliveryResult::Errored,
        ),
        Err(error) => (
            SyncStatus::Error,
            format!("transport failure: {error}"),
            DeliveryResult::Errored,
        ),
    };

    if let Err(error) = store.mark(&record.id, status, &message).await {
        tracing::error!(record_id = %record.id, %error, "failed to record delivery outcome");
        return DeliveryResult::Errored;
    }
    result
}
