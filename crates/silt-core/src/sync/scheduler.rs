//! Auto-sync scheduler

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SyncSettings;
use crate::error::Result;

use super::SyncEngine;

/// Periodic sync driver, gated on remote reachability.
///
/// Cycles run strictly one at a time, so the engine's concurrency ceiling
/// is the only source of parallel network use. Unexpected errors are logged
/// and the loop continues after a shorter pause; only cancellation ends it.
pub struct AutoSync {
    engine: SyncEngine,
    batch_size: usize,
    interval: Duration,
    fallback_interval: Duration,
    cancel: CancellationToken,
}

impl AutoSync {
    #[must_use]
    pub fn new(engine: SyncEngine, settings: &SyncSettings, cancel: CancellationToken) -> Self {
        Self {
            engine,
            batch_size: settings.sync_batch_size,
            interval: settings.daemon_interval,
            fallback_interval: settings.fallback_interval,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// Cancellation is observed between cycles: an in-flight batch always
    /// finishes before the loop returns.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "auto-sync scheduler started"
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let pause = match self.run_cycle().await {
                Ok(()) => self.interval,
                Err(err) => {
                    error!(error = %err, "auto-sync cycle failed");
                    self.fallback_interval
                }
            };

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }

        info!("auto-sync scheduler stopped");
    }

    async fn run_cycle(&self) -> Result<()> {
        if !self.engine.transport().probe_health().await {
            debug!("ingestion service unreachable, skipping cycle");
            return Ok(());
        }

        let report = self.engine.sync_batch(self.batch_size).await?;
        if report.total > 0 {
            info!(
                total = report.total,
                success = report.success,
                error = report.error,
                conflict = report.conflict,
                "auto-sync cycle complete"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryPolicy, SyncSettings};
    use crate::db::Database;
    use crate::models::{DataType, Location, OfflineRecord, SyncStatus};
    use crate::sync::testing::{FakeBehavior, FakeTransport};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::sleep;

    fn observation(species: &str) -> OfflineRecord {
        OfflineRecord::new(
            DataType::Observation,
            json!({"scientificName": species}),
            Location::new(-8.8, 13.2),
            "researcher_001",
            "mobile_001",
        )
    }

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            daemon_interval: Duration::from_millis(20),
            fallback_interval: Duration::from_millis(20),
            ..SyncSettings::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn daemon_syncs_once_remote_is_reachable() {
        let db = Database::open_in_memory().await.unwrap();
        let store = db.record_store(RetryPolicy::default());
        let record = observation("Tursiops truncatus");
        store.put(&record).await.unwrap();

        let settings = fast_settings();
        let transport = Arc::new(FakeTransport::new(FakeBehavior::Accept));
        let engine = SyncEngine::new(
            store.clone(),
            Arc::clone(&transport) as Arc<dyn crate::sync::IngestTransport>,
            &settings,
        );

        let cancel = CancellationToken::new();
        let scheduler = AutoSync::new(engine, &settings, cancel.clone());
        let handle = tokio::spawn(scheduler.run());

        sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let synced = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn daemon_skips_cycles_while_unreachable() {
        let db = Database::open_in_memory().await.unwrap();
        let store = db.record_store(RetryPolicy::default());
        let record = observation("Tursiops truncatus");
        store.put(&record).await.unwrap();

        let settings = fast_settings();
        let transport = Arc::new(FakeTransport::new(FakeBehavior::Accept));
        transport.set_healthy(false);
        let engine = SyncEngine::new(
            store.clone(),
            Arc::clone(&transport) as Arc<dyn crate::sync::IngestTransport>,
            &settings,
        );

        let cancel = CancellationToken::new();
        let scheduler = AutoSync::new(engine, &settings, cancel.clone());
        let handle = tokio::spawn(scheduler.run());

        sleep(Duration::from_millis(100)).await;
        let still_pending = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(still_pending.sync_status, SyncStatus::Pending);
        assert!(transport.delivered().is_empty());

        // Connectivity returns; the loop picks the record up on its own
        transport.set_healthy(true);
        sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let synced = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_stops_the_loop_promptly() {
        let db = Database::open_in_memory().await.unwrap();
        let store = db.record_store(RetryPolicy::default());

        let settings = fast_settings();
        let transport = Arc::new(FakeTransport::new(FakeBehavior::Accept));
        let engine = SyncEngine::new(
            store,
            Arc::clone(&transport) as Arc<dyn crate::sync::IngestTransport>,
            &settings,
        );

        let cancel = CancellationToken::new();
        let scheduler = AutoSync::new(engine, &settings, cancel.clone());
        let handle = tokio::spawn(scheduler.run());

        sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop after cancellation")
            .unwrap();
    }
}
