//! Silt CLI - offline field data capture and synchronization
//!
//! Capture records while disconnected, then reconcile them with the remote
//! ingestion service once connectivity returns.

use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use silt_core::config::SyncSettings;
use silt_core::db::{Database, LibSqlRecordStore, PutOutcome, StoreStatistics};
use silt_core::export::{export_records, render_geojson};
use silt_core::sync::{AutoSync, HttpIngestClient, SyncEngine, SyncReport, TransportError};
use silt_core::{DataType, Location, OfflineRecord, RecordId, SyncStatus};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "silt")]
#[command(about = "Capture field records offline and sync them when reachable")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to the local database file
    #[arg(long, value_name = "PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Base URL of the remote ingestion service
    #[arg(long, value_name = "URL", global = true)]
    api_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a record into the offline queue
    Capture {
        /// Record category (observation, sample, measurement, ...)
        #[arg(long = "type", value_name = "TYPE")]
        data_type: String,
        /// Latitude in decimal degrees
        #[arg(long)]
        lat: f64,
        /// Longitude in decimal degrees
        #[arg(long)]
        lon: f64,
        /// Collector identifier
        #[arg(long)]
        collector: String,
        /// Device identifier
        #[arg(long)]
        device: String,
        /// JSON payload (stdin when omitted)
        content: Option<String>,
    },
    /// List queued records
    List {
        /// Filter by sync status
        #[arg(long, value_name = "STATUS")]
        status: Option<String>,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queue statistics
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one sync batch against the ingestion service
    Sync {
        /// Records to select for this batch
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Run the auto-sync daemon until interrupted
    Daemon {
        /// Minutes between sync cycles
        #[arg(long, value_name = "MINUTES")]
        interval: Option<u64>,
    },
    /// Export records as GeoJSON
    Export {
        /// Filter by sync status
        #[arg(long, value_name = "STATUS")]
        status: Option<String>,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Delete old synced records and their attempt logs
    Purge {
        /// Age horizon in days (default from settings)
        #[arg(long, value_name = "DAYS")]
        older_than_days: Option<u32>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] silt_core::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No record content provided")]
    EmptyContent,
    #[error("Record content must be a JSON object")]
    ContentNotAnObject,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("silt=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let settings = resolve_settings(cli.api_url);

    match cli.command {
        Commands::Capture {
            data_type,
            lat,
            lon,
            collector,
            device,
            content,
        } => {
            let id = run_capture(
                &data_type,
                Location::new(lat, lon),
                &collector,
                &device,
                content.as_deref(),
                &db_path,
                &settings,
            )
            .await?;
            println!("{id}");
        }
        Commands::List {
            status,
            limit,
            json,
        } => run_list(status.as_deref(), limit, json, &db_path, &settings).await?,
        Commands::Stats { json } => run_stats(json, &db_path, &settings).await?,
        Commands::Sync { limit } => {
            let report = run_sync(limit, &db_path, &settings).await?;
            println!("{}", format_report(&report));
        }
        Commands::Daemon { interval } => run_daemon(interval, &db_path, &settings).await?,
        Commands::Export { status, output } => {
            run_export(status.as_deref(), output.as_deref(), &db_path, &settings).await?;
        }
        Commands::Purge { older_than_days } => {
            let deleted = run_purge(older_than_days, &db_path, &settings).await?;
            println!("Purged {deleted} synced record(s)");
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_capture(
    data_type: &str,
    location: Location,
    collector: &str,
    device: &str,
    content_arg: Option<&str>,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<RecordId, CliError> {
    let raw = resolve_content(content_arg)?;
    let content: serde_json::Value = serde_json::from_str(&raw)?;
    if !content.is_object() {
        return Err(CliError::ContentNotAnObject);
    }

    let record = OfflineRecord::new(
        DataType::from(data_type.to_string()),
        content,
        location,
        collector,
        device,
    );

    let store = open_store(db_path, settings).await?;
    match store.put(&record).await? {
        PutOutcome::Inserted => Ok(record.id),
        PutOutcome::Duplicate { existing_id } => {
            tracing::info!(%existing_id, "identical content already captured");
            Ok(existing_id)
        }
    }
}

async fn run_list(
    status: Option<&str>,
    limit: usize,
    as_json: bool,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let filter = parse_status_filter(status)?;
    let store = open_store(db_path, settings).await?;
    let records = store.list(filter, limit, 0).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run_stats(as_json: bool, db_path: &Path, settings: &SyncSettings) -> Result<(), CliError> {
    let store = open_store(db_path, settings).await?;
    let stats = store.stats().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        for line in format_stats_lines(&stats) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run_sync(
    limit: Option<usize>,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<SyncReport, CliError> {
    let store = open_store(db_path, settings).await?;
    let transport = Arc::new(HttpIngestClient::new(settings.api_base_url.clone(), settings)?);
    let engine = SyncEngine::new(store, transport, settings);

    Ok(engine
        .sync_batch(limit.unwrap_or(settings.sync_batch_size))
        .await?)
}

async fn run_daemon(
    interval_minutes: Option<u64>,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let mut settings = settings.clone();
    if let Some(minutes) = interval_minutes {
        settings.daemon_interval = std::time::Duration::from_secs(minutes * 60);
    }

    let store = open_store(db_path, &settings).await?;
    let transport = Arc::new(HttpIngestClient::new(
        settings.api_base_url.clone(),
        &settings,
    )?);
    let engine = SyncEngine::new(store, transport, &settings);

    let cancel = CancellationToken::new();
    let scheduler = AutoSync::new(engine, &settings, cancel.clone());
    let handle = tokio::spawn(scheduler.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, finishing in-flight work");
    cancel.cancel();
    handle.await.map_err(|error| {
        CliError::Io(io::Error::other(format!("scheduler task failed: {error}")))
    })?;

    Ok(())
}

async fn run_export(
    status: Option<&str>,
    output_path: Option<&Path>,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let filter = parse_status_filter(status)?;
    let store = open_store(db_path, settings).await?;

    let collection = export_records(&store, filter).await?;
    let rendered = render_geojson(&collection)?;

    if let Some(path) = output_path {
        std::fs::write(path, rendered)?;
        println!("{}", path.display());
    } else {
        println!("{rendered}");
    }
    Ok(())
}

async fn run_purge(
    older_than_days: Option<u32>,
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<u64, CliError> {
    let days = older_than_days.unwrap_or(settings.retention_horizon_days);
    let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));

    let store = open_store(db_path, settings).await?;
    Ok(store.purge_synced_older_than(cutoff).await?)
}

async fn open_store(
    db_path: &Path,
    settings: &SyncSettings,
) -> Result<LibSqlRecordStore, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::open(db_path).await?;
    Ok(db.record_store(settings.retry_policy()))
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("SILT_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("silt")
        .join("silt.db")
}

fn resolve_settings(api_url: Option<String>) -> SyncSettings {
    let mut settings = SyncSettings::default();
    if let Some(url) = api_url.or_else(|| env::var("SILT_API_URL").ok()) {
        settings.api_base_url = url;
    }
    settings
}

fn parse_status_filter(status: Option<&str>) -> Result<Option<SyncStatus>, CliError> {
    status
        .map(|value| value.parse::<SyncStatus>().map_err(CliError::Core))
        .transpose()
}

fn resolve_content(content_arg: Option<&str>) -> Result<String, CliError> {
    if let Some(content) = content_arg.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok(content.to_string());
    }

    if let Some(content) = read_piped_stdin()? {
        return Ok(content);
    }

    Err(CliError::EmptyContent)
}

fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    let trimmed = buffer.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

fn format_report(report: &SyncReport) -> String {
    format!(
        "Selected {} record(s): {} synced, {} failed, {} conflicted",
        report.total, report.success, report.error, report.conflict
    )
}

fn format_record_lines(records: &[OfflineRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let id = record.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let relative_time =
                format_relative_time(record.captured_at.timestamp_millis(), now_ms);
            format!(
                "{short_id:<13}  {:<12}  {:<8}  attempts {}  {relative_time}",
                record.data_type.as_str(),
                record.sync_status.as_str(),
                record.sync_attempts,
            )
        })
        .collect()
}

fn format_stats_lines(stats: &StoreStatistics) -> Vec<String> {
    let counts = &stats.status_counts;
    let mut lines = vec![
        format!("Total records:    {}", stats.total_records),
        format!(
            "By status:        pending {} / syncing {} / synced {} / error {} / conflict {}",
            counts.pending, counts.syncing, counts.synced, counts.error, counts.conflict
        ),
        format!("Average attempts: {:.2}", stats.average_attempts),
        format!("Needs attention:  {}", stats.needs_attention),
    ];
    for (data_type, type_stats) in &stats.by_data_type {
        lines.push(format!(
            "  {data_type}: {} record(s), {:.2} avg attempts",
            type_stats.count, type_stats.average_attempts
        ));
    }
    lines
}

fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use silt_core::config::SyncSettings;
    use silt_core::db::Database;
    use silt_core::{DataType, Location, OfflineRecord, SyncStatus};

    use super::{
        format_record_lines, format_relative_time, format_report, parse_status_filter,
        resolve_content, run_capture, run_export, run_purge, CliError,
    };

    fn unique_test_db_path() -> PathBuf {
        static NEXT_TEST_DB_ID: AtomicU64 = AtomicU64::new(0);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_nanos());
        let sequence = NEXT_TEST_DB_ID.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("silt-cli-test-{timestamp}-{sequence}.db"))
    }

    fn cleanup_db_files(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
    }

    #[test]
    fn resolve_content_trims_and_rejects_empty() {
        assert_eq!(
            resolve_content(Some("  {\"a\": 1}  ")).unwrap(),
            "{\"a\": 1}"
        );
        assert!(matches!(
            resolve_content(Some("   ")),
            Err(CliError::EmptyContent)
        ));
    }

    #[test]
    fn parse_status_filter_accepts_known_statuses() {
        assert_eq!(
            parse_status_filter(Some("synced")).unwrap(),
            Some(SyncStatus::Synced)
        );
        assert_eq!(parse_status_filter(None).unwrap(), None);
        assert!(parse_status_filter(Some("bogus")).is_err());
    }

    #[test]
    fn format_report_counts_all_outcomes() {
        let report = silt_core::sync::SyncReport {
            total: 4,
            success: 2,
            error: 1,
            conflict: 1,
        };
        assert_eq!(
            format_report(&report),
            "Selected 4 record(s): 2 synced, 1 failed, 1 conflicted"
        );
    }

    #[test]
    fn format_relative_time_units() {
        let now = 10_000_000;
        assert_eq!(format_relative_time(now - 30_000, now), "just now");
        assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
        assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    }

    #[test]
    fn format_record_lines_shows_status_and_attempts() {
        let record = OfflineRecord::new(
            DataType::Observation,
            json!({"scientificName": "Tursiops truncatus"}),
            Location::new(-8.8, 13.2),
            "researcher_001",
            "mobile_001",
        );

        let lines = format_record_lines(std::slice::from_ref(&record));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("observation"));
        assert!(lines[0].contains("pending"));
        assert!(lines[0].contains("attempts 0"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_capture_persists_pending_records() {
        let db_path = unique_test_db_path();
        let settings = SyncSettings::default();

        let first = run_capture(
            "observation",
            Location::new(-8.8, 13.2),
            "researcher_001",
            "mobile_001",
            Some(r#"{"scientificName": "Tursiops truncatus"}"#),
            &db_path,
            &settings,
        )
        .await
        .unwrap();

        let second = run_capture(
            "sample",
            Location::new(-8.9, 13.1),
            "researcher_001",
            "mobile_001",
            Some(r#"{"label": "sediment core"}"#),
            &db_path,
            &settings,
        )
        .await
        .unwrap();
        assert_ne!(first, second);

        let db = Database::open(&db_path).await.unwrap();
        let store = db.record_store(settings.retry_policy());
        let captured = store.get(&first).await.unwrap().unwrap();
        assert_eq!(captured.sync_status, SyncStatus::Pending);
        assert_eq!(captured.data_type, DataType::Observation);
        drop(db);

        cleanup_db_files(&db_path);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_capture_rejects_non_object_payloads() {
        let db_path = unique_test_db_path();
        let settings = SyncSettings::default();

        let error = run_capture(
            "observation",
            Location::new(-8.8, 13.2),
            "researcher_001",
            "mobile_001",
            Some("[1, 2, 3]"),
            &db_path,
            &settings,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, CliError::ContentNotAnObject));

        cleanup_db_files(&db_path);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_export_writes_geojson_file() {
        let db_path = unique_test_db_path();
        let settings = SyncSettings::default();

        run_capture(
            "observation",
            Location::new(-8.8, 13.2),
            "researcher_001",
            "mobile_001",
            Some(r#"{"scientificName": "Tursiops truncatus"}"#),
            &db_path,
            &settings,
        )
        .await
        .unwrap();

        let output_path = std::env::temp_dir().join(format!(
            "silt-export-test-{}.geojson",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |duration| duration.as_nanos())
        ));

        run_export(None, Some(&output_path), &db_path, &settings)
            .await
            .unwrap();

        let exported = std::fs::read_to_string(&output_path).unwrap();
        assert!(exported.contains("\"FeatureCollection\""));
        assert!(exported.contains("Tursiops truncatus"));

        let _ = std::fs::remove_file(output_path);
        cleanup_db_files(&db_path);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_purge_honors_the_horizon() {
        let db_path = unique_test_db_path();
        let settings = SyncSettings::default();

        {
            let db = Database::open(&db_path).await.unwrap();
            let store = db.record_store(settings.retry_policy());

            let mut stale = OfflineRecord::new(
                DataType::Observation,
                json!({"scientificName": "Tursiops truncatus"}),
                Location::new(-8.8, 13.2),
                "researcher_001",
                "mobile_001",
            );
            stale.captured_at = Utc::now() - ChronoDuration::days(40);
            store.put(&stale).await.unwrap();
            store
                .mark(&stale.id, SyncStatus::Syncing, "dispatching")
                .await
                .unwrap();
            store
                .mark(&stale.id, SyncStatus::Synced, "accepted")
                .await
                .unwrap();
        }

        let deleted = run_purge(Some(30), &db_path, &settings).await.unwrap();
        assert_eq!(deleted, 1);

        let deleted_again = run_purge(Some(30), &db_path, &settings).await.unwrap();
        assert_eq!(deleted_again, 0);

        cleanup_db_files(&db_path);
    }
}
