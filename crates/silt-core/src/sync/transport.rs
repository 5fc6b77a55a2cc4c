//! Delivery transport to the remote ingestion service

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::SyncSettings;
use crate::models::OfflineRecord;

/// Marker sent with every submission so the remote can attribute writes
const SUBMISSION_SOURCE: &str = "silt_offline_sync";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid transport configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Delivery HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Ingestion service unreachable: {0}")]
    Unreachable(String),
}

/// Classified response from one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx: the remote stored the record
    Accepted,
    /// 409: the remote already holds equivalent data
    AlreadyExists,
    /// Any other status; retryable
    Rejected { status: u16, body: String },
}

/// Wire format for one record delivery.
///
/// `content_hash` doubles as the remote's idempotency key, which is what
/// makes redelivery after crash recovery safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSubmission {
    pub id: String,
    pub timestamp: String,
    pub data_type: String,
    pub content: Value,
    pub location: SubmissionLocation,
    pub collector_id: String,
    pub device_id: String,
    pub content_hash: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubmissionLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl RecordSubmission {
    #[must_use]
    pub fn from_record(record: &OfflineRecord) -> Self {
        Self {
            id: record.id.to_string(),
            timestamp: record
                .captured_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            data_type: record.data_type.as_str().to_string(),
            content: record.content.clone(),
            location: SubmissionLocation {
                latitude: record.location.latitude,
                longitude: record.location.longitude,
            },
            collector_id: record.collector_id.clone(),
            device_id: record.device_id.clone(),
            content_hash: record.content_hash.clone(),
            source: SUBMISSION_SOURCE.to_string(),
        }
    }
}

/// Boundary to the remote ingestion collaborator.
///
/// Tests drive the sync engine against instrumented implementations of this
/// trait; production uses [`HttpIngestClient`].
#[async_trait]
pub trait IngestTransport: Send + Sync {
    /// Deliver one record to its routed collection
    async fn deliver(&self, submission: &RecordSubmission)
        -> Result<DeliveryOutcome, TransportError>;

    /// Cheap reachability check gating auto-sync cycles
    async fn probe_health(&self) -> bool;
}

/// HTTP implementation of [`IngestTransport`] with per-data-type routing
#[derive(Clone)]
pub struct HttpIngestClient {
    base_url: String,
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl HttpIngestClient {
    pub fn new(
        base_url: impl Into<String>,
        settings: &SyncSettings,
    ) -> Result<Self, TransportError> {
        let base_url = normalize_endpoint(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            base_url,
            client,
            probe_timeout: settings.probe_timeout,
        })
    }

    fn submission_url(&self, data_type: &str) -> String {
        let route = match data_type {
            "observation" => "/collections/occurrences/items",
            "sample" => "/collections/samples/items",
            "measurement" => "/collections/measurements/items",
            _ => "/collections/data/items",
        };
        format!("{}{route}", self.base_url)
    }
}

#[async_trait]
impl IngestTransport for HttpIngestClient {
    async fn deliver(
        &self,
        submission: &RecordSubmission,
    ) -> Result<DeliveryOutcome, TransportError> {
        let url = self.submission_url(&submission.data_type);
        let response = self.client.post(&url).json(submission).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(DeliveryOutcome::Accepted);
        }
        if status == reqwest::StatusCode::CONFLICT {
            return Ok(DeliveryOutcome::AlreadyExists);
        }

        let body = response.text().await.unwrap_or_default();
        Ok(DeliveryOutcome::Rejected {
            status: status.as_u16(),
            body: compact_text(&body),
        })
    }

    async fn probe_health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!(%error, "health probe failed");
                false
            }
        }
    }
}

fn normalize_endpoint(raw: String) -> Result<String, TransportError> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(TransportError::InvalidConfiguration(
            "endpoint must not be empty".to_string(),
        ));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(TransportError::InvalidConfiguration(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}

/// Truncate response bodies before they land in the attempt log
fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}
