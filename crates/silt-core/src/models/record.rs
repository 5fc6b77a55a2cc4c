//! Offline record model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

use super::fingerprint::content_fingerprint;

/// A unique identifier for an offline record, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Category of a captured record, used for remote routing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    Observation,
    Sample,
    Measurement,
    /// Any category without a dedicated remote collection
    Other(String),
}

impl DataType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Observation => "observation",
            Self::Sample => "sample",
            Self::Measurement => "measurement",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for DataType {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "observation" => Self::Observation,
            "sample" => Self::Sample,
            "measurement" => Self::Measurement,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for DataType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery state of a record in the local queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Error,
    Conflict,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
            Self::Conflict => "conflict",
        }
    }

    /// Terminal states are never selected for delivery again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Synced | Self::Conflict)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "error" => Ok(Self::Error),
            "conflict" => Ok(Self::Conflict),
            other => Err(Error::InvalidInput(format!("unknown sync status: {other}"))),
        }
    }
}

/// Capture position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// A field record captured while offline, queued for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineRecord {
    /// Unique identifier, assigned at capture
    pub id: RecordId,
    /// Capture time (client clock)
    pub captured_at: DateTime<Utc>,
    /// Category, drives remote routing
    pub data_type: DataType,
    /// Structured payload
    pub content: Value,
    /// Capture position
    pub location: Location,
    /// Who captured the record
    pub collector_id: String,
    /// Device the record was captured on
    pub device_id: String,
    /// Delivery state
    pub sync_status: SyncStatus,
    /// Number of delivery attempts so far
    pub sync_attempts: u32,
    /// When the last delivery attempt was made
    pub last_sync_attempt: Option<DateTime<Utc>>,
    /// Deduplication fingerprint over (captured_at, data_type, content, location)
    pub content_hash: String,
}

impl OfflineRecord {
    /// Create a new record queued for delivery
    #[must_use]
    pub fn new(
        data_type: DataType,
        content: Value,
        location: Location,
        collector_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        // Millisecond precision end to end: the store persists Unix
        // milliseconds, and the fingerprint input must survive a round trip.
        let captured_at = DateTime::from_timestamp_millis(Utc::now().timestamp_millis())
            .unwrap_or_else(Utc::now);
        let content_hash = content_fingerprint(captured_at, &data_type, &content, location);

        Self {
            id: RecordId::new(),
            captured_at,
            data_type,
            content,
            location,
            collector_id: collector_id.into(),
            device_id: device_id.into(),
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            last_sync_attempt: None,
            content_hash,
        }
    }
}

/// One entry in a record's append-only attempt history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptLogEntry {
    pub id: i64,
    pub record_id: RecordId,
    pub action: String,
    pub resulting_status: SyncStatus,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}
