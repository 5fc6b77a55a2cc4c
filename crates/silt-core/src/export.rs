//! GeoJSON export for captured records.
//!
//! The export path is read-only over the store; retention (purging old
//! synced records) lives on the store itself and runs on its own schedule.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::LibSqlRecordStore;
use crate::error::Result;
use crate::models::{OfflineRecord, SyncStatus};

const EXPORT_SOURCE: &str = "silt offline store";
const EXPORT_PAGE_SIZE: usize = 500;

/// A GeoJSON feature collection with an export metadata block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub metadata: ExportMetadata,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub source: String,
    pub exported_at: String,
    pub total_records: u64,
    pub status_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: PointGeometry,
    pub properties: FeatureProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointGeometry {
    #[serde(rename = "type")]
    pub kind: String,
    /// GeoJSON coordinate order: [longitude, latitude]
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureProperties {
    pub id: String,
    pub timestamp: String,
    pub data_type: String,
    pub content: Value,
    pub collector_id: String,
    pub device_id: String,
    pub sync_status: String,
    pub sync_attempts: u32,
    pub last_sync_attempt: Option<String>,
    pub content_hash: String,
}

/// Build a feature collection from records already in memory.
///
/// An empty slice yields an empty collection, never an error.
#[must_use]
pub fn feature_collection(
    records: &[OfflineRecord],
    status_filter: Option<SyncStatus>,
) -> FeatureCollection {
    FeatureCollection {
        kind: "FeatureCollection".to_string(),
        metadata: ExportMetadata {
            source: EXPORT_SOURCE.to_string(),
            exported_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            total_records: records.len() as u64,
            status_filter: status_filter.map(|status| status.as_str().to_string()),
        },
        features: records.iter().map(record_to_feature).collect(),
    }
}

fn record_to_feature(record: &OfflineRecord) -> Feature {
    Feature {
        kind: "Feature".to_string(),
        geometry: PointGeometry {
            kind: "Point".to_string(),
            coordinates: [record.location.longitude, record.location.latitude],
        },
        properties: FeatureProperties {
            id: record.id.to_string(),
            timestamp: record
                .captured_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            data_type: record.data_type.as_str().to_string(),
            content: record.content.clone(),
            collector_id: record.collector_id.clone(),
            device_id: record.device_id.clone(),
            sync_status: record.sync_status.as_str().to_string(),
            sync_attempts: record.sync_attempts,
            last_sync_attempt: record
                .last_sync_attempt
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            content_hash: record.content_hash.clone(),
        },
    }
}

/// Walk the store page by page and build the export collection
pub async fn export_records(
    store: &LibSqlRecordStore,
    status_filter: Option<SyncStatus>,
) -> Result<FeatureCollection> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    loop {
        let page = store
            .list(status_filter, EXPORT_PAGE_SIZE, offset)
            .await?;
        let count = page.len();
        records.extend(page);

        if count < EXPORT_PAGE_SIZE {
            break;
        }
        offset += count;
    }

    Ok(feature_collection(&records, status_filter))
}

/// Render a feature collection as pretty-printed JSON
pub fn render_geojson(collection: &FeatureCollection) -> serde_json::Result<String> {
    serde_json::to_string_pretty(collection)
}
