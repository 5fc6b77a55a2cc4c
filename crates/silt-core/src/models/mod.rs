//! Domain models for offline field records

mod fingerprint;
mod record;

pub use fingerprint::{canonical_json, content_fingerprint};
pub use record::{AttemptLogEntry, DataType, Location, OfflineRecord, RecordId, SyncStatus};
