//! silt-core - Core library for Silt
//!
//! This crate contains the offline record model, the durable local store,
//! the sync engine and scheduler, and the export/retention helpers shared
//! by all Silt interfaces.

pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod models;
pub mod sync;

pub use error::{Error, Result};
pub use models::{DataType, Location, OfflineRecord, RecordId, SyncStatus};
