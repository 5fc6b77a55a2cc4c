//! Database layer for Silt

mod connection;
mod migrations;
mod store;

pub use connection::Database;
pub use store::{
    DataTypeStats, LibSqlRecordStore, PutOutcome, StatusCounts, StoreStatistics,
};
