//! Row models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.
use chrono::{DateTime, Utc};

/// A synced record as stored locally.
#[derive(Debug, Clone)]
pub struct RecordRow {
    pub id: i64,
    pub remote_id: String,
    pub database_id: String,
    pub title: Option<String>,
    pub properties: String,
    pub body: String,
    pub last_edited_time: DateTime<Utc>,
    pub last_synced_time: Option<DateTime<Utc>>,
    pub primary_asset_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AssetRow {
    pub id: String,
    pub source_url: String,
    pub filename: String,
    pub path: String,
    pub byte_size: i64,
}

#[derive(Debug, Clone)]
pub struct SyncRunRow {
    pub id: i64,
    pub database_id: String,
    pub total: i64,
    pub failed: i64,
    pub watermark: Option<DateTime<Utc>>,
}
