//! Interfaces to the host application's storage.
//!
//! The sync engine never touches a database directly. The host supplies a
//! [`LocalStore`] for synced records, an [`AssetStore`] for downloaded media and
//! a [`RunStateStore`] for run locks and watermarks. `crate::db::SqliteStore`
//! implements all three.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::model::RunStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub i64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What gets written for one remote record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFields {
    pub remote_id: String,
    pub database_id: String,
    pub title: Option<String>,
    pub properties: Map<String, Value>,
    /// Rendered body.
    pub body: String,
    pub last_edited_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub asset_id: String,
    pub url: String,
}

/// Proof of lock ownership; only the holder can release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub scope: String,
    pub token: String,
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn find_by_remote_id(&self, remote_id: &str) -> Result<Option<LocalId>>;

    /// Insert when `existing` is `None`, otherwise overwrite that record.
    async fn upsert(&self, existing: Option<LocalId>, fields: &RecordFields) -> Result<LocalId>;

    async fn delete(&self, id: LocalId) -> Result<()>;

    /// `last_edited_time` of the remote version last synced into `id`.
    async fn get_watermark(&self, id: LocalId) -> Result<Option<DateTime<Utc>>>;

    async fn set_watermark(&self, id: LocalId, watermark: DateTime<Utc>) -> Result<()>;

    /// `(remote id, local id)` of every record synced from `database_id`.
    async fn tracked_remote_ids(&self, database_id: &str) -> Result<Vec<(String, LocalId)>>;

    /// Point references to `source_url` in the record body at `asset_url`,
    /// and make it the record's primary asset when `primary` is set.
    async fn attach_asset(
        &self,
        id: LocalId,
        source_url: &str,
        asset: &StoredAsset,
        primary: bool,
    ) -> Result<()>;
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Lookup by canonical source URL.
    async fn find_by_source_url(&self, source_url: &str) -> Result<Option<StoredAsset>>;

    async fn store(&self, bytes: &[u8], filename: &str, source_url: &str) -> Result<StoredAsset>;

    async fn url_of(&self, asset_id: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// `None` while another holder's lock on `scope` is younger than its ttl.
    async fn try_acquire_lock(&self, scope: &str, ttl: Duration) -> Result<Option<LockToken>>;

    async fn release_lock(&self, token: &LockToken) -> Result<()>;

    /// Watermark of the last run of `database_id` that finished without failures.
    async fn last_watermark(&self, database_id: &str) -> Result<Option<DateTime<Utc>>>;

    async fn record_run(&self, database_id: &str, stats: &RunStats) -> Result<()>;
}
