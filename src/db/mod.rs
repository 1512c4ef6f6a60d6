//! SQLite-backed store: entity models, SQL repositories and the
//! [`SqliteStore`] adapter implementing the `crate::store` traits.
//!
//! - `model`: row structs returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.

pub mod model;
pub mod repo;

pub use repo::*;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::model::RunStats;
use crate::store::{
    AssetStore, LocalId, LocalStore, LockToken, RecordFields, RunStateStore, StoredAsset,
};
use model::AssetRow;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
    media_dir: PathBuf,
    url_prefix: String,
}

impl SqliteStore {
    pub fn new(pool: Pool, media_dir: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            media_dir: media_dir.into(),
            url_prefix: url_prefix.into(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    fn public_url(&self, asset: &AssetRow) -> String {
        format!("{}/{}", self.url_prefix.trim_end_matches('/'), asset.path)
    }

    fn stored(&self, asset: &AssetRow) -> StoredAsset {
        StoredAsset {
            asset_id: asset.id.clone(),
            url: self.public_url(asset),
        }
    }
}

/// Extension of `filename`, if it looks like one.
fn extension(filename: &str) -> Option<&str> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ok = !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then_some(ext)
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn find_by_remote_id(&self, remote_id: &str) -> Result<Option<LocalId>> {
        Ok(find_record_id(&self.pool, remote_id).await?.map(LocalId))
    }

    async fn upsert(&self, existing: Option<LocalId>, fields: &RecordFields) -> Result<LocalId> {
        let id = upsert_record(&self.pool, existing.map(|l| l.0), fields).await?;
        Ok(LocalId(id))
    }

    async fn delete(&self, id: LocalId) -> Result<()> {
        delete_record(&self.pool, id.0).await
    }

    async fn get_watermark(&self, id: LocalId) -> Result<Option<DateTime<Utc>>> {
        get_record_watermark(&self.pool, id.0).await
    }

    async fn set_watermark(&self, id: LocalId, watermark: DateTime<Utc>) -> Result<()> {
        set_record_watermark(&self.pool, id.0, watermark).await
    }

    async fn tracked_remote_ids(&self, database_id: &str) -> Result<Vec<(String, LocalId)>> {
        Ok(tracked_records(&self.pool, database_id)
            .await?
            .into_iter()
            .map(|(remote, id)| (remote, LocalId(id)))
            .collect())
    }

    async fn attach_asset(
        &self,
        id: LocalId,
        source_url: &str,
        asset: &StoredAsset,
        primary: bool,
    ) -> Result<()> {
        repo::attach_asset(&self.pool, id.0, source_url, &asset.asset_id, &asset.url, primary).await
    }
}

#[async_trait]
impl AssetStore for SqliteStore {
    async fn find_by_source_url(&self, source_url: &str) -> Result<Option<StoredAsset>> {
        Ok(find_asset_by_source_url(&self.pool, source_url)
            .await?
            .map(|a| self.stored(&a)))
    }

    #[instrument(skip_all, fields(source_url = %source_url))]
    async fn store(&self, bytes: &[u8], filename: &str, source_url: &str) -> Result<StoredAsset> {
        let id = Uuid::new_v4().to_string();
        let file_name = match extension(filename) {
            Some(ext) => format!("{}.{}", id, ext.to_ascii_lowercase()),
            None => id.clone(),
        };
        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .with_context(|| format!("failed to create {}", self.media_dir.display()))?;
        let path = self.media_dir.join(&file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        let row = insert_asset(
            &self.pool,
            &AssetRow {
                id: id.clone(),
                source_url: source_url.to_string(),
                filename: filename.to_string(),
                path: file_name,
                byte_size: bytes.len() as i64,
            },
        )
        .await?;
        if row.id != id {
            // Lost a race with another writer; keep theirs.
            let _ = tokio::fs::remove_file(&path).await;
            debug!(asset_id = %row.id, "asset already stored");
        }
        Ok(self.stored(&row))
    }

    async fn url_of(&self, asset_id: &str) -> Result<Option<String>> {
        Ok(find_asset(&self.pool, asset_id)
            .await?
            .map(|a| self.public_url(&a)))
    }
}

#[async_trait]
impl RunStateStore for SqliteStore {
    async fn try_acquire_lock(&self, scope: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = Uuid::new_v4().to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let acquired = repo::try_acquire_lock(&self.pool, scope, &token, now_ms(), ttl_ms).await?;
        Ok(acquired.then(|| LockToken {
            scope: scope.to_string(),
            token,
        }))
    }

    async fn release_lock(&self, token: &LockToken) -> Result<()> {
        if !repo::release_lock(&self.pool, &token.scope, &token.token).await? {
            debug!(scope = %token.scope, "lock was already released or taken over");
        }
        Ok(())
    }

    async fn last_watermark(&self, database_id: &str) -> Result<Option<DateTime<Utc>>> {
        last_clean_watermark(&self.pool, database_id).await
    }

    async fn record_run(&self, database_id: &str, stats: &RunStats) -> Result<()> {
        insert_sync_run(&self.pool, database_id, stats).await?;
        Ok(())
    }
}
