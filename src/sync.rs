//! One sync run of a remote database into the local store.
//!
//! A run moves through `Locked -> Listing -> Importing -> Reconciling -> Done`
//! (or `Failed`). The run lock is taken before anything else and released on
//! every exit path; per-record failures are counted and never end the run.
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::assets::AssetDownloadQueue;
use crate::error::SyncError;
use crate::fetch::{BlockTree, FetchClient, RecordFilter, DEFAULT_MAX_DEPTH};
use crate::model::{NewDownloadTask, RunStats};
use crate::notion::model::RemoteRecord;
use crate::notion::normalize_id;
use crate::render::ContentRenderer;
use crate::store::{LocalId, LocalStore, RecordFields, RunStateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Locked,
    Listing,
    Importing,
    Reconciling,
    Done,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Locked => "locked",
            RunPhase::Listing => "listing",
            RunPhase::Importing => "importing",
            RunPhase::Reconciling => "reconciling",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Only list records edited after the last clean run, and skip records
    /// whose local watermark is already current.
    pub incremental: bool,
    /// Delete local records missing from a full listing.
    pub check_deletions: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            incremental: true,
            check_deletions: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub lock_ttl: Duration,
    pub max_depth: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(1800),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Imported {
    Created,
    Updated,
    Skipped,
}

pub struct SyncCoordinator {
    fetch: Arc<FetchClient>,
    records: Arc<dyn LocalStore>,
    run_state: Arc<dyn RunStateStore>,
    renderer: Arc<dyn ContentRenderer>,
    queue: Arc<AssetDownloadQueue>,
    options: SyncOptions,
}

impl SyncCoordinator {
    pub fn new(
        fetch: Arc<FetchClient>,
        records: Arc<dyn LocalStore>,
        run_state: Arc<dyn RunStateStore>,
        renderer: Arc<dyn ContentRenderer>,
        queue: Arc<AssetDownloadQueue>,
        options: SyncOptions,
    ) -> Self {
        Self {
            fetch,
            records,
            run_state,
            renderer,
            queue,
            options,
        }
    }

    /// Sync `database_id`. Returns [`SyncError::AlreadyRunning`] without doing
    /// any work while another run holds the lock for the same database.
    #[instrument(skip_all, fields(database_id = %database_id))]
    pub async fn run(&self, database_id: &str, opts: RunOptions) -> Result<RunStats, SyncError> {
        let database_id = normalize_id(database_id).unwrap_or_else(|| database_id.to_string());
        let Some(lock) = self
            .run_state
            .try_acquire_lock(&database_id, self.options.lock_ttl)
            .await?
        else {
            info!("sync already in progress; skipping");
            return Err(SyncError::AlreadyRunning { database_id });
        };
        debug!(phase = RunPhase::Locked.as_str(), "lock acquired");

        let outcome = self.run_locked(&database_id, opts).await;

        if let Err(err) = self.run_state.release_lock(&lock).await {
            warn!(?err, "failed to release sync lock; it will expire after its ttl");
        }
        let phase = if outcome.is_ok() {
            RunPhase::Done
        } else {
            RunPhase::Failed
        };
        debug!(phase = phase.as_str(), "lock released");
        outcome
    }

    async fn run_locked(&self, database_id: &str, opts: RunOptions) -> Result<RunStats, SyncError> {
        let mut stats = RunStats {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let previous = if opts.incremental {
            self.run_state.last_watermark(database_id).await?
        } else {
            None
        };
        let filter = previous.map(RecordFilter::EditedAfter);

        debug!(phase = RunPhase::Listing.as_str(), incremental = filter.is_some());
        self.fetch.invalidate(database_id);
        let listed = self
            .fetch
            .list_records(database_id, filter.as_ref())
            .await
            .map_err(|source| {
                warn!(error = %source, "listing failed; aborting run");
                SyncError::Listing {
                    database_id: database_id.to_string(),
                    source,
                }
            })?;
        stats.total = listed.len() as u64;
        stats.watermark = listed
            .iter()
            .map(|r| r.last_edited_time)
            .chain(previous)
            .max();

        debug!(phase = RunPhase::Importing.as_str(), total = stats.total);
        for record in &listed {
            match self.import_record(database_id, record, opts.incremental).await {
                Ok(Imported::Created) => stats.created += 1,
                Ok(Imported::Updated) => stats.updated += 1,
                Ok(Imported::Skipped) => stats.skipped += 1,
                Err(message) => {
                    warn!(record_id = %record.id, error = %message, "record import failed");
                    stats.record_failure(format!("{}: {}", record.id, message));
                }
            }
        }

        if opts.check_deletions {
            if filter.is_some() {
                debug!("filtered listing; deletion check skipped");
            } else {
                debug!(phase = RunPhase::Reconciling.as_str());
                self.reconcile(database_id, &listed, &mut stats).await;
            }
        }

        stats.finished_at = Some(Utc::now());
        if let Err(err) = self.run_state.record_run(database_id, &stats).await {
            warn!(?err, "failed to record run");
        }
        info!(
            total = stats.total,
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            deleted = stats.deleted,
            failed = stats.failed,
            "sync run finished"
        );
        Ok(stats)
    }

    async fn import_record(
        &self,
        database_id: &str,
        record: &RemoteRecord,
        incremental: bool,
    ) -> Result<Imported, String> {
        let existing = self
            .records
            .find_by_remote_id(&record.id)
            .await
            .map_err(|e| format!("{:#}", e))?;

        if let (true, Some(local)) = (incremental, existing) {
            let watermark = self
                .records
                .get_watermark(local)
                .await
                .map_err(|e| format!("{:#}", e))?;
            if is_current(watermark, record.last_edited_time) {
                return Ok(Imported::Skipped);
            }
        }

        let tree = if record.has_children {
            self.fetch.invalidate(&record.id);
            self.fetch
                .get_block_tree(&record.id, self.options.max_depth)
                .await
                .map_err(|e| format!("block fetch failed: {}", e))?
        } else {
            BlockTree::default()
        };
        if let Some((block_id, err)) = tree.failures.first() {
            return Err(format!(
                "{} branch(es) failed, first under {}: {}",
                tree.failures.len(),
                block_id,
                err
            ));
        }

        let document = self.renderer.render(&tree.blocks);
        let fields = RecordFields {
            remote_id: record.id.clone(),
            database_id: database_id.to_string(),
            title: record.title(),
            properties: record.properties.clone(),
            body: document.body,
            last_edited_time: record.last_edited_time,
        };
        let local = self
            .records
            .upsert(existing, &fields)
            .await
            .map_err(|e| format!("{:#}", e))?;

        self.enqueue_media(local, record, &tree)
            .await
            .map_err(|e| format!("{:#}", e))?;

        self.records
            .set_watermark(local, record.last_edited_time)
            .await
            .map_err(|e| format!("{:#}", e))?;

        Ok(if existing.is_some() {
            Imported::Updated
        } else {
            Imported::Created
        })
    }

    async fn enqueue_media(
        &self,
        local: LocalId,
        record: &RemoteRecord,
        tree: &BlockTree,
    ) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        if let Some(cover) = record.hosted_cover_url() {
            seen.insert(cover.to_string());
            tasks.push(NewDownloadTask {
                url: cover.to_string(),
                target_local_id: local.0,
                is_primary_asset: true,
            });
        }
        tree.walk(&mut |block| {
            if let Some(url) = block.hosted_media_url() {
                if seen.insert(url.to_string()) {
                    tasks.push(NewDownloadTask {
                        url: url.to_string(),
                        target_local_id: local.0,
                        is_primary_asset: false,
                    });
                }
            }
        });
        for task in tasks {
            self.queue.enqueue(task).await?;
        }
        Ok(())
    }

    async fn reconcile(&self, database_id: &str, listed: &[RemoteRecord], stats: &mut RunStats) {
        let present: HashSet<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        let tracked = match self.records.tracked_remote_ids(database_id).await {
            Ok(tracked) => tracked,
            Err(err) => {
                warn!(?err, "could not load tracked records; deletion check skipped");
                stats.errors.push(format!("reconcile: {:#}", err));
                return;
            }
        };
        for (remote_id, local) in tracked {
            if present.contains(remote_id.as_str()) {
                continue;
            }
            match self.records.delete(local).await {
                Ok(()) => {
                    debug!(remote_id = %remote_id, local_id = %local, "deleted record missing remotely");
                    stats.deleted += 1;
                }
                Err(err) => {
                    warn!(remote_id = %remote_id, ?err, "failed to delete record");
                    stats.errors.push(format!("{}: delete failed: {:#}", remote_id, err));
                }
            }
        }
    }
}

/// Equal timestamps mean unchanged; only a strictly newer remote edit counts.
fn is_current(local: Option<DateTime<Utc>>, remote: DateTime<Utc>) -> bool {
    matches!(local, Some(local) if remote <= local)
}
