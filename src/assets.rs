//! Durable download queue for media referenced by synced records.
//!
//! Tasks live in SQLite so they survive restarts. Enqueueing only writes a
//! row and wakes the worker; downloads happen in [`AssetDownloadQueue::process_batch`],
//! driven by [`AssetDownloadQueue::spawn_worker`] or a host scheduler.
use anyhow::Result;
use reqwest::Url;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::{ConcurrencyController, Request};
use crate::db::{self, Pool};
use crate::model::{DownloadTask, NewDownloadTask, QueueCounts};
use crate::store::{AssetStore, LocalId, LocalStore, StoredAsset};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Failed attempts after which a task is marked failed for good.
    pub max_retries: u32,
    pub retry_base: Duration,
    pub max_backoff: Duration,
    /// Processing tasks older than this are assumed orphaned by a crash.
    pub stale_after: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(3600),
            stale_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    /// Distinct source URLs fetched over the network.
    pub downloaded: usize,
    /// Distinct source URLs satisfied by an already stored asset.
    pub reused: usize,
    pub done: usize,
    pub retried: usize,
    pub failed: usize,
    /// Tasks whose outcome could not be written back; they stay in
    /// `processing` until stale recovery hands them out again.
    pub unsettled: usize,
}

/// `5s * 2^attempt`, capped.
pub fn download_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(1u32 << attempt.min(10)).min(cap)
}

/// Source URL without query string or fragment. Hosted file URLs carry
/// short-lived signatures in the query, so two references to the same file
/// differ only there.
pub fn canonical_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .to_string(),
    }
}

/// Last path segment of the canonical URL, used as the stored file name hint.
fn filename_of(canonical: &str) -> String {
    Url::parse(canonical)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "asset".to_string())
}

pub struct AssetDownloadQueue {
    pool: Pool,
    controller: Arc<ConcurrencyController>,
    assets: Arc<dyn AssetStore>,
    records: Arc<dyn LocalStore>,
    options: QueueOptions,
    wake: Notify,
}

impl AssetDownloadQueue {
    pub fn new(
        pool: Pool,
        controller: Arc<ConcurrencyController>,
        assets: Arc<dyn AssetStore>,
        records: Arc<dyn LocalStore>,
        options: QueueOptions,
    ) -> Self {
        Self {
            pool,
            controller,
            assets,
            records,
            options,
            wake: Notify::new(),
        }
    }

    /// Persist a pending task and return its id. Never waits on the download.
    #[instrument(skip_all, fields(target = task.target_local_id))]
    pub async fn enqueue(&self, task: NewDownloadTask) -> Result<i64> {
        let canonical = canonical_url(&task.url);
        let id = db::enqueue_download(&self.pool, &task, &canonical, db::now_ms()).await?;
        debug!(id, url = %canonical, "download enqueued");
        self.wake.notify_one();
        Ok(id)
    }

    /// Pending plus in-flight tasks.
    pub async fn queue_size(&self) -> Result<u64> {
        let counts = self.counts().await?;
        Ok(counts.pending + counts.processing)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        db::count_downloads(&self.pool).await
    }

    pub async fn task(&self, id: i64) -> Result<Option<DownloadTask>> {
        db::fetch_download(&self.pool, id).await
    }

    /// Hand tasks stuck in `processing` for longer than `older_than` back to
    /// the queue.
    pub async fn recover_stale(&self, older_than: Duration) -> Result<u64> {
        let cutoff = db::now_ms() - i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let recovered = db::recover_stale_downloads(&self.pool, cutoff).await?;
        if recovered > 0 {
            warn!(recovered, "recovered stale download tasks");
        }
        Ok(recovered)
    }

    /// Claim up to `limit` due tasks and settle each of them.
    #[instrument(skip_all, fields(limit))]
    pub async fn process_batch(&self, limit: usize) -> Result<BatchReport> {
        let tasks = db::claim_due_downloads(&self.pool, limit, db::now_ms()).await?;
        let mut report = BatchReport {
            claimed: tasks.len(),
            ..Default::default()
        };
        if tasks.is_empty() {
            return Ok(report);
        }

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<DownloadTask>> = HashMap::new();
        for task in tasks {
            let owners = groups.entry(task.canonical_url.clone()).or_default();
            if owners.is_empty() {
                order.push(task.canonical_url.clone());
            }
            owners.push(task);
        }

        let mut resolved: HashMap<String, Result<StoredAsset, String>> = HashMap::new();
        let mut to_fetch: Vec<(String, Request)> = Vec::new();
        for canonical in &order {
            match self.assets.find_by_source_url(canonical).await {
                Ok(Some(asset)) => {
                    report.reused += 1;
                    resolved.insert(canonical.clone(), Ok(asset));
                }
                Ok(None) => {
                    // Download through the first owner's (signed) URL.
                    let source = &groups[canonical][0].url;
                    match Url::parse(source) {
                        Ok(url) => to_fetch.push((canonical.clone(), Request::get(url))),
                        Err(e) => {
                            resolved.insert(canonical.clone(), Err(format!("invalid url: {}", e)));
                        }
                    }
                }
                Err(e) => {
                    resolved.insert(canonical.clone(), Err(format!("{:#}", e)));
                }
            }
        }

        let (canonicals, requests): (Vec<String>, Vec<Request>) = to_fetch.into_iter().unzip();
        let responses = self.controller.submit(requests).await;
        for (canonical, response) in canonicals.into_iter().zip(responses) {
            let outcome = match response {
                Ok(res) => {
                    report.downloaded += 1;
                    self.assets
                        .store(&res.body, &filename_of(&canonical), &canonical)
                        .await
                        .map_err(|e| format!("{:#}", e))
                }
                Err(e) => Err(e.to_string()),
            };
            resolved.insert(canonical, outcome);
        }

        for canonical in order {
            let owners = groups.remove(&canonical).unwrap_or_default();
            let outcome = resolved
                .remove(&canonical)
                .unwrap_or_else(|| Err("unresolved asset".to_string()));
            for task in owners {
                let settled = match &outcome {
                    Ok(asset) => self
                        .records
                        .attach_asset(
                            LocalId(task.target_local_id),
                            &task.url,
                            asset,
                            task.is_primary_asset,
                        )
                        .await
                        .map_err(|e| format!("{:#}", e)),
                    Err(msg) => Err(msg.clone()),
                };
                let written = match settled {
                    Ok(()) => db::complete_download(&self.pool, task.id)
                        .await
                        .map(|_| report.done += 1),
                    Err(msg) => self.reschedule(&task, &msg).await.map(|retried| {
                        if retried {
                            report.retried += 1;
                        } else {
                            report.failed += 1;
                        }
                    }),
                };
                if let Err(err) = written {
                    error!(id = task.id, ?err, "failed to settle download task");
                    report.unsettled += 1;
                }
            }
        }

        info!(
            claimed = report.claimed,
            downloaded = report.downloaded,
            reused = report.reused,
            done = report.done,
            retried = report.retried,
            failed = report.failed,
            unsettled = report.unsettled,
            "download batch settled"
        );
        Ok(report)
    }

    /// Returns true when the task was put back for another attempt.
    async fn reschedule(&self, task: &DownloadTask, message: &str) -> Result<bool> {
        let retry_count = task.retry_count + 1;
        if retry_count < self.options.max_retries {
            let delay = download_backoff(
                task.retry_count,
                self.options.retry_base,
                self.options.max_backoff,
            );
            let due = db::now_ms() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
            warn!(id = task.id, retry_count, ?delay, error = %message, "download failed; backoff");
            db::fail_download(&self.pool, task.id, retry_count, Some(due), message).await?;
            Ok(true)
        } else {
            error!(id = task.id, retry_count, error = %message, "download failed permanently");
            db::fail_download(&self.pool, task.id, retry_count, None, message).await?;
            Ok(false)
        }
    }

    /// Drain due tasks whenever something is enqueued, and at least every
    /// `interval`. Stale `processing` tasks are recovered before each drain.
    pub fn spawn_worker(self: Arc<Self>, interval: Duration, batch_size: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(err) = self.recover_stale(self.options.stale_after).await {
                    error!(?err, "failed to recover stale downloads");
                }
                loop {
                    match self.process_batch(batch_size).await {
                        Ok(report) if report.claimed > 0 => continue,
                        Ok(_) => break,
                        Err(err) => {
                            error!(?err, "download worker error");
                            break;
                        }
                    }
                }
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_strips_query_and_fragment() {
        assert_eq!(
            canonical_url("https://s3.amazonaws.com/bucket/a.png?X-Amz-Signature=abc#frag"),
            "https://s3.amazonaws.com/bucket/a.png"
        );
        assert_eq!(canonical_url("not a url?x=1"), "not a url");
    }

    #[test]
    fn filename_hint() {
        assert_eq!(filename_of("https://s3/bucket/photo.jpg"), "photo.jpg");
        assert_eq!(filename_of("https://s3/"), "asset");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(60);
        assert_eq!(download_backoff(0, base, cap), Duration::from_secs(5));
        assert_eq!(download_backoff(1, base, cap), Duration::from_secs(10));
        assert_eq!(download_backoff(3, base, cap), Duration::from_secs(40));
        assert_eq!(download_backoff(4, base, cap), cap);
        assert_eq!(download_backoff(99, base, cap), cap);
    }
}
