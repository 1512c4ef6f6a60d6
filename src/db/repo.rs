use super::model::{AssetRow, RecordRow, SyncRunRow};
use crate::model::{DownloadStatus, DownloadTask, NewDownloadTask, QueueCounts, RunStats};
use crate::store::RecordFields;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

const TASK_COLUMNS: &str = "id, url, canonical_url, target_local_id, is_primary, retry_count, status, due_at_ms, last_error";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs, create the parent
/// directory and ask SQLite to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

// ---------------------------------------------------------------------------
// records

#[instrument(skip_all)]
pub async fn find_record_id(pool: &Pool, remote_id: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM records WHERE remote_id = ?")
        .bind(remote_id)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn fetch_record(pool: &Pool, id: i64) -> Result<Option<RecordRow>> {
    let row = sqlx::query(
        "SELECT id, remote_id, database_id, title, properties, body, last_edited_time, \
         last_synced_time, primary_asset_id FROM records WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| RecordRow {
        id: r.get("id"),
        remote_id: r.get("remote_id"),
        database_id: r.get("database_id"),
        title: r.get("title"),
        properties: r.get("properties"),
        body: r.get("body"),
        last_edited_time: r.get("last_edited_time"),
        last_synced_time: r.get("last_synced_time"),
        primary_asset_id: r.get("primary_asset_id"),
    }))
}

/// Insert a record, or overwrite `existing`. The sync watermark is left alone;
/// it only moves once the whole record has been processed.
#[instrument(skip_all)]
pub async fn upsert_record(pool: &Pool, existing: Option<i64>, fields: &RecordFields) -> Result<i64> {
    let properties = serde_json::to_string(&fields.properties)?;
    match existing {
        Some(id) => {
            let res = sqlx::query(
                "UPDATE records SET remote_id = ?, database_id = ?, title = ?, properties = ?, body = ?, \
                 last_edited_time = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(&fields.remote_id)
            .bind(&fields.database_id)
            .bind(&fields.title)
            .bind(&properties)
            .bind(&fields.body)
            .bind(fields.last_edited_time)
            .bind(id)
            .execute(pool)
            .await?;
            if res.rows_affected() == 0 {
                return Err(anyhow!("record {} does not exist", id));
            }
            Ok(id)
        }
        None => {
            let id = sqlx::query_scalar::<_, i64>(
                "INSERT INTO records (remote_id, database_id, title, properties, body, last_edited_time) \
                 VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(&fields.remote_id)
            .bind(&fields.database_id)
            .bind(&fields.title)
            .bind(&properties)
            .bind(&fields.body)
            .bind(fields.last_edited_time)
            .fetch_one(pool)
            .await?;
            Ok(id)
        }
    }
}

#[instrument(skip_all)]
pub async fn delete_record(pool: &Pool, id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM download_tasks WHERE target_local_id = ? AND status IN ('pending', 'processing')")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM records WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_record_watermark(pool: &Pool, id: i64) -> Result<Option<DateTime<Utc>>> {
    let ts: Option<Option<DateTime<Utc>>> =
        sqlx::query_scalar("SELECT last_synced_time FROM records WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(ts.flatten())
}

#[instrument(skip_all)]
pub async fn set_record_watermark(pool: &Pool, id: i64, watermark: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE records SET last_synced_time = ? WHERE id = ?")
        .bind(watermark)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn tracked_records(pool: &Pool, database_id: &str) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query("SELECT remote_id, id FROM records WHERE database_id = ? ORDER BY id")
        .bind(database_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get::<String, _>("remote_id"), r.get::<i64, _>("id")))
        .collect())
}

/// Rewrite references to `source_url` in the body, and set the primary asset
/// when asked.
#[instrument(skip_all)]
pub async fn attach_asset(
    pool: &Pool,
    id: i64,
    source_url: &str,
    asset_id: &str,
    asset_url: &str,
    primary: bool,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let body: Option<String> = sqlx::query_scalar("SELECT body FROM records WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(body) = body else {
        return Err(anyhow!("record {} does not exist", id));
    };
    if body.contains(source_url) {
        sqlx::query("UPDATE records SET body = ? WHERE id = ?")
            .bind(body.replace(source_url, asset_url))
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    if primary {
        sqlx::query("UPDATE records SET primary_asset_id = ? WHERE id = ?")
            .bind(asset_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// assets

fn asset_from_row(r: SqliteRow) -> AssetRow {
    AssetRow {
        id: r.get("id"),
        source_url: r.get("source_url"),
        filename: r.get("filename"),
        path: r.get("path"),
        byte_size: r.get("byte_size"),
    }
}

#[instrument(skip_all)]
pub async fn find_asset_by_source_url(pool: &Pool, source_url: &str) -> Result<Option<AssetRow>> {
    let row = sqlx::query(
        "SELECT id, source_url, filename, path, byte_size FROM assets WHERE source_url = ?",
    )
    .bind(source_url)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(asset_from_row))
}

#[instrument(skip_all)]
pub async fn find_asset(pool: &Pool, asset_id: &str) -> Result<Option<AssetRow>> {
    let row = sqlx::query("SELECT id, source_url, filename, path, byte_size FROM assets WHERE id = ?")
        .bind(asset_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(asset_from_row))
}

/// Insert an asset row. When another writer got there first the existing row
/// wins and is returned.
#[instrument(skip_all)]
pub async fn insert_asset(pool: &Pool, asset: &AssetRow) -> Result<AssetRow> {
    sqlx::query(
        "INSERT INTO assets (id, source_url, filename, path, byte_size) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(source_url) DO NOTHING",
    )
    .bind(&asset.id)
    .bind(&asset.source_url)
    .bind(&asset.filename)
    .bind(&asset.path)
    .bind(asset.byte_size)
    .execute(pool)
    .await?;
    find_asset_by_source_url(pool, &asset.source_url)
        .await?
        .ok_or_else(|| anyhow!("asset for {} vanished after insert", asset.source_url))
}

// ---------------------------------------------------------------------------
// download queue

fn task_from_row(r: SqliteRow) -> Result<DownloadTask> {
    let status: String = r.get("status");
    Ok(DownloadTask {
        id: r.get("id"),
        url: r.get("url"),
        canonical_url: r.get("canonical_url"),
        target_local_id: r.get("target_local_id"),
        is_primary_asset: r.get::<i64, _>("is_primary") != 0,
        retry_count: r.get::<i64, _>("retry_count").max(0) as u32,
        status: DownloadStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("unknown download status {}", status))?,
        due_at: from_ms(r.get("due_at_ms")),
        last_error: r.get("last_error"),
    })
}

#[instrument(skip_all)]
pub async fn enqueue_download(
    pool: &Pool,
    task: &NewDownloadTask,
    canonical_url: &str,
    due_at_ms: i64,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO download_tasks (url, canonical_url, target_local_id, is_primary, status, due_at_ms) \
         VALUES (?, ?, ?, ?, 'pending', ?) RETURNING id",
    )
    .bind(&task.url)
    .bind(canonical_url)
    .bind(task.target_local_id)
    .bind(task.is_primary_asset as i64)
    .bind(due_at_ms)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Move up to `limit` due pending tasks to `processing` and return them.
/// A single statement, so two workers never claim the same task.
#[instrument(skip_all)]
pub async fn claim_due_downloads(pool: &Pool, limit: usize, now_ms: i64) -> Result<Vec<DownloadTask>> {
    let sql = format!(
        "UPDATE download_tasks SET status = 'processing', claimed_at_ms = ? \
         WHERE id IN (SELECT id FROM download_tasks WHERE status = 'pending' AND due_at_ms <= ? \
                      ORDER BY due_at_ms, id LIMIT ?) \
         RETURNING {}",
        TASK_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(now_ms)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;
    let mut tasks = rows
        .into_iter()
        .map(task_from_row)
        .collect::<Result<Vec<_>>>()?;
    tasks.sort_by_key(|t| t.id);
    Ok(tasks)
}

#[instrument(skip_all)]
pub async fn fetch_download(pool: &Pool, id: i64) -> Result<Option<DownloadTask>> {
    let sql = format!("SELECT {} FROM download_tasks WHERE id = ?", TASK_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.map(task_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn complete_download(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE download_tasks SET status = 'done', claimed_at_ms = NULL, last_error = NULL WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a failed attempt. With `retry_at_ms` the task goes back to pending,
/// without it the task fails for good.
#[instrument(skip_all)]
pub async fn fail_download(
    pool: &Pool,
    id: i64,
    retry_count: u32,
    retry_at_ms: Option<i64>,
    error: &str,
) -> Result<()> {
    let (status, due) = match retry_at_ms {
        Some(at) => (DownloadStatus::Pending, Some(at)),
        None => (DownloadStatus::Failed, None),
    };
    sqlx::query(
        "UPDATE download_tasks SET status = ?, retry_count = ?, due_at_ms = COALESCE(?, due_at_ms), \
         claimed_at_ms = NULL, last_error = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(retry_count as i64)
    .bind(due)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_downloads(pool: &Pool) -> Result<QueueCounts> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM download_tasks GROUP BY status")
        .fetch_all(pool)
        .await?;
    let mut counts = QueueCounts::default();
    for r in rows {
        let n = r.get::<i64, _>("n").max(0) as u64;
        match DownloadStatus::parse_status(&r.get::<String, _>("status")) {
            Some(DownloadStatus::Pending) => counts.pending = n,
            Some(DownloadStatus::Processing) => counts.processing = n,
            Some(DownloadStatus::Done) => counts.done = n,
            Some(DownloadStatus::Failed) => counts.failed = n,
            None => {}
        }
    }
    Ok(counts)
}

/// Return tasks claimed before `claimed_before_ms` to pending.
#[instrument(skip_all)]
pub async fn recover_stale_downloads(pool: &Pool, claimed_before_ms: i64) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE download_tasks SET status = 'pending', claimed_at_ms = NULL \
         WHERE status = 'processing' AND (claimed_at_ms IS NULL OR claimed_at_ms < ?)",
    )
    .bind(claimed_before_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// run state

/// Take the lock on `scope` unless a live one exists. An expired lock is
/// taken over in the same statement.
#[instrument(skip_all)]
pub async fn try_acquire_lock(
    pool: &Pool,
    scope: &str,
    token: &str,
    now_ms: i64,
    ttl_ms: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO sync_locks (scope_key, token, acquired_at_ms, ttl_ms) VALUES (?, ?, ?, ?) \
         ON CONFLICT(scope_key) DO UPDATE SET token = excluded.token, \
             acquired_at_ms = excluded.acquired_at_ms, ttl_ms = excluded.ttl_ms \
         WHERE sync_locks.acquired_at_ms + sync_locks.ttl_ms <= excluded.acquired_at_ms",
    )
    .bind(scope)
    .bind(token)
    .bind(now_ms)
    .bind(ttl_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn release_lock(pool: &Pool, scope: &str, token: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM sync_locks WHERE scope_key = ? AND token = ?")
        .bind(scope)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn insert_sync_run(pool: &Pool, database_id: &str, stats: &RunStats) -> Result<i64> {
    let errors = serde_json::to_string(&stats.errors)?;
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO sync_runs (database_id, started_at, finished_at, total, created, updated, skipped, \
         deleted, failed, errors, watermark) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(database_id)
    .bind(stats.started_at)
    .bind(stats.finished_at)
    .bind(stats.total as i64)
    .bind(stats.created as i64)
    .bind(stats.updated as i64)
    .bind(stats.skipped as i64)
    .bind(stats.deleted as i64)
    .bind(stats.failed as i64)
    .bind(errors)
    .bind(stats.watermark)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Watermark of the newest run of `database_id` without failures.
#[instrument(skip_all)]
pub async fn last_clean_watermark(pool: &Pool, database_id: &str) -> Result<Option<DateTime<Utc>>> {
    let ts: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
        "SELECT watermark FROM sync_runs WHERE database_id = ? AND failed = 0 AND watermark IS NOT NULL \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(database_id)
    .fetch_optional(pool)
    .await?;
    Ok(ts.flatten())
}

#[instrument(skip_all)]
pub async fn recent_runs(pool: &Pool, database_id: &str, limit: i64) -> Result<Vec<SyncRunRow>> {
    let rows = sqlx::query(
        "SELECT id, database_id, total, failed, watermark FROM sync_runs WHERE database_id = ? \
         ORDER BY id DESC LIMIT ?",
    )
    .bind(database_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| SyncRunRow {
            id: r.get("id"),
            database_id: r.get("database_id"),
            total: r.get("total"),
            failed: r.get("failed"),
            watermark: r.get("watermark"),
        })
        .collect())
}
