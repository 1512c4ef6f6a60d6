use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Processing => "processing",
            DownloadStatus::Done => "done",
            DownloadStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DownloadStatus::Pending),
            "processing" => Some(DownloadStatus::Processing),
            "done" => Some(DownloadStatus::Done),
            "failed" => Some(DownloadStatus::Failed),
            _ => None,
        }
    }
}

/// Caller-supplied part of a download task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDownloadTask {
    pub url: String,
    pub target_local_id: i64,
    /// The cover/featured asset of the target record.
    pub is_primary_asset: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadTask {
    pub id: i64,
    pub url: String,
    /// `url` without query string or fragment; signed asset URLs differ only there.
    pub canonical_url: String,
    pub target_local_id: i64,
    pub is_primary_asset: bool,
    pub retry_count: u32,
    pub status: DownloadStatus,
    pub due_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

/// Outcome counters of one sync run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStats {
    pub total: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub failed: u64,
    pub errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Newest `last_edited_time` among listed records.
    pub watermark: Option<DateTime<Utc>>,
}

impl RunStats {
    pub fn is_consistent(&self) -> bool {
        self.created + self.updated + self.skipped + self.failed == self.total
    }

    pub fn record_failure(&mut self, message: String) {
        self.failed += 1;
        self.errors.push(message);
    }
}
