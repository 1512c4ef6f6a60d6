#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use notion_sync::controller::{ControllerConfig, RawResponse, Request, Transport, TransportError};
use notion_sync::db::{self, Pool, SqliteStore};
use notion_sync::engine::{Engine, EngineSettings};
use notion_sync::notion::NotionClient;

pub const BASE: &str = "http://notion.test/";
pub const DB_ID: &str = "11111111-2222-3333-4444-555555555555";

#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub body: Option<Value>,
    pub at: Instant,
}

/// Scripted stand-in for the Notion API and the file host behind it.
///
/// - `POST /v1/databases/{id}/query` pages through `records`, honouring the
///   `last_edited_time.after` filter and `start_cursor` (a decimal offset).
/// - `GET /v1/blocks/{id}/children` pages through `children[id]`; unknown ids
///   have no children.
/// - Any other path is served from `files`, 404 otherwise.
///
/// `script(key, ..)` queues statuses returned before the normal answer, where
/// key is a block id, a database id or a file path.
///
/// `fail_after(key, n, status)` answers normally `n` times, then always
/// `status`. `drop_next_cursors()` makes query pages claim `has_more` without
/// saying where to continue.
#[derive(Default)]
pub struct FakeNotion {
    records: Mutex<Vec<Value>>,
    children: Mutex<HashMap<String, Vec<Value>>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    scripted: Mutex<HashMap<String, VecDeque<(u16, Option<Duration>)>>>,
    fixed: Mutex<HashMap<String, u16>>,
    delayed: Mutex<HashMap<String, (usize, u16)>>,
    no_next_cursor: Mutex<bool>,
    calls: Mutex<Vec<Call>>,
    latency: Mutex<Option<Duration>>,
}

impl FakeNotion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_records(&self, records: Vec<Value>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn set_children(&self, parent: &str, children: Vec<Value>) {
        self.children
            .lock()
            .unwrap()
            .insert(parent.to_string(), children);
    }

    pub fn set_file(&self, path: &str, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn script(&self, key: &str, responses: Vec<(u16, Option<Duration>)>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend(responses);
    }

    /// Always answer `status` for `key`.
    pub fn fail_always(&self, key: &str, status: u16) {
        self.fixed.lock().unwrap().insert(key.to_string(), status);
    }

    pub fn fail_after(&self, key: &str, ok_calls: usize, status: u16) {
        self.delayed
            .lock()
            .unwrap()
            .insert(key.to_string(), (ok_calls, status));
    }

    pub fn drop_next_cursors(&self) {
        *self.no_next_cursor.lock().unwrap() = true;
    }

    pub fn clear_failures(&self) {
        self.fixed.lock().unwrap().clear();
        self.delayed.lock().unwrap().clear();
        *self.no_next_cursor.lock().unwrap() = false;
        self.scripted.lock().unwrap().clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn calls_to(&self, path: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == path)
            .collect()
    }

    pub fn query_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.path.ends_with("/query"))
            .count()
    }

    pub fn children_calls(&self, block_id: &str) -> usize {
        self.calls_to(&format!("/v1/blocks/{}/children", block_id))
            .len()
    }

    fn scripted_status(&self, key: &str) -> Option<(u16, Option<Duration>)> {
        if let Some(status) = self.fixed.lock().unwrap().get(key) {
            return Some((*status, None));
        }
        if let Some((ok_calls, status)) = self.delayed.lock().unwrap().get_mut(key) {
            if *ok_calls == 0 {
                return Some((*status, None));
            }
            *ok_calls -= 1;
        }
        self.scripted
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|q| q.pop_front())
    }

    fn query_database(&self, body: &Value) -> Value {
        let after = body
            .pointer("/filter/last_edited_time/after")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        let records: Vec<Value> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| match after {
                Some(after) => r["last_edited_time"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc) > after)
                    .unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect();
        let page_size = body["page_size"].as_u64().unwrap_or(100) as usize;
        let start = body["start_cursor"]
            .as_str()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let mut page = paginate(records, start, page_size);
        if *self.no_next_cursor.lock().unwrap() {
            page["next_cursor"] = Value::Null;
        }
        page
    }

    fn block_children(&self, block_id: &str, url: &Url) -> Value {
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let page_size = params
            .get("page_size")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(100);
        let start = params
            .get("start_cursor")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        let children = self
            .children
            .lock()
            .unwrap()
            .get(block_id)
            .cloned()
            .unwrap_or_default();
        paginate(children, start, page_size)
    }
}

fn paginate(items: Vec<Value>, start: usize, page_size: usize) -> Value {
    let end = (start + page_size).min(items.len());
    let has_more = end < items.len();
    json!({
        "object": "list",
        "results": items.get(start..end).map(|s| s.to_vec()).unwrap_or_default(),
        "has_more": has_more,
        "next_cursor": if has_more { Value::String(end.to_string()) } else { Value::Null },
    })
}

fn respond(status: u16, body: Value) -> RawResponse {
    RawResponse {
        status,
        retry_after: None,
        body: serde_json::to_vec(&body).unwrap(),
    }
}

#[async_trait]
impl Transport for FakeNotion {
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError> {
        let path = request.url.path().to_string();
        self.calls.lock().unwrap().push(Call {
            method: request.method.clone(),
            path: path.clone(),
            query: request.url.query().map(str::to_string),
            body: request.body.clone(),
            at: Instant::now(),
        });
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let key = match segments.as_slice() {
            ["v1", "databases", id, "query"] => id.to_string(),
            ["v1", "blocks", id, "children"] => id.to_string(),
            _ => path.clone(),
        };
        if let Some((status, retry_after)) = self.scripted_status(&key) {
            if status == 0 {
                return Err(TransportError::Connection("connection refused".into()));
            }
            return Ok(RawResponse {
                status,
                retry_after,
                body: format!("{{\"object\":\"error\",\"status\":{}}}", status).into_bytes(),
            });
        }

        Ok(match segments.as_slice() {
            ["v1", "databases", _, "query"] => {
                respond(200, self.query_database(request.body.as_ref().unwrap_or(&Value::Null)))
            }
            ["v1", "blocks", id, "children"] => respond(200, self.block_children(id, &request.url)),
            _ => match self.files.lock().unwrap().get(&path) {
                Some(bytes) => RawResponse {
                    status: 200,
                    retry_after: None,
                    body: bytes.clone(),
                },
                None => respond(404, json!({ "object": "error", "status": 404 })),
            },
        })
    }
}

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn record(id: &str, edited: &str, title: &str) -> Value {
    json!({
        "object": "page",
        "id": id,
        "created_time": "2024-01-01T00:00:00.000Z",
        "last_edited_time": edited,
        "archived": false,
        "properties": {
            "Name": { "id": "title", "type": "title", "title": [{ "plain_text": title }] }
        }
    })
}

pub fn block(id: &str, tag: &str, text: &str, has_children: bool) -> Value {
    json!({
        "object": "block",
        "id": id,
        "type": tag,
        "has_children": has_children,
        tag: { "rich_text": [{ "plain_text": text }] }
    })
}

pub fn image_block(id: &str, url: &str) -> Value {
    json!({
        "object": "block",
        "id": id,
        "type": "image",
        "has_children": false,
        "image": { "type": "file", "file": { "url": url }, "caption": [] }
    })
}

pub fn file_url(path: &str, signature: &str) -> String {
    format!("{}{}?X-Amz-Signature={}", BASE.trim_end_matches('/'), path, signature)
}

pub fn api() -> NotionClient {
    NotionClient::with_base_url(
        "secret".into(),
        "2022-06-28".into(),
        Url::parse(BASE).unwrap(),
    )
}

pub fn fast_controller() -> ControllerConfig {
    ControllerConfig {
        base_delay: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub async fn setup_pool() -> Pool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub struct Harness {
    pub fake: Arc<FakeNotion>,
    pub engine: Engine,
    pub media: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(EngineSettings {
            controller: fast_controller(),
            cache_ttl: Duration::from_secs(60),
            ..Default::default()
        })
        .await
    }

    pub async fn with_settings(settings: EngineSettings) -> Self {
        let fake = FakeNotion::new();
        let media = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(setup_pool().await, media.path().join("media"), "/media");
        let engine = Engine::assemble(api(), fake.clone(), store, settings);
        Self { fake, engine, media }
    }

    pub fn pool(&self) -> &Pool {
        self.engine.store.pool()
    }
}
