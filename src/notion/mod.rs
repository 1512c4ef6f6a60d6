use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::controller::{RawResponse, Request, Transport, TransportError};
use crate::notion::model::RetrieveDatabaseResp;

pub mod model;

const NOTION_API_BASE: &str = "https://api.notion.com/";

/// Largest `page_size` the API accepts.
pub const MAX_PAGE_SIZE: usize = 100;

static NOTION_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)([0-9a-f]{8})-?([0-9a-f]{4})-?([0-9a-f]{4})-?([0-9a-f]{4})-?([0-9a-f]{12})(?:[^0-9a-f]|$)",
    )
    .expect("valid notion id regex")
});

/// Normalise a dashed id, a bare 32-hex id or a notion.so URL to the dashed,
/// lowercase form the API returns.
pub fn normalize_id(input: &str) -> Option<String> {
    let caps = NOTION_ID.captures_iter(input.trim()).last()?;
    Some(
        (1..=5)
            .map(|i| caps[i].to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join("-"),
    )
}

#[derive(Clone)]
pub struct NotionClient {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
}

impl fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl NotionClient {
    pub fn new(token: String, version: String) -> Self {
        let base_url = Url::parse(NOTION_API_BASE).expect("valid default Notion URL");
        Self::with_base_url(token, version, base_url)
    }

    pub fn with_base_url(token: String, version: String, base_url: Url) -> Self {
        Self::with_timeout(token, version, base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(token: String, version: String, base_url: Url, timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent(concat!("notion-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            version,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid Notion endpoint {}", path))
    }

    /// `POST v1/databases/{id}/query` for one page of results.
    pub fn query_database_request(
        &self,
        database_id: &str,
        page_size: usize,
        start_cursor: Option<&str>,
        filter: Option<&Value>,
    ) -> Result<Request> {
        let url = self.endpoint(&format!("v1/databases/{}/query", database_id))?;
        Ok(Request::post(
            url,
            build_query_body(page_size, start_cursor, filter),
        ))
    }

    /// `GET v1/blocks/{id}/children` for one page of children.
    pub fn block_children_request(
        &self,
        block_id: &str,
        page_size: usize,
        start_cursor: Option<&str>,
    ) -> Result<Request> {
        let mut url = self.endpoint(&format!("v1/blocks/{}/children", block_id))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("page_size", &page_size.min(MAX_PAGE_SIZE).to_string());
            if let Some(cursor) = start_cursor {
                query.append_pair("start_cursor", cursor);
            }
        }
        Ok(Request::get(url))
    }

    /// Only requests aimed at the API get credentials; asset downloads go to
    /// third-party storage hosts.
    fn is_api_url(&self, url: &Url) -> bool {
        url.origin() == self.base_url.origin() && url.path().starts_with(self.base_url.path())
    }

    pub fn build_request(&self, request: &Request) -> Result<reqwest::Request> {
        let mut builder = self.http.request(request.method.clone(), request.url.clone());
        if self.is_api_url(&request.url) {
            builder = builder
                .header("Authorization", format!("Bearer {}", self.token))
                .header("Notion-Version", &self.version);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header("Content-Type", "application/json")
                .json(body);
        }
        builder.build().context("failed to build Notion request")
    }

    pub async fn retrieve_database(&self, database_id: &str) -> Result<RetrieveDatabaseResp> {
        let url = self.endpoint(&format!("v1/databases/{}", database_id))?;
        let request = self.build_request(&Request::new(Method::GET, url))?;
        let res = self.http.execute(request).await.context("failed to reach Notion")?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "notion retrieve db error {}: {}",
                res.status(),
                res.text().await.unwrap_or_default()
            ));
        }
        Ok(res.json::<RetrieveDatabaseResp>().await?)
    }
}

#[async_trait]
impl Transport for NotionClient {
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError> {
        let built = self
            .build_request(request)
            .map_err(|e| TransportError::Connection(format!("{:#}", e)))?;
        debug!(method = %request.method, url = %request.url, "sending request");
        let res = self.http.execute(built).await.map_err(map_reqwest_error)?;
        let status = res.status().as_u16();
        let retry_after = res
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = res.bytes().await.map_err(map_reqwest_error)?.to_vec();
        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connection(err.to_string())
    }
}

/// `Retry-After` in (possibly fractional) seconds. HTTP-date values are not
/// sent by the API and fall back to the default backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

pub fn build_query_body(page_size: usize, start_cursor: Option<&str>, filter: Option<&Value>) -> Value {
    let mut body = json!({ "page_size": page_size.clamp(1, MAX_PAGE_SIZE) });
    if let Some(cursor) = start_cursor {
        body["start_cursor"] = json!(cursor);
    }
    if let Some(filter) = filter {
        body["filter"] = filter.clone();
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_id_accepts_common_shapes() {
        let dashed = "1a2b3c4d-5e6f-7a8b-9c0d-1e2f3a4b5c6d";
        assert_eq!(normalize_id(dashed).as_deref(), Some(dashed));
        assert_eq!(
            normalize_id("1A2B3C4D5E6F7A8B9C0D1E2F3A4B5C6D").as_deref(),
            Some(dashed)
        );
        assert_eq!(
            normalize_id("https://www.notion.so/team/Blog-1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d?v=0123")
                .as_deref(),
            Some(dashed)
        );
        assert_eq!(normalize_id("not-an-id"), None);
    }

    #[test]
    fn query_body_caps_page_size() {
        let filter = json!({ "property": "Status", "select": { "equals": "Done" } });
        let body = build_query_body(500, Some("cur-1"), Some(&filter));
        assert_eq!(body["page_size"], 100);
        assert_eq!(body["start_cursor"], "cur-1");
        assert_eq!(body["filter"]["property"], "Status");

        let body = build_query_body(10, None, None);
        assert_eq!(body["page_size"], 10);
        assert!(body.get("start_cursor").is_none());
        assert!(body.get("filter").is_none());
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 0.5 "), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[test]
    fn build_request_sets_headers_for_api_calls() {
        let client = NotionClient::new("token".into(), "2022-06-28".into());
        let request = client
            .query_database_request("db-1", 100, None, None)
            .unwrap();
        let built = client.build_request(&request).unwrap();
        assert_eq!(built.method(), reqwest::Method::POST);
        assert_eq!(built.url().path(), "/v1/databases/db-1/query");
        let headers = built.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers
                .get("Notion-Version")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "2022-06-28"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn build_request_keeps_credentials_off_asset_hosts() {
        let client = NotionClient::new("token".into(), "2022-06-28".into());
        let url = Url::parse("https://s3.us-west-2.amazonaws.com/file.png?X-Amz=1").unwrap();
        let built = client.build_request(&Request::get(url)).unwrap();
        assert!(built.headers().get("Authorization").is_none());
        assert!(built.headers().get("Notion-Version").is_none());
    }

    #[test]
    fn block_children_request_has_pagination_params() {
        let client = NotionClient::new("token".into(), "2022-06-28".into());
        let request = client
            .block_children_request("blk", 250, Some("next"))
            .unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url.path(), "/v1/blocks/blk/children");
        let pairs: Vec<(String, String)> = request
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("page_size".to_string(), "100".to_string()),
                ("start_cursor".to_string(), "next".to_string())
            ]
        );
    }
}
