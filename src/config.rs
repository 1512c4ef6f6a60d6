//! Configuration loader and validator for the sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::assets::QueueOptions;
use crate::controller::ControllerConfig;
use crate::fetch::FetchOptions;
use crate::notion::{normalize_id, MAX_PAGE_SIZE};
use crate::sync::SyncOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub notion: Notion,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub controller: Controller,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub assets: Assets,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Notion API credentials and the databases to mirror.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notion {
    pub token: String,
    pub version: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Database ids, undashed ids or notion.so URLs.
    pub databases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub lock_ttl_secs: u64,
    pub max_depth: usize,
    pub page_size: usize,
    pub incremental: bool,
    pub check_deletions: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            lock_ttl_secs: 1800,
            max_depth: 3,
            page_size: MAX_PAGE_SIZE,
            incremental: true,
            check_deletions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Controller {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: usize,
    pub request_timeout_secs: u64,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: u64,
    pub rate_limit_retries: u32,
    pub latency_target_ms: u64,
}

impl Default for Controller {
    fn default() -> Self {
        let d = ControllerConfig::default();
        Self {
            min_concurrency: d.min_concurrency,
            max_concurrency: d.max_concurrency,
            initial_concurrency: d.initial_concurrency,
            request_timeout_secs: d.request_timeout.as_secs(),
            base_delay_ms: d.base_delay.as_millis() as u64,
            backoff_multiplier: d.backoff_multiplier,
            max_backoff_secs: d.max_backoff.as_secs(),
            rate_limit_retries: d.rate_limit_retries,
            latency_target_ms: d.latency_target.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Cache {
    pub ttl_secs: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Assets {
    /// Public prefix under which stored media is served.
    pub url_prefix: String,
    pub batch_size: usize,
    pub poll_interval_secs: u64,
    pub max_retries: u32,
    pub retry_base_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for Assets {
    fn default() -> Self {
        Self {
            url_prefix: "/media".into(),
            batch_size: 10,
            poll_interval_secs: 30,
            max_retries: 3,
            retry_base_secs: 5,
            max_backoff_secs: 3600,
        }
    }
}

impl Config {
    /// Ensure required directories exist (`app.data_dir` and its media folder).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.media_dir())
    }

    pub fn media_dir(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join("media")
    }

    pub fn database_url(&self) -> String {
        format!("sqlite://{}/notion-sync.db", self.app.data_dir)
    }

    /// Configured databases in normalised form.
    pub fn database_ids(&self) -> Vec<String> {
        self.notion
            .databases
            .iter()
            .filter_map(|d| normalize_id(d))
            .collect()
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let c = &self.controller;
        ControllerConfig {
            min_concurrency: c.min_concurrency,
            max_concurrency: c.max_concurrency,
            initial_concurrency: c.initial_concurrency,
            request_timeout: Duration::from_secs(c.request_timeout_secs),
            base_delay: Duration::from_millis(c.base_delay_ms),
            backoff_multiplier: c.backoff_multiplier,
            max_backoff: Duration::from_secs(c.max_backoff_secs),
            rate_limit_retries: c.rate_limit_retries,
            latency_target: Duration::from_millis(c.latency_target_ms),
            ..ControllerConfig::default()
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            page_size: self.sync.page_size,
            max_depth: self.sync.max_depth,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            lock_ttl: Duration::from_secs(self.sync.lock_ttl_secs),
            max_depth: self.sync.max_depth,
        }
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            max_retries: self.assets.max_retries,
            retry_base: Duration::from_secs(self.assets.retry_base_secs),
            max_backoff: Duration::from_secs(self.assets.max_backoff_secs),
            ..QueueOptions::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.notion.token.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.token must be non-empty"));
    }
    if cfg.notion.version.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.version must be non-empty"));
    }
    if let Some(base) = &cfg.notion.base_url {
        if reqwest::Url::parse(base).is_err() {
            return Err(ConfigError::Invalid("notion.base_url must be a valid URL"));
        }
    }
    if cfg.notion.databases.is_empty() {
        return Err(ConfigError::Invalid("notion.databases must list at least one database"));
    }
    if cfg.notion.databases.iter().any(|d| normalize_id(d).is_none()) {
        return Err(ConfigError::Invalid("notion.databases entries must be Notion ids or URLs"));
    }

    if cfg.sync.interval_secs == 0 {
        return Err(ConfigError::Invalid("sync.interval_secs must be > 0"));
    }
    if cfg.sync.lock_ttl_secs == 0 {
        return Err(ConfigError::Invalid("sync.lock_ttl_secs must be > 0"));
    }
    if cfg.sync.page_size == 0 || cfg.sync.page_size > MAX_PAGE_SIZE {
        return Err(ConfigError::Invalid("sync.page_size must be within 1..=100"));
    }

    let c = &cfg.controller;
    if c.min_concurrency == 0 {
        return Err(ConfigError::Invalid("controller.min_concurrency must be > 0"));
    }
    if c.min_concurrency > c.max_concurrency {
        return Err(ConfigError::Invalid(
            "controller.min_concurrency must not exceed controller.max_concurrency",
        ));
    }
    if c.initial_concurrency < c.min_concurrency || c.initial_concurrency > c.max_concurrency {
        return Err(ConfigError::Invalid(
            "controller.initial_concurrency must lie within [min_concurrency, max_concurrency]",
        ));
    }
    if c.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("controller.request_timeout_secs must be > 0"));
    }
    if c.backoff_multiplier.is_nan() || c.backoff_multiplier < 1.0 {
        return Err(ConfigError::Invalid("controller.backoff_multiplier must be >= 1"));
    }

    if cfg.assets.batch_size == 0 {
        return Err(ConfigError::Invalid("assets.batch_size must be > 0"));
    }
    if cfg.assets.max_retries == 0 {
        return Err(ConfigError::Invalid("assets.max_retries must be > 0"));
    }
    if cfg.assets.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid("assets.poll_interval_secs must be > 0"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

notion:
  token: "YOUR_NOTION_INTEGRATION_TOKEN"
  version: "2022-06-28"
  databases:
    - "https://www.notion.so/team/Blog-1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d?v=0"

sync:
  interval_secs: 900
  lock_ttl_secs: 1800
  max_depth: 3
  page_size: 100
  incremental: true
  check_deletions: true

controller:
  min_concurrency: 5
  max_concurrency: 30
  initial_concurrency: 10
  request_timeout_secs: 30
  base_delay_ms: 1000
  backoff_multiplier: 2.0
  max_backoff_secs: 30
  rate_limit_retries: 2
  latency_target_ms: 1500

cache:
  ttl_secs: 300

assets:
  url_prefix: "/media"
  batch_size: 10
  poll_interval_secs: 30
  max_retries: 3
  retry_base_secs: 5
  max_backoff_secs: 3600
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_config() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    fn invalid_message(cfg: &Config) -> &'static str {
        match validate(cfg).unwrap_err() {
            ConfigError::Invalid(msg) => msg,
            other => panic!("wrong error: {other}"),
        }
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_config();
        validate(&cfg).unwrap();
        assert_eq!(
            cfg.database_ids(),
            vec!["1a2b3c4d-5e6f-7a8b-9c0d-1e2f3a4b5c6d".to_string()]
        );
        assert_eq!(cfg.controller_config(), ControllerConfig::default());
        assert_eq!(cfg.queue_options(), QueueOptions::default());
    }

    #[test]
    fn optional_sections_default() {
        let cfg: Config = serde_yaml::from_str(
            r#"app:
  data_dir: "./data"
notion:
  token: "t"
  version: "2022-06-28"
  databases: ["1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d"]
"#,
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sync, SyncSettings::default());
        assert_eq!(cfg.assets, Assets::default());
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn invalid_notion_settings() {
        let mut cfg = example_config();
        cfg.notion.token = "".into();
        assert!(invalid_message(&cfg).contains("notion.token"));

        let mut cfg = example_config();
        cfg.notion.databases.clear();
        assert!(invalid_message(&cfg).contains("notion.databases"));

        let mut cfg = example_config();
        cfg.notion.databases = vec!["blog".into()];
        assert!(invalid_message(&cfg).contains("notion.databases"));

        let mut cfg = example_config();
        cfg.notion.base_url = Some("not a url".into());
        assert!(invalid_message(&cfg).contains("base_url"));
    }

    #[test]
    fn invalid_controller_bounds() {
        let mut cfg = example_config();
        cfg.controller.min_concurrency = 40;
        assert!(invalid_message(&cfg).contains("min_concurrency"));

        let mut cfg = example_config();
        cfg.controller.initial_concurrency = 2;
        assert!(invalid_message(&cfg).contains("initial_concurrency"));

        let mut cfg = example_config();
        cfg.controller.backoff_multiplier = 0.5;
        assert!(invalid_message(&cfg).contains("backoff_multiplier"));
    }

    #[test]
    fn invalid_sync_and_assets() {
        let mut cfg = example_config();
        cfg.sync.page_size = 101;
        assert!(invalid_message(&cfg).contains("page_size"));

        let mut cfg = example_config();
        cfg.assets.batch_size = 0;
        assert!(invalid_message(&cfg).contains("batch_size"));
    }

    #[test]
    fn ensure_dirs_creates_media_dir() {
        let td = tempdir().unwrap();
        let mut cfg = example_config();
        cfg.app.data_dir = td.path().join("data").to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(cfg.media_dir().exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.sync.max_depth, 3);
        assert!(matches!(
            load(Some(&td.path().join("missing.yaml"))),
            Err(ConfigError::Io(_))
        ));
    }
}
