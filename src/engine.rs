//! Wiring of the components that make up one sync engine instance.
use anyhow::{Context, Result};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;

use crate::assets::{AssetDownloadQueue, QueueOptions};
use crate::cache::TtlCache;
use crate::config::Config;
use crate::controller::{ConcurrencyController, ControllerConfig, Transport};
use crate::db::{Pool, SqliteStore};
use crate::fetch::{FetchClient, FetchOptions};
use crate::notion::NotionClient;
use crate::render::MarkdownRenderer;
use crate::sync::{SyncCoordinator, SyncOptions};

const DEFAULT_BASE_URL: &str = "https://api.notion.com/";

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub controller: ControllerConfig,
    pub fetch: FetchOptions,
    pub sync: SyncOptions,
    pub queue: QueueOptions,
    pub cache_ttl: Duration,
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            controller: cfg.controller_config(),
            fetch: cfg.fetch_options(),
            sync: cfg.sync_options(),
            queue: cfg.queue_options(),
            cache_ttl: cfg.cache_ttl(),
        }
    }
}

pub struct Engine {
    pub api: NotionClient,
    pub store: Arc<SqliteStore>,
    pub controller: Arc<ConcurrencyController>,
    pub fetch: Arc<FetchClient>,
    pub queue: Arc<AssetDownloadQueue>,
    pub coordinator: Arc<SyncCoordinator>,
}

impl Engine {
    pub fn from_config(cfg: &Config, pool: Pool) -> Result<Self> {
        let base = cfg.notion.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let base_url = Url::parse(base).with_context(|| format!("invalid base url {}", base))?;
        let settings = EngineSettings::from_config(cfg);
        let api = NotionClient::with_timeout(
            cfg.notion.token.clone(),
            cfg.notion.version.clone(),
            base_url,
            settings.controller.request_timeout,
        );
        let store = SqliteStore::new(pool, cfg.media_dir(), cfg.assets.url_prefix.clone());
        Ok(Self::assemble(api.clone(), Arc::new(api), store, settings))
    }

    /// `api` builds requests; `transport` sends them. In production both are
    /// the same client.
    pub fn assemble(
        api: NotionClient,
        transport: Arc<dyn Transport>,
        store: SqliteStore,
        settings: EngineSettings,
    ) -> Self {
        let store = Arc::new(store);
        let controller = Arc::new(ConcurrencyController::new(transport, settings.controller));
        let cache = Arc::new(TtlCache::new(settings.cache_ttl));
        let fetch = Arc::new(FetchClient::new(
            api.clone(),
            controller.clone(),
            cache,
            settings.fetch,
        ));
        let queue = Arc::new(AssetDownloadQueue::new(
            store.pool().clone(),
            controller.clone(),
            store.clone(),
            store.clone(),
            settings.queue,
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            fetch.clone(),
            store.clone(),
            store.clone(),
            Arc::new(MarkdownRenderer::new()),
            queue.clone(),
            settings.sync,
        ));
        Self {
            api,
            store,
            controller,
            fetch,
            queue,
            coordinator,
        }
    }
}
