//! Bounded-parallel request executor with retry, backoff and adaptive
//! concurrency.
//!
//! Requests are executed in batches no larger than the current concurrency
//! limit. Every member of a batch runs concurrently and the next batch only
//! starts once the whole batch has settled. Each attempt also holds a permit
//! from a semaphore sized to the limit, so callers sharing one controller
//! never have more than `limit` requests in flight between them. Retryable outcomes are re-queued
//! with an exponential delay; the delay is slept inside the retried request's
//! own future, so it never holds up requests from earlier batches.
//!
//! After each batch a rolling quality score (error rate, rate-limit rate and
//! latency) is recomputed, and every `adjust_every_requests` requests (or
//! `adjust_interval`) the limit moves up or down within
//! `[min_concurrency, max_concurrency]`.
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::RemoteError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub body: Option<Value>,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            body: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url, body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(Method::POST, url)
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// What a transport hands back before classification.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    /// Target unreachable: DNS, refused, reset.
    Connection(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
    pub attempts: u32,
    pub latency: Duration,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RemoteError> {
        serde_json::from_slice(&self.body).map_err(|e| RemoteError::Payload(e.to_string()))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.body
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: usize,
    pub request_timeout: Duration,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Upper bound on retries for rate-limited requests; kept below the
    /// generic budget.
    pub rate_limit_retries: u32,
    pub window_size: usize,
    pub adjust_every_requests: usize,
    pub adjust_interval: Duration,
    pub high_quality: f64,
    pub low_quality: f64,
    pub increase_step: usize,
    pub latency_target: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 5,
            max_concurrency: 30,
            initial_concurrency: 10,
            request_timeout: Duration::from_secs(30),
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            rate_limit_retries: 2,
            window_size: 50,
            adjust_every_requests: 20,
            adjust_interval: Duration::from_secs(10),
            high_quality: 0.8,
            low_quality: 0.6,
            increase_step: 2,
            latency_target: Duration::from_millis(1500),
        }
    }
}

impl ControllerConfig {
    /// `base_delay * backoff_multiplier^(retry_count - 1)`, capped at `max_backoff`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let cap = self.max_backoff.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleKind {
    Success,
    /// Terminal 4xx: the network is fine, the request was not.
    Rejected,
    ServerError,
    Timeout,
    ConnectionFailure,
    RateLimited,
}

impl SampleKind {
    fn of(outcome: &Result<RawResponse, RemoteError>) -> Self {
        match outcome {
            Ok(_) => SampleKind::Success,
            Err(RemoteError::Timeout(_)) => SampleKind::Timeout,
            Err(RemoteError::Connection(_)) => SampleKind::ConnectionFailure,
            Err(RemoteError::Server { .. }) => SampleKind::ServerError,
            Err(RemoteError::RateLimited { .. }) => SampleKind::RateLimited,
            Err(_) => SampleKind::Rejected,
        }
    }

    fn error_weight(self) -> f64 {
        match self {
            SampleKind::ConnectionFailure | SampleKind::ServerError => 1.0,
            SampleKind::Timeout => 0.75,
            SampleKind::Success | SampleKind::Rejected | SampleKind::RateLimited => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: Duration,
    kind: SampleKind,
}

struct QualityWindow {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl QualityWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn score(&self, latency_target: Duration) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        let n = self.samples.len() as f64;
        let weighted_errors: f64 = self.samples.iter().map(|s| s.kind.error_weight()).sum();
        let rate_limited = self
            .samples
            .iter()
            .filter(|s| s.kind == SampleKind::RateLimited)
            .count() as f64;
        let total_latency: Duration = self.samples.iter().map(|s| s.latency).sum();
        let avg_latency = total_latency.as_secs_f64() / n;

        let error_factor = 1.0 - weighted_errors / n;
        let rate_factor = 1.0 - rate_limited / n;
        let target = latency_target.as_secs_f64();
        let latency_factor = if avg_latency <= target || avg_latency <= 0.0 {
            1.0
        } else {
            target / avg_latency
        };
        (error_factor * rate_factor * latency_factor).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub retried: u64,
    pub rate_limited: u64,
    pub timeouts: u64,
    pub connection_failures: u64,
    pub average_latency_ms: f64,
    pub quality_score: f64,
    pub concurrency_limit: usize,
    pub adjustments: u64,
}

struct ControllerState {
    limit: usize,
    window: QualityWindow,
    quality: f64,
    requests_since_adjust: usize,
    last_adjust: Instant,
    stats: ControllerStats,
    latency_total: Duration,
}

impl ControllerState {
    fn record(&mut self, kind: SampleKind, latency: Duration) {
        self.window.push(Sample { latency, kind });
        self.stats.total_requests += 1;
        self.latency_total += latency;
        match kind {
            SampleKind::Timeout => self.stats.timeouts += 1,
            SampleKind::ConnectionFailure => self.stats.connection_failures += 1,
            SampleKind::RateLimited => self.stats.rate_limited += 1,
            _ => {}
        }
    }
}

struct Attempt {
    index: usize,
    request: Request,
    retry_count: u32,
    not_before: Option<Instant>,
}

pub struct ConcurrencyController {
    transport: Arc<dyn Transport>,
    config: ControllerConfig,
    state: Mutex<ControllerState>,
    permits: Semaphore,
    /// Permits still to retire after a shrink that found them in use.
    owed_permits: AtomicUsize,
}

impl ConcurrencyController {
    pub fn new(transport: Arc<dyn Transport>, config: ControllerConfig) -> Self {
        let min = config.min_concurrency.max(1);
        let max = config.max_concurrency.max(min);
        let config = ControllerConfig {
            min_concurrency: min,
            max_concurrency: max,
            initial_concurrency: config.initial_concurrency.clamp(min, max),
            ..config
        };
        let state = ControllerState {
            limit: config.initial_concurrency,
            window: QualityWindow::new(config.window_size),
            quality: 1.0,
            requests_since_adjust: 0,
            last_adjust: Instant::now(),
            stats: ControllerStats::default(),
            latency_total: Duration::ZERO,
        };
        Self {
            permits: Semaphore::new(config.initial_concurrency),
            owed_permits: AtomicUsize::new(0),
            transport,
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub async fn concurrency_limit(&self) -> usize {
        self.state.lock().await.limit
    }

    /// Runtime override, clamped to the configured bounds.
    pub async fn set_concurrency_limit(&self, limit: usize) -> usize {
        let mut state = self.state.lock().await;
        let next = limit.clamp(self.config.min_concurrency, self.config.max_concurrency);
        self.resize_permits(state.limit, next);
        state.limit = next;
        state.limit
    }

    /// Called with the state lock held, so resizes never interleave.
    fn resize_permits(&self, from: usize, to: usize) {
        if to > from {
            let grow = to - from;
            let prev = self
                .owed_permits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |owed| {
                    Some(owed.saturating_sub(grow))
                })
                .unwrap_or(0);
            self.permits.add_permits(grow - prev.min(grow));
        } else if to < from {
            let shrink = from - to;
            let forgotten = self.permits.forget_permits(shrink);
            self.owed_permits
                .fetch_add(shrink - forgotten, Ordering::SeqCst);
        }
    }

    pub async fn stats(&self) -> ControllerStats {
        let state = self.state.lock().await;
        let mut stats = state.stats.clone();
        stats.average_latency_ms = if stats.total_requests == 0 {
            0.0
        } else {
            state.latency_total.as_secs_f64() * 1000.0 / stats.total_requests as f64
        };
        stats.quality_score = state.quality;
        stats.concurrency_limit = state.limit;
        stats
    }

    pub async fn execute(&self, request: Request) -> Result<Response, RemoteError> {
        self.submit(vec![request])
            .await
            .pop()
            .unwrap_or_else(|| Err(RemoteError::Internal("no response for request".into())))
    }

    /// Execute all requests, returning one result per request in input order.
    pub async fn submit(&self, requests: Vec<Request>) -> Vec<Result<Response, RemoteError>> {
        if requests.is_empty() {
            return Vec::new();
        }
        let mut results: Vec<Option<Result<Response, RemoteError>>> =
            requests.iter().map(|_| None).collect();
        let mut pending: VecDeque<Attempt> = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| Attempt {
                index,
                request,
                retry_count: 0,
                not_before: None,
            })
            .collect();

        while !pending.is_empty() {
            let limit = self.concurrency_limit().await;
            let take = limit.min(pending.len());
            let batch: Vec<Attempt> = pending.drain(..take).collect();
            debug!(size = batch.len(), limit, "executing batch");

            let outcomes = join_all(batch.into_iter().map(|a| self.run_attempt(a))).await;

            let mut state = self.state.lock().await;
            for (attempt, outcome, latency) in outcomes {
                state.record(SampleKind::of(&outcome), latency);
                match outcome {
                    Ok(raw) => {
                        state.stats.successful += 1;
                        results[attempt.index] = Some(Ok(Response {
                            status: raw.status,
                            body: raw.body,
                            attempts: attempt.retry_count + 1,
                            latency,
                        }));
                    }
                    Err(err) if err.is_retryable() => {
                        let budget = self.retry_budget(&attempt.request, &err);
                        if attempt.retry_count < budget {
                            let retry_count = attempt.retry_count + 1;
                            let delay = self.retry_delay(&err, retry_count);
                            state.stats.retried += 1;
                            warn!(
                                url = %attempt.request.url,
                                retry_count,
                                ?delay,
                                error = %err,
                                "retrying request"
                            );
                            pending.push_back(Attempt {
                                retry_count,
                                not_before: Some(Instant::now() + delay),
                                ..attempt
                            });
                        } else {
                            state.stats.failed += 1;
                            warn!(url = %attempt.request.url, error = %err, "retry budget exhausted");
                            results[attempt.index] = Some(Err(RemoteError::RetriesExhausted {
                                attempts: attempt.retry_count + 1,
                                last: Box::new(err),
                            }));
                        }
                    }
                    Err(err) => {
                        state.stats.failed += 1;
                        debug!(url = %attempt.request.url, error = %err, "request failed");
                        results[attempt.index] = Some(Err(err));
                    }
                }
            }
            state.requests_since_adjust += take;
            self.adapt(&mut state);
        }

        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| Err(RemoteError::Internal("request was never settled".into())))
            })
            .collect()
    }

    async fn run_attempt(
        &self,
        attempt: Attempt,
    ) -> (Attempt, Result<RawResponse, RemoteError>, Duration) {
        if let Some(at) = attempt.not_before {
            sleep_until(at).await;
        }
        let permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let closed = Err(RemoteError::Internal("controller shut down".into()));
                return (attempt, closed, Duration::ZERO);
            }
        };
        let started = Instant::now();
        let limit = self.config.request_timeout;
        let outcome = match timeout(limit, self.transport.send(&attempt.request)).await {
            Ok(result) => classify(result, limit),
            Err(_) => Err(RemoteError::Timeout(limit)),
        };
        let latency = started.elapsed();
        let retired = self
            .owed_permits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |owed| owed.checked_sub(1))
            .is_ok();
        if retired {
            permit.forget();
        }
        (attempt, outcome, latency)
    }

    fn retry_budget(&self, request: &Request, err: &RemoteError) -> u32 {
        match err {
            RemoteError::RateLimited { .. } => {
                request.max_retries.min(self.config.rate_limit_retries)
            }
            _ => request.max_retries,
        }
    }

    fn retry_delay(&self, err: &RemoteError, retry_count: u32) -> Duration {
        match err {
            RemoteError::RateLimited {
                retry_after: Some(wait),
            } => *wait,
            _ => self.config.backoff_delay(retry_count),
        }
    }

    fn adapt(&self, state: &mut ControllerState) {
        state.quality = state.window.score(self.config.latency_target);
        let due = state.requests_since_adjust >= self.config.adjust_every_requests
            || state.last_adjust.elapsed() >= self.config.adjust_interval;
        if !due {
            return;
        }
        state.requests_since_adjust = 0;
        state.last_adjust = Instant::now();

        let current = state.limit;
        let next = if state.quality >= self.config.high_quality {
            (current + self.config.increase_step).min(self.config.max_concurrency)
        } else if state.quality <= self.config.low_quality {
            (current * 3 / 4)
                .min(current.saturating_sub(1))
                .max(self.config.min_concurrency)
        } else {
            current
        };
        if next != current {
            self.resize_permits(current, next);
            state.limit = next;
            state.stats.adjustments += 1;
            info!(
                from = current,
                to = next,
                quality = state.quality,
                "adjusted concurrency limit"
            );
        }
    }
}

fn classify(
    result: Result<RawResponse, TransportError>,
    limit: Duration,
) -> Result<RawResponse, RemoteError> {
    let raw = match result {
        Ok(raw) => raw,
        Err(TransportError::Timeout) => return Err(RemoteError::Timeout(limit)),
        Err(TransportError::Connection(msg)) => return Err(RemoteError::Connection(msg)),
    };
    match raw.status {
        200..=299 => Ok(raw),
        429 => Err(RemoteError::RateLimited {
            retry_after: raw.retry_after,
        }),
        404 => Err(RemoteError::NotFound(body_snippet(&raw.body))),
        500..=599 => Err(RemoteError::Server {
            status: raw.status,
            body: body_snippet(&raw.body),
        }),
        status => Err(RemoteError::Client {
            status,
            body: body_snippet(&raw.body),
        }),
    }
}

fn body_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.chars().take(ERROR_BODY_LIMIT).collect()
}
