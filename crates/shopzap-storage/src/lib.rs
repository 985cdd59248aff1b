//! Flat-file persistence + HTTP fetch utilities for Shopzap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shopzap_core::{MonitoringTask, ProductHistory};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shopzap-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing store document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("parsing store document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store rejected write: {0}")]
    Rejected(String),
}

/// Durable state that must survive a restart: product histories and task definitions.
#[async_trait]
pub trait PersistedStore: Send + Sync {
    async fn load_products(&self) -> Result<Vec<ProductHistory>, StoreError>;
    async fn save_products(&self, products: &[ProductHistory]) -> Result<(), StoreError>;
    async fn load_tasks(&self) -> Result<Vec<MonitoringTask>, StoreError>;
    async fn save_tasks(&self, tasks: &[MonitoringTask]) -> Result<(), StoreError>;
}

/// On-disk document layout shared by every store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub products: Vec<ProductHistory>,
    #[serde(default, rename = "scheduled_tasks", alias = "scheduledTasks")]
    pub scheduled_tasks: Vec<MonitoringTask>,
}

/// Single JSON file holding the whole [`StoreDocument`].
///
/// Each save replaces one half of the cached document and rewrites the file
/// through a temp file + rename, so readers never observe a torn write.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    document: Mutex<StoreDocument>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file is an empty document.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let document = match fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => StoreDocument::default(),
            Ok(text) => serde_json::from_str(&text).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(source) => {
                return Err(StoreError::Io {
                    action: "reading",
                    path,
                    source,
                })
            }
        };
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_document(&self, document: &StoreDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        write_atomically(&self.path, &bytes).await
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|source| StoreError::Io {
            action: "creating directory",
            path: parent.clone(),
            source,
        })?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let io_err = |action: &'static str, path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StoreError::Io {
            action,
            path,
            source,
        }
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err("opening temp file", &temp_path))?;
    file.write_all(bytes)
        .await
        .map_err(io_err("writing temp file", &temp_path))?;
    file.flush()
        .await
        .map_err(io_err("flushing temp file", &temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            action: "renaming temp file onto",
            path: path.to_path_buf(),
            source,
        });
    }
    debug!(path = %path.display(), bytes = bytes.len(), "store document written");
    Ok(())
}

#[async_trait]
impl PersistedStore for JsonFileStore {
    async fn load_products(&self) -> Result<Vec<ProductHistory>, StoreError> {
        Ok(self.document.lock().await.products.clone())
    }

    async fn save_products(&self, products: &[ProductHistory]) -> Result<(), StoreError> {
        let mut document = self.document.lock().await;
        document.products = products.to_vec();
        self.write_document(&document).await
    }

    async fn load_tasks(&self) -> Result<Vec<MonitoringTask>, StoreError> {
        Ok(self.document.lock().await.scheduled_tasks.clone())
    }

    async fn save_tasks(&self, tasks: &[MonitoringTask]) -> Result<(), StoreError> {
        let mut document = self.document.lock().await;
        document.scheduled_tasks = tasks.to_vec();
        self.write_document(&document).await
    }
}

/// Process-local store for tests and dry runs. Writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<StoreDocument>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: StoreDocument) -> Self {
        Self {
            document: Mutex::new(document),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn document(&self) -> StoreDocument {
        self.document.lock().await.clone()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("memory store is read-only".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistedStore for MemoryStore {
    async fn load_products(&self) -> Result<Vec<ProductHistory>, StoreError> {
        Ok(self.document.lock().await.products.clone())
    }

    async fn save_products(&self, products: &[ProductHistory]) -> Result<(), StoreError> {
        self.check_writable()?;
        self.document.lock().await.products = products.to_vec();
        Ok(())
    }

    async fn load_tasks(&self) -> Result<Vec<MonitoringTask>, StoreError> {
        Ok(self.document.lock().await.scheduled_tasks.clone())
    }

    async fn save_tasks(&self, tasks: &[MonitoringTask]) -> Result<(), StoreError> {
        self.check_writable()?;
        self.document.lock().await.scheduled_tasks = tasks.to_vec();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_site_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_site_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucketState {
    fn refill(&mut self, capacity: u32, refill_every: Duration) {
        let elapsed = self.last_refill.elapsed();
        if elapsed >= refill_every && refill_every.as_millis() > 0 {
            let refills = (elapsed.as_millis() / refill_every.as_millis()) as u32;
            self.tokens = (self.tokens.saturating_add(refills)).min(capacity);
            // Keep the unused part of the current interval.
            self.last_refill += refill_every * refills;
        }
    }
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume a token if one is available right now.
    pub async fn try_take(&self) -> bool {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.refill_every);
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// Bounded, retrying page fetcher with one cached client per outbound proxy.
#[derive(Debug)]
pub struct HttpFetcher {
    config: HttpClientConfig,
    direct: reqwest::Client,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
    global_limit: Arc<Semaphore>,
    per_site: Mutex<HashMap<String, Arc<Semaphore>>>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid proxy endpoint {proxy}: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let direct = build_client(&config, None).context("building reqwest client")?;
        Ok(Self {
            direct,
            proxied: Mutex::new(HashMap::new()),
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_site: Mutex::new(HashMap::new()),
            config,
        })
    }

    async fn per_site_semaphore(&self, site: &str) -> Arc<Semaphore> {
        let mut map = self.per_site.lock().await;
        map.entry(site.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_site_concurrency.max(1))))
            .clone()
    }

    async fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, FetchError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let mut clients = self.proxied.lock().await;
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, Some(proxy))?;
        clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }

    /// GET `url`, retrying transient failures with exponential backoff.
    pub async fn fetch_page(
        &self,
        site: &str,
        url: &str,
        proxy: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_site = self.per_site_semaphore(site).await;
        let _site = per_site.acquire().await.map_err(|_| FetchError::Closed)?;

        let client = self.client_for(proxy).await?;
        let span = info_span!("http_fetch", site, url, proxy = proxy.unwrap_or("direct"));
        self.fetch_with_retries(&client, url).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let backoff = self.config.backoff;
        let mut attempt = 0usize;
        loop {
            match client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying page fetch");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying page fetch");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

fn build_client(config: &HttpClientConfig, proxy: Option<&str>) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    if let Some(proxy) = proxy {
        let endpoint = reqwest::Proxy::all(proxy).map_err(|source| FetchError::Proxy {
            proxy: proxy.to_string(),
            source,
        })?;
        builder = builder.proxy(endpoint);
    }

    builder.build().map_err(FetchError::Request)
}
