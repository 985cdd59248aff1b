//! Extraction pipeline, price/stock history, restock alerts and the task scheduler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use shopzap_adapters::{
    AdapterError, AdapterRegistry, HttpRenderer, ProxyPool, RenderError, RenderPool, Renderer,
    SearchHit, WebDriverRenderer, WebDriverSettings,
};
use shopzap_core::{
    restock_message, should_alert, ExtractionRecord, MonitoringTask, Observation, ProductHistory,
    ProductIdentity, StockStatus, TaskId,
};
use shopzap_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, JsonFileStore, PersistedStore, StoreError,
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shopzap-monitor";

const DEFAULT_API_KEYS: &str = "test-key-123,pro-user-456";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const ALERT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Kolkata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    Http,
    WebDriver,
}

impl FromStr for RendererKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "webdriver" | "browser" => Ok(Self::WebDriver),
            other => Err(anyhow!("unknown renderer {other:?}; expected http or webdriver")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub webhook_url: Option<String>,
    pub proxies: Vec<String>,
    pub api_keys: Vec<String>,
    pub renderer: RendererKind,
    pub webdriver_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_sessions: usize,
    pub rate_limit_per_minute: u32,
    pub sites_file: Option<PathBuf>,
    /// Zone the cron expressions of scheduled tasks are evaluated in.
    pub timezone: Tz,
}

impl MonitorConfig {
    /// Read settings from the process environment, after loading `.env` if present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let list = |value: String| {
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        };

        let renderer = match var("SHOPZAP_RENDERER").map(|v| v.parse::<RendererKind>()) {
            Some(Ok(kind)) => kind,
            Some(Err(err)) => {
                warn!(error = %err, "falling back to http renderer");
                RendererKind::Http
            }
            None => RendererKind::Http,
        };

        let timezone = match var("SHOPZAP_TIMEZONE").map(|v| v.trim().parse::<Tz>()) {
            Some(Ok(tz)) => tz,
            Some(Err(err)) => {
                warn!(error = %err, default = %DEFAULT_TIMEZONE, "unknown timezone; using default");
                DEFAULT_TIMEZONE
            }
            None => DEFAULT_TIMEZONE,
        };

        Self {
            port: var("PORT").and_then(|v| v.parse().ok()).unwrap_or(3000),
            db_path: var("SHOPZAP_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./db.json")),
            webhook_url: var("WEBHOOK_URL"),
            proxies: var("PROXY_LIST").map(list).unwrap_or_default(),
            api_keys: list(var("API_KEYS").unwrap_or_else(|| DEFAULT_API_KEYS.to_string())),
            renderer,
            webdriver_url: var("WEBDRIVER_URL")
                .unwrap_or_else(|| "http://localhost:4444".to_string()),
            user_agent: var("SHOPZAP_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: var("SHOPZAP_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_sessions: var("SHOPZAP_MAX_SESSIONS")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),
            rate_limit_per_minute: var("SHOPZAP_RATE_LIMIT_PER_MINUTE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            sites_file: var("SHOPZAP_SITES_FILE").map(PathBuf::from),
            timezone,
        }
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    ExtractionFailed(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<AdapterError> for MonitorError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::DescriptorRequired | AdapterError::UnsupportedSearchSite { .. } => {
                Self::Validation(err.to_string())
            }
            AdapterError::ExtractionFailed { .. } => Self::ExtractionFailed(err.to_string()),
            AdapterError::Render(render) => Self::Render(render),
            AdapterError::InvalidLocator { .. } | AdapterError::InvalidAdapter { .. } => {
                Self::Internal(anyhow!(err.to_string()))
            }
        }
    }
}

/// Outcome of [`HistoryStore::record`].
#[derive(Debug, Clone)]
pub struct RecordedObservation {
    /// Newest observation before this call, read under the same lock as the append.
    pub previous: Option<Observation>,
    pub history: ProductHistory,
    pub appended: bool,
}

/// Capped per-product observation windows, one lock per product.
#[derive(Debug, Default)]
pub struct HistoryStore {
    entries: RwLock<HashMap<ProductIdentity, Arc<Mutex<ProductHistory>>>>,
}

impl HistoryStore {
    pub fn from_histories(histories: Vec<ProductHistory>) -> Self {
        let entries = histories
            .into_iter()
            .map(|mut h| {
                h.enforce_capacity();
                (h.identity.clone(), Arc::new(Mutex::new(h)))
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    async fn existing(&self, identity: &ProductIdentity) -> Option<Arc<Mutex<ProductHistory>>> {
        self.entries.read().await.get(identity).cloned()
    }

    async fn entry(&self, identity: &ProductIdentity) -> Arc<Mutex<ProductHistory>> {
        if let Some(entry) = self.existing(identity).await {
            return entry;
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ProductHistory::new(identity.clone()))))
            .clone()
    }

    /// Append an observation unless both values are absent, evicting beyond the cap.
    pub async fn record(
        &self,
        identity: &ProductIdentity,
        numeric_price: Option<f64>,
        stock_status: Option<StockStatus>,
    ) -> RecordedObservation {
        if numeric_price.is_none() && stock_status.is_none() {
            let history = self
                .get(identity)
                .await
                .unwrap_or_else(|| ProductHistory::new(identity.clone()));
            return RecordedObservation {
                previous: history.latest().cloned(),
                history,
                appended: false,
            };
        }

        let entry = self.entry(identity).await;
        let mut history = entry.lock().await;
        let previous = history.latest().cloned();
        history.push(Observation {
            numeric_price,
            stock_status,
            observed_at: Utc::now(),
        });
        RecordedObservation {
            previous,
            history: history.clone(),
            appended: true,
        }
    }

    pub async fn get(&self, identity: &ProductIdentity) -> Option<ProductHistory> {
        let entry = self.existing(identity).await?;
        let history = entry.lock().await.clone();
        Some(history)
    }

    pub async fn snapshot(&self) -> Vec<ProductHistory> {
        let entries = self
            .entries
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.clone());
        }
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook answered with status {status}")]
    Status { status: u16 },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

/// Posts `{"text": message}` to a chat-style incoming webhook.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": message }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        warn!(%message, "WEBHOOK_URL not configured; notification skipped");
        Ok(())
    }
}

/// Hands alerts to a background worker so delivery never blocks an extraction.
#[derive(Debug)]
pub struct AlertDispatcher {
    queue: std::sync::Mutex<Option<mpsc::Sender<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AlertDispatcher {
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<dyn NotificationSink>, capacity: usize) -> Self {
        let (queue, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match sink.notify(&message).await {
                    Ok(()) => info!("notification sent"),
                    Err(err) => warn!(error = %err, "notification failed"),
                }
            }
            debug!("alert queue closed");
        });
        Self {
            queue: std::sync::Mutex::new(Some(queue)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `message`; returns false when it was dropped.
    pub fn dispatch(&self, message: String) -> bool {
        let Some(queue) = self.queue.lock().ok().and_then(|q| q.clone()) else {
            warn!("alert queue drained; notification dropped");
            return false;
        };
        match queue.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("alert queue full; notification dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("alert worker stopped; notification dropped");
                false
            }
        }
    }

    /// Close the queue and wait until every queued alert has been delivered.
    /// Later dispatches are dropped.
    pub async fn drain(&self) {
        drop(self.queue.lock().ok().and_then(|mut q| q.take()));
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        if let Err(err) = worker.await {
            error!(error = %err, "alert worker panicked");
        }
    }
}

/// Successful extraction plus the product's history after this observation.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeReport {
    #[serde(flatten)]
    pub record: ExtractionRecord,
    pub price_history: Vec<Observation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BulkItem {
    Url(String),
    Target {
        url: String,
        #[serde(default)]
        selector: Option<String>,
    },
}

impl BulkItem {
    pub fn url(&self) -> &str {
        match self {
            Self::Url(url) | Self::Target { url, .. } => url,
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            Self::Url(_) => None,
            Self::Target { selector, .. } => selector.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BulkOutcome {
    Scraped(ScrapeReport),
    Failed { url: String, error: String },
}

/// Extract, record, alert and persist: the path shared by on-demand and scheduled runs.
pub struct MonitorPipeline {
    registry: Arc<AdapterRegistry>,
    pool: RenderPool,
    history: Arc<HistoryStore>,
    store: Arc<dyn PersistedStore>,
    alerts: AlertDispatcher,
    bulk_concurrency: usize,
    persist_lock: Mutex<()>,
}

impl MonitorPipeline {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        pool: RenderPool,
        history: Arc<HistoryStore>,
        store: Arc<dyn PersistedStore>,
        alerts: AlertDispatcher,
        bulk_concurrency: usize,
    ) -> Self {
        Self {
            registry,
            pool,
            history,
            store,
            alerts,
            bulk_concurrency: bulk_concurrency.max(1),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub async fn drain_alerts(&self) {
        self.alerts.drain().await;
    }

    pub async fn run(&self, url: &str, descriptor: Option<&str>) -> Result<ScrapeReport, MonitorError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(MonitorError::Validation("URL is required.".to_string()));
        }
        let plan = self.registry.plan(url, descriptor)?;
        let span = info_span!("extraction", adapter = %plan.adapter, url);

        async move {
            let record = self.pool.extract(&plan).await?;
            let identity = ProductIdentity::from_url(url);
            let recorded = self
                .history
                .record(&identity, record.numeric_price, record.stock_status)
                .await;

            let previous_stock = recorded.previous.as_ref().and_then(|o| o.stock_status);
            if recorded.appended && should_alert(previous_stock, record.stock_status) {
                let name = record.title.as_deref().unwrap_or(url);
                info!(product = name, "restock detected");
                self.alerts.dispatch(restock_message(name, url));
            }

            if recorded.appended {
                self.persist_products().await?;
            }
            debug!(observations = recorded.history.len(), "extraction recorded");
            Ok(ScrapeReport {
                record,
                price_history: recorded.history.observations().to_vec(),
            })
        }
        .instrument(span)
        .await
    }

    async fn persist_products(&self) -> Result<(), MonitorError> {
        let _guard = self.persist_lock.lock().await;
        let products = self.history.snapshot().await;
        self.store.save_products(&products).await.map_err(|err| {
            error!(error = %err, "persistence failure while saving products");
            MonitorError::Persistence(err)
        })
    }

    /// Run every item; results keep input order and failures are reported per item.
    pub async fn extract_many(&self, items: Vec<BulkItem>) -> Vec<BulkOutcome> {
        stream::iter(items)
            .map(|item| async move {
                match self.run(item.url(), item.selector()).await {
                    Ok(report) => BulkOutcome::Scraped(report),
                    Err(err) => BulkOutcome::Failed {
                        url: item.url().to_string(),
                        error: err.to_string(),
                    },
                }
            })
            .buffered(self.bulk_concurrency)
            .collect()
            .await
    }

    pub async fn search(&self, site: &str, keyword: &str) -> Result<Vec<SearchHit>, MonitorError> {
        let keyword = keyword.trim();
        if site.trim().is_empty() || keyword.is_empty() {
            return Err(MonitorError::Validation(
                "Site and keyword query parameters are required.".to_string(),
            ));
        }
        let spec = self.registry.search_spec(site)?;
        let hits = self
            .pool
            .search(spec, keyword)
            .instrument(info_span!("search", site, keyword))
            .await?;
        if hits.is_empty() {
            return Err(MonitorError::NotFound(
                "No products found for this search.".to_string(),
            ));
        }
        Ok(hits)
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    tasks: Vec<MonitoringTask>,
    triggers: HashMap<TaskId, Uuid>,
}

/// Owns every monitoring task and its single live trigger.
pub struct TaskScheduler {
    sched: JobScheduler,
    pipeline: Arc<MonitorPipeline>,
    store: Arc<dyn PersistedStore>,
    timezone: Tz,
    state: Mutex<SchedulerState>,
}

/// The cron parser wants a leading seconds field; classic five-field
/// expressions fire at second zero.
pub fn cron_with_seconds(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

impl TaskScheduler {
    pub async fn new(
        pipeline: Arc<MonitorPipeline>,
        store: Arc<dyn PersistedStore>,
        timezone: Tz,
    ) -> Result<Self, MonitorError> {
        let sched = JobScheduler::new()
            .await
            .map_err(|e| anyhow!("creating scheduler: {e}"))?;
        Ok(Self {
            sched,
            pipeline,
            store,
            timezone,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    fn build_job(&self, task: &MonitoringTask) -> Result<Job, MonitorError> {
        let pipeline = self.pipeline.clone();
        let fired = task.clone();
        let schedule = cron_with_seconds(&task.trigger_schedule);
        Job::new_async_tz(schedule.as_str(), self.timezone, move |_job_id, _sched| {
            let pipeline = pipeline.clone();
            let task = fired.clone();
            Box::pin(async move { run_scheduled(&pipeline, &task).await })
        })
        .map_err(|e| {
            MonitorError::Validation(format!(
                "Invalid cron frequency {:?}: {e}",
                task.trigger_schedule
            ))
        })
    }

    /// Create the trigger for `task` unless one is already live. Returns whether a
    /// trigger was created.
    pub async fn register(&self, task: &MonitoringTask) -> Result<bool, MonitorError> {
        let mut state = self.state.lock().await;
        if state.triggers.contains_key(&task.task_id) {
            info!(task_id = %task.task_id, "task already scheduled");
            return Ok(false);
        }
        let job = self.build_job(task)?;
        let job_id = self
            .sched
            .add(job)
            .await
            .map_err(|e| anyhow!("adding trigger for task {}: {e}", task.task_id))?;
        state.triggers.insert(task.task_id.clone(), job_id);
        if !state.tasks.iter().any(|t| t.task_id == task.task_id) {
            state.tasks.push(task.clone());
        }
        info!(task_id = %task.task_id, url = %task.target_url, schedule = %task.trigger_schedule, "task scheduled");
        Ok(true)
    }

    /// Validate, register and persist a new task.
    pub async fn create_task(
        &self,
        url: &str,
        descriptor: Option<&str>,
        schedule: &str,
    ) -> Result<MonitoringTask, MonitorError> {
        let url = url.trim();
        let schedule = schedule.trim();
        if url.is_empty() || schedule.is_empty() {
            return Err(MonitorError::Validation(
                "URL and frequency are required.".to_string(),
            ));
        }
        let descriptor = descriptor.map(str::trim).filter(|d| !d.is_empty());
        self.pipeline.registry().plan(url, descriptor)?;

        let task = MonitoringTask::new(url, descriptor.map(ToString::to_string), schedule);
        self.register(&task).await?;
        self.persist_tasks().await?;
        Ok(task)
    }

    /// Stop the trigger and forget the task. In-flight runs are allowed to finish.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<(), MonitorError> {
        {
            let mut state = self.state.lock().await;
            let Some(position) = state.tasks.iter().position(|t| &t.task_id == task_id) else {
                return Err(MonitorError::NotFound("Task not found.".to_string()));
            };
            if let Some(job_id) = state.triggers.remove(task_id) {
                if let Err(err) = self.sched.remove(&job_id).await {
                    warn!(%task_id, error = %err, "trigger was already stopped");
                }
                info!(%task_id, "trigger stopped");
            }
            state.tasks.remove(position);
        }
        self.persist_tasks().await
    }

    /// Register every task. A task whose schedule no longer parses stays listed
    /// and persisted, just without a trigger.
    pub async fn restore_all(&self, tasks: &[MonitoringTask]) -> usize {
        let mut created = 0;
        for task in tasks {
            match self.register(task).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(task_id = %task.task_id, error = %err, "could not restore trigger; task kept inactive");
                    let mut state = self.state.lock().await;
                    if !state.tasks.iter().any(|t| t.task_id == task.task_id) {
                        state.tasks.push(task.clone());
                    }
                }
            }
        }
        info!(restored = created, persisted = tasks.len(), "scheduled tasks restored");
        created
    }

    pub async fn list(&self) -> Vec<MonitoringTask> {
        self.state.lock().await.tasks.clone()
    }

    pub async fn trigger_count(&self) -> usize {
        self.state.lock().await.triggers.len()
    }

    pub async fn is_active(&self, task_id: &TaskId) -> bool {
        self.state.lock().await.triggers.contains_key(task_id)
    }

    /// Run a task once outside its schedule, with the same failure handling as a timed fire.
    pub async fn fire_now(&self, task_id: &TaskId) -> Result<(), MonitorError> {
        let task = self
            .state
            .lock()
            .await
            .tasks
            .iter()
            .find(|t| &t.task_id == task_id)
            .cloned()
            .ok_or_else(|| MonitorError::NotFound("Task not found.".to_string()))?;
        run_scheduled(&self.pipeline, &task).await;
        Ok(())
    }

    async fn persist_tasks(&self) -> Result<(), MonitorError> {
        let tasks = self.list().await;
        self.store.save_tasks(&tasks).await.map_err(|err| {
            error!(error = %err, "persistence failure while saving tasks");
            MonitorError::Persistence(err)
        })
    }

    pub async fn start(&self) -> Result<(), MonitorError> {
        self.sched
            .start()
            .await
            .map_err(|e| anyhow!("starting scheduler: {e}"))?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        let mut sched = self.sched.clone();
        sched
            .shutdown()
            .await
            .map_err(|e| anyhow!("stopping scheduler: {e}"))?;
        Ok(())
    }
}

async fn run_scheduled(pipeline: &MonitorPipeline, task: &MonitoringTask) {
    info!(task_id = %task.task_id, url = %task.target_url, "scheduled extraction started");
    match pipeline
        .run(&task.target_url, task.field_descriptor.as_deref())
        .await
    {
        Ok(report) => info!(
            task_id = %task.task_id,
            price = ?report.record.numeric_price,
            stock = ?report.record.stock_status,
            "scheduled extraction finished"
        ),
        Err(err) => error!(task_id = %task.task_id, error = %err, "scheduled extraction failed"),
    }
}

/// Collaborators for a [`Monitor`]; [`MonitorParts::new`] fills in the defaults.
pub struct MonitorParts {
    pub registry: AdapterRegistry,
    pub renderer: Arc<dyn Renderer>,
    pub store: Arc<dyn PersistedStore>,
    pub sink: Arc<dyn NotificationSink>,
    pub proxies: ProxyPool,
    pub max_sessions: usize,
    pub timezone: Tz,
}

impl MonitorParts {
    pub fn new(renderer: Arc<dyn Renderer>, store: Arc<dyn PersistedStore>) -> Self {
        Self {
            registry: AdapterRegistry::builtin(),
            renderer,
            store,
            sink: Arc::new(LogSink),
            proxies: ProxyPool::default(),
            max_sessions: 4,
            timezone: DEFAULT_TIMEZONE,
        }
    }
}

/// Process-lifetime context: one pipeline, one scheduler, one store.
pub struct Monitor {
    pipeline: Arc<MonitorPipeline>,
    scheduler: Arc<TaskScheduler>,
    store: Arc<dyn PersistedStore>,
}

impl Monitor {
    /// Load persisted state and re-register persisted tasks. The scheduler is not started.
    pub async fn assemble(parts: MonitorParts) -> Result<Self, MonitorError> {
        let history = Arc::new(HistoryStore::from_histories(
            parts.store.load_products().await?,
        ));
        let pool = RenderPool::new(parts.renderer, parts.max_sessions, parts.proxies);
        let pipeline = Arc::new(MonitorPipeline::new(
            Arc::new(parts.registry),
            pool,
            history,
            parts.store.clone(),
            AlertDispatcher::spawn(parts.sink, ALERT_QUEUE_CAPACITY),
            parts.max_sessions,
        ));
        let scheduler = Arc::new(
            TaskScheduler::new(pipeline.clone(), parts.store.clone(), parts.timezone).await?,
        );
        let tasks = parts.store.load_tasks().await?;
        scheduler.restore_all(&tasks).await;
        Ok(Self {
            pipeline,
            scheduler,
            store: parts.store,
        })
    }

    pub async fn from_config(config: &MonitorConfig) -> anyhow::Result<Self> {
        let registry = match &config.sites_file {
            Some(path) => AdapterRegistry::with_extra(AdapterRegistry::load_sites_file(path)?)?,
            None => AdapterRegistry::builtin(),
        };

        let renderer: Arc<dyn Renderer> = match config.renderer {
            RendererKind::Http => {
                let fetcher = HttpFetcher::new(fetcher_config(config))?;
                Arc::new(HttpRenderer::new(Arc::new(fetcher)))
            }
            RendererKind::WebDriver => Arc::new(WebDriverRenderer::new(WebDriverSettings {
                server_url: config.webdriver_url.clone(),
                ..Default::default()
            })),
        };

        let store = JsonFileStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening store {}", config.db_path.display()))?;
        let sink: Arc<dyn NotificationSink> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookSink::new(url.clone())?),
            None => Arc::new(LogSink),
        };

        let monitor = Self::assemble(MonitorParts {
            registry,
            renderer,
            store: Arc::new(store),
            sink,
            proxies: ProxyPool::new(config.proxies.clone()),
            max_sessions: config.max_sessions,
            timezone: config.timezone,
        })
        .await?;
        Ok(monitor)
    }

    pub fn pipeline(&self) -> &Arc<MonitorPipeline> {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn PersistedStore> {
        &self.store
    }

    /// Stop firing triggers, then deliver the alerts still queued.
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        let stopped = self.scheduler.shutdown().await;
        self.pipeline.drain_alerts().await;
        stopped
    }
}

/// Page fetches for the http renderer. A failed extraction is reported to the
/// caller rather than retried, so the fetcher makes exactly one attempt.
pub fn fetcher_config(config: &MonitorConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        per_site_concurrency: config.max_sessions,
        backoff: BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        },
        ..HttpClientConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopzap_adapters::StaticRenderer;
    use shopzap_storage::{MemoryStore, StoreDocument};

    const P1: &str = "https://www.amazon.in/dp/P1";

    fn amazon_page(title: &str, price: &str, availability: &str) -> String {
        format!(
            r#"<html><body><span id="productTitle">{title}</span>
            <span class="a-price-whole">{price}</span>
            <div id="availability"><span>{availability}</span></div></body></html>"#
        )
    }

    #[derive(Default)]
    struct RecordingSink {
        messages: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, message: &str) -> Result<(), NotifyError> {
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    async fn wait_for_messages(sink: &RecordingSink, expected: usize) -> Vec<String> {
        for _ in 0..50 {
            if sink.messages().len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sink.messages()
    }

    async fn monitor_with(
        renderer: StaticRenderer,
        store: Arc<MemoryStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Monitor {
        monitor_rendering(Arc::new(renderer), store, sink).await
    }

    async fn monitor_rendering(
        renderer: Arc<dyn Renderer>,
        store: Arc<MemoryStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Monitor {
        let mut parts = MonitorParts::new(renderer, store);
        parts.sink = sink;
        Monitor::assemble(parts).await.unwrap()
    }

    /// Holds every page open for `delay` before handing it over.
    struct SlowRenderer {
        inner: StaticRenderer,
        delay: Duration,
    }

    #[async_trait]
    impl Renderer for SlowRenderer {
        async fn open(
            &self,
            url: &str,
            proxy: Option<&str>,
        ) -> Result<Box<dyn shopzap_adapters::PageHandle>, RenderError> {
            tokio::time::sleep(self.delay).await;
            self.inner.open(url, proxy).await
        }
    }

    fn out_of_stock_history(url: &str) -> ProductHistory {
        let mut history = ProductHistory::new(ProductIdentity::from_url(url));
        history.push(Observation {
            numeric_price: Some(499.0),
            stock_status: Some(StockStatus::OutOfStock),
            observed_at: Utc::now(),
        });
        history
    }

    #[tokio::test]
    async fn restock_fires_exactly_one_alert() {
        let store = Arc::new(MemoryStore::with_document(StoreDocument {
            products: vec![out_of_stock_history(P1)],
            scheduled_tasks: Vec::new(),
        }));
        let sink = Arc::new(RecordingSink::default());
        let renderer = StaticRenderer::new().with_page(P1, amazon_page("Widget", "₹499", "In stock"));
        let monitor = monitor_with(renderer, store.clone(), sink.clone()).await;

        let report = monitor.pipeline().run(P1, None).await.unwrap();
        assert_eq!(report.price_history.len(), 2);
        assert_eq!(report.record.stock_status, Some(StockStatus::InStock));

        // InStock -> InStock must not fire again.
        monitor.pipeline().run(P1, None).await.unwrap();

        let messages = wait_for_messages(&sink, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.messages().len(), 1);
        assert_eq!(messages[0], format!("Stock Alert: Widget is now IN STOCK! \n{P1}"));

        let saved = store.document().await;
        assert_eq!(saved.products[0].len(), 3);
    }

    #[tokio::test]
    async fn drain_delivers_alerts_still_queued() {
        struct SlowSink {
            inner: RecordingSink,
        }

        #[async_trait]
        impl NotificationSink for SlowSink {
            async fn notify(&self, message: &str) -> Result<(), NotifyError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.inner.notify(message).await
            }
        }

        let sink = Arc::new(SlowSink {
            inner: RecordingSink::default(),
        });
        let alerts = AlertDispatcher::spawn(sink.clone(), 4);
        assert!(alerts.dispatch("first".to_string()));
        assert!(alerts.dispatch("second".to_string()));

        alerts.drain().await;
        assert_eq!(sink.inner.messages(), vec!["first", "second"]);
        assert!(!alerts.dispatch("late".to_string()));
        // Draining twice is harmless.
        alerts.drain().await;
    }

    #[tokio::test]
    async fn loaded_histories_are_capped() {
        let observations = (0..8)
            .map(|minute| {
                serde_json::json!({
                    "price": minute,
                    "stock": "In Stock",
                    "timestamp": format!("2024-05-01T10:{minute:02}:00Z"),
                })
            })
            .collect::<Vec<_>>();
        let loaded: ProductHistory =
            serde_json::from_value(serde_json::json!({ "id": P1, "history": observations })).unwrap();
        assert_eq!(loaded.len(), 8);

        let history = HistoryStore::from_histories(vec![loaded]);
        let kept = history.get(&ProductIdentity::from_url(P1)).await.unwrap();
        let prices = kept
            .observations()
            .iter()
            .map(|o| o.numeric_price)
            .collect::<Vec<_>>();
        assert_eq!(prices, vec![Some(3.0), Some(4.0), Some(5.0), Some(6.0), Some(7.0)]);
    }

    #[tokio::test]
    async fn concurrent_records_for_one_product_are_serialized() {
        let history = Arc::new(HistoryStore::default());
        let identity = ProductIdentity::from_url(P1);
        let runs = (0..20).map(|i| {
            let history = history.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                history
                    .record(&identity, Some(f64::from(i)), Some(StockStatus::InStock))
                    .await
            })
        });
        let results = futures::future::join_all(runs).await;
        let with_previous = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|r| r.previous.is_some())
            .count();
        // Exactly one writer saw an empty history.
        assert_eq!(with_previous, 19);
        assert_eq!(history.get(&identity).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn empty_observation_neither_appends_nor_creates_history() {
        let history = HistoryStore::default();
        let identity = ProductIdentity::from_url("https://shop.example.org/x");
        let recorded = history.record(&identity, None, None).await;
        assert!(!recorded.appended);
        assert!(recorded.history.is_empty());
        assert!(history.get(&identity).await.is_none());
        assert!(history.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn partial_record_without_price_or_stock_skips_history() {
        let store = Arc::new(MemoryStore::new());
        let url = "https://www.amazon.in/dp/X";
        let renderer = StaticRenderer::new()
            .with_page(url, r#"<span id="productTitle">Widget</span>"#);
        let monitor = monitor_with(renderer, store.clone(), Arc::new(LogSink)).await;
        let report = monitor.pipeline().run(url, None).await.unwrap();
        assert_eq!(report.record.title.as_deref(), Some("Widget"));
        assert!(report.price_history.is_empty());
        assert!(store.document().await.products.is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_is_surfaced_but_memory_keeps_the_observation() {
        let store = Arc::new(MemoryStore::new());
        let renderer = StaticRenderer::new().with_page(P1, amazon_page("Widget", "₹10", "In stock"));
        let monitor = monitor_with(renderer, store.clone(), Arc::new(LogSink)).await;
        store.set_fail_writes(true);

        let err = monitor.pipeline().run(P1, None).await.unwrap_err();
        assert!(matches!(err, MonitorError::Persistence(_)));
        let kept = monitor
            .pipeline()
            .history()
            .get(&ProductIdentity::from_url(P1))
            .await
            .unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn errors_map_to_taxonomy() {
        let renderer = StaticRenderer::new().with_page(P1, "<html><body></body></html>");
        let monitor = monitor_with(renderer, Arc::new(MemoryStore::new()), Arc::new(LogSink)).await;
        let pipeline = monitor.pipeline();

        assert!(matches!(
            pipeline.run("https://shop.example.org/item", None).await,
            Err(MonitorError::Validation(_))
        ));
        assert!(matches!(pipeline.run(P1, None).await, Err(MonitorError::ExtractionFailed(_))));
        assert!(matches!(
            pipeline.run("https://www.flipkart.com/p/unknown", None).await,
            Err(MonitorError::Render(_))
        ));
        assert!(matches!(
            pipeline.search("ebay", "phone").await,
            Err(MonitorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn bulk_extraction_keeps_input_order() {
        let renderer = StaticRenderer::new()
            .with_page(P1, amazon_page("Widget", "₹10", "In stock"))
            .with_page("https://shop.example.org/a", r#"<b class="deal">50% off</b>"#);
        let monitor = monitor_with(renderer, Arc::new(MemoryStore::new()), Arc::new(LogSink)).await;

        let items = serde_json::from_value::<Vec<BulkItem>>(serde_json::json!([
            P1,
            "https://shop.example.org/a",
            {"url": "https://shop.example.org/a", "selector": ".deal"},
        ]))
        .unwrap();
        let outcomes = monitor.pipeline().extract_many(items).await;

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(&outcomes[0], BulkOutcome::Scraped(r) if r.record.title.as_deref() == Some("Widget")));
        assert!(matches!(&outcomes[1], BulkOutcome::Failed { url, .. } if url == "https://shop.example.org/a"));
        assert!(matches!(&outcomes[2], BulkOutcome::Scraped(r) if r.record.data.as_deref() == Some("50% off")));
    }

    #[tokio::test]
    async fn registering_twice_keeps_one_trigger() {
        let monitor = monitor_with(StaticRenderer::new(), Arc::new(MemoryStore::new()), Arc::new(LogSink)).await;
        let scheduler = monitor.scheduler();
        let task = MonitoringTask::new(P1, None, "0 */5 * * * *");

        assert!(scheduler.register(&task).await.unwrap());
        assert!(!scheduler.register(&task).await.unwrap());
        assert_eq!(scheduler.trigger_count().await, 1);
        assert_eq!(scheduler.list().await.len(), 1);
    }

    #[tokio::test]
    async fn cancelling_unknown_task_is_not_found_and_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor_with(StaticRenderer::new(), store.clone(), Arc::new(LogSink)).await;
        let scheduler = monitor.scheduler();
        let task = scheduler.create_task(P1, None, "0 0 * * * *").await.unwrap();

        let err = scheduler.cancel(&TaskId::from("missing")).await.unwrap_err();
        assert!(matches!(err, MonitorError::NotFound(_)));
        assert_eq!(scheduler.trigger_count().await, 1);
        assert_eq!(store.document().await.scheduled_tasks, vec![task.clone()]);

        scheduler.cancel(&task.task_id).await.unwrap();
        assert_eq!(scheduler.trigger_count().await, 0);
        assert!(store.document().await.scheduled_tasks.is_empty());
        assert!(matches!(scheduler.cancel(&task.task_id).await, Err(MonitorError::NotFound(_))));
    }

    #[tokio::test]
    async fn persisted_tasks_restore_to_one_trigger_each() {
        let store = Arc::new(MemoryStore::new());
        let first = monitor_with(StaticRenderer::new(), store.clone(), Arc::new(LogSink)).await;
        let mut ids = Vec::new();
        for url in [P1, "https://www.flipkart.com/p/itm2", "https://www.myntra.com/3"] {
            let task = first.scheduler().create_task(url, None, "0 0 9 * * *").await.unwrap();
            ids.push(task.task_id);
        }

        let restored = monitor_with(StaticRenderer::new(), store.clone(), Arc::new(LogSink)).await;
        let scheduler = restored.scheduler();
        assert_eq!(scheduler.trigger_count().await, 3);
        for id in &ids {
            assert!(scheduler.is_active(id).await);
        }

        let tasks = store.document().await.scheduled_tasks;
        assert_eq!(scheduler.restore_all(&tasks).await, 0);
        assert_eq!(scheduler.trigger_count().await, 3);
    }

    #[test]
    fn five_field_cron_gains_a_seconds_field() {
        assert_eq!(cron_with_seconds("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(cron_with_seconds(" 0 9 * * 1 "), "0 0 9 * * 1");
        assert_eq!(cron_with_seconds("30 0 9 * * *"), "30 0 9 * * *");
    }

    #[tokio::test]
    async fn five_field_schedule_is_accepted_and_restored() {
        let store = Arc::new(MemoryStore::new());
        let first = monitor_with(StaticRenderer::new(), store.clone(), Arc::new(LogSink)).await;
        let task = first
            .scheduler()
            .create_task(P1, None, "*/5 * * * *")
            .await
            .unwrap();
        assert_eq!(task.trigger_schedule, "*/5 * * * *");
        assert_eq!(store.document().await.scheduled_tasks[0].trigger_schedule, "*/5 * * * *");

        let restored = monitor_with(StaticRenderer::new(), store.clone(), Arc::new(LogSink)).await;
        assert!(restored.scheduler().is_active(&task.task_id).await);
    }

    #[tokio::test]
    async fn unparseable_persisted_task_survives_restore() {
        let broken = MonitoringTask::new(P1, None, "every tuesday");
        let store = Arc::new(MemoryStore::with_document(StoreDocument {
            products: Vec::new(),
            scheduled_tasks: vec![broken.clone()],
        }));
        let monitor = monitor_with(StaticRenderer::new(), store.clone(), Arc::new(LogSink)).await;
        let scheduler = monitor.scheduler();
        assert!(!scheduler.is_active(&broken.task_id).await);
        assert_eq!(scheduler.list().await, vec![broken.clone()]);

        // Persisting for an unrelated task keeps the inactive one on disk.
        let other = scheduler.create_task(P1, None, "0 0 9 * * *").await.unwrap();
        assert_eq!(store.document().await.scheduled_tasks, vec![broken.clone(), other]);

        scheduler.cancel(&broken.task_id).await.unwrap();
        assert_eq!(store.document().await.scheduled_tasks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_trigger_fires_until_cancelled() {
        let renderer = Arc::new(
            StaticRenderer::new().with_page(P1, amazon_page("Widget", "₹10", "In stock")),
        );
        let monitor =
            monitor_rendering(renderer.clone(), Arc::new(MemoryStore::new()), Arc::new(LogSink)).await;
        let scheduler = monitor.scheduler();
        let task = scheduler.create_task(P1, None, "* * * * * *").await.unwrap();
        scheduler.start().await.unwrap();

        for _ in 0..50 {
            if renderer.opened() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(renderer.opened() > 0, "trigger never fired");

        scheduler.cancel(&task.task_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let after_cancel = renderer.opened();
        tokio::time::sleep(Duration::from_millis(2_200)).await;
        assert_eq!(renderer.opened(), after_cancel);

        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_lets_an_in_flight_run_finish() {
        let renderer = Arc::new(SlowRenderer {
            inner: StaticRenderer::new().with_page(P1, amazon_page("Widget", "₹10", "In stock")),
            delay: Duration::from_millis(200),
        });
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor_rendering(renderer, store.clone(), Arc::new(LogSink)).await;
        let scheduler = monitor.scheduler().clone();
        let task = scheduler.create_task(P1, None, "0 0 9 * * *").await.unwrap();

        let running = {
            let scheduler = scheduler.clone();
            let task_id = task.task_id.clone();
            tokio::spawn(async move { scheduler.fire_now(&task_id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.cancel(&task.task_id).await.unwrap();
        assert!(!scheduler.is_active(&task.task_id).await);

        running.await.unwrap().unwrap();
        let document = store.document().await;
        assert!(document.scheduled_tasks.is_empty());
        assert_eq!(document.products.len(), 1);
        assert_eq!(document.products[0].len(), 1);
    }

    #[tokio::test]
    async fn invalid_schedule_or_missing_descriptor_is_rejected_before_persisting() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor_with(StaticRenderer::new(), store.clone(), Arc::new(LogSink)).await;
        let scheduler = monitor.scheduler();

        let bad_cron = scheduler.create_task(P1, None, "every tuesday").await;
        assert!(matches!(bad_cron, Err(MonitorError::Validation(_))));
        let no_selector = scheduler
            .create_task("https://shop.example.org/item", None, "0 0 * * * *")
            .await;
        assert!(matches!(no_selector, Err(MonitorError::Validation(_))));

        assert_eq!(scheduler.trigger_count().await, 0);
        assert!(store.document().await.scheduled_tasks.is_empty());
    }

    #[tokio::test]
    async fn failed_scheduled_run_keeps_the_task_active() {
        let monitor = monitor_with(StaticRenderer::new(), Arc::new(MemoryStore::new()), Arc::new(LogSink)).await;
        let scheduler = monitor.scheduler();
        let task = scheduler.create_task(P1, None, "0 0 * * * *").await.unwrap();

        scheduler.fire_now(&task.task_id).await.unwrap();
        assert!(scheduler.is_active(&task.task_id).await);
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = MonitorConfig::from_lookup(|_| None);
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("./db.json"));
        assert_eq!(config.api_keys, vec!["test-key-123", "pro-user-456"]);
        assert_eq!(config.renderer, RendererKind::Http);
        assert_eq!(config.max_sessions, 4);
        assert_eq!(config.rate_limit_per_minute, 20);
        assert!(config.proxies.is_empty());
        assert!(config.webhook_url.is_none());
        assert_eq!(config.timezone, chrono_tz::Asia::Kolkata);

        let env = HashMap::from([
            ("PORT", "8080"),
            ("PROXY_LIST", "http://p1:80, ,http://p2:80"),
            ("SHOPZAP_RENDERER", "webdriver"),
            ("WEBHOOK_URL", "https://hooks.example.org/x"),
            ("SHOPZAP_TIMEZONE", "UTC"),
        ]);
        let config = MonitorConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.port, 8080);
        assert_eq!(config.proxies, vec!["http://p1:80", "http://p2:80"]);
        assert_eq!(config.renderer, RendererKind::WebDriver);
        assert_eq!(config.webhook_url.as_deref(), Some("https://hooks.example.org/x"));
        assert_eq!(config.timezone, chrono_tz::UTC);

        let config = MonitorConfig::from_lookup(|k| {
            (k == "SHOPZAP_TIMEZONE").then(|| "Mars/Olympus".to_string())
        });
        assert_eq!(config.timezone, DEFAULT_TIMEZONE);
    }

    #[test]
    fn page_fetches_are_not_retried() {
        let config = MonitorConfig::from_lookup(|k| {
            (k == "SHOPZAP_HTTP_TIMEOUT_SECS").then(|| "7".to_string())
        });
        let fetcher = fetcher_config(&config);
        assert_eq!(fetcher.backoff.max_retries, 0);
        assert_eq!(fetcher.timeout, Duration::from_secs(7));
        assert_eq!(fetcher.per_site_concurrency, config.max_sessions);
    }
}
