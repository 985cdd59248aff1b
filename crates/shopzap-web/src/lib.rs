//! Axum JSON API over the Shopzap monitor.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use shopzap_core::{MonitoringTask, TaskId};
use shopzap_monitor::{BulkItem, BulkOutcome, Monitor, MonitorConfig, MonitorError, ScrapeReport};
use shopzap_storage::SimpleTokenBucket;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "shopzap-web";

const API_KEY_HEADER: &str = "x-api-key";

/// One token bucket per client address. A client idle for a whole window
/// would be back at full capacity, so its bucket is dropped.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, (Arc<SimpleTokenBucket>, Instant)>>,
}

impl RateLimiter {
    /// `limit` requests per `window`; `None` when `limit` is zero, which disables limiting.
    pub fn new(limit: u32, window: Duration) -> Option<Self> {
        if limit == 0 {
            return None;
        }
        Some(Self {
            capacity: limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    pub fn per_minute(limit: u32) -> Option<Self> {
        Self::new(limit, Duration::from_secs(60))
    }

    pub async fn allow(&self, client: &str) -> bool {
        let bucket = {
            let mut buckets = self.buckets.lock().await;
            buckets.retain(|_, (_, seen)| seen.elapsed() < self.window);
            let (bucket, seen) = buckets.entry(client.to_string()).or_insert_with(|| {
                let refill_every = self.window / self.capacity;
                (Arc::new(SimpleTokenBucket::new(self.capacity, refill_every)), Instant::now())
            });
            *seen = Instant::now();
            bucket.clone()
        };
        bucket.try_take().await
    }

    pub async fn tracked_clients(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

pub struct AppState {
    pub monitor: Arc<Monitor>,
    api_keys: HashSet<String>,
    limiter: Option<RateLimiter>,
}

impl AppState {
    pub fn new(monitor: Arc<Monitor>, api_keys: Vec<String>, rate_limit_per_minute: u32) -> Self {
        Self {
            monitor,
            api_keys: api_keys.into_iter().collect(),
            limiter: RateLimiter::per_minute(rate_limit_per_minute),
        }
    }
}

pub struct ApiError(MonitorError);

impl From<MonitorError> for ApiError {
    fn from(err: MonitorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            MonitorError::Validation(message) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
            MonitorError::ExtractionFailed(message) | MonitorError::NotFound(message) => {
                (StatusCode::NOT_FOUND, json!({ "error": message }))
            }
            MonitorError::Render(_) | MonitorError::Persistence(_) | MonitorError::Internal(_) => {
                error!(error = %self.0, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Failed to process the request.", "details": self.0.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let protected = Router::new()
        .route("/scrape", post(scrape_handler))
        .route("/bulk-scrape", post(bulk_scrape_handler))
        .route("/search", get(search_handler))
        .route("/schedule", post(schedule_handler))
        .route("/schedules", get(list_schedules_handler))
        .route("/schedule/{id}", delete(cancel_schedule_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/", get(health_handler))
        .merge(protected)
        .with_state(state)
}

/// Build the monitor, start its scheduler and serve until Ctrl-C.
pub async fn serve(config: MonitorConfig) -> anyhow::Result<()> {
    let monitor = Arc::new(Monitor::from_config(&config).await?);
    monitor.scheduler().start().await?;

    let state = AppState::new(monitor.clone(), config.api_keys.clone(), config.rate_limit_per_minute);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "server listening");
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "could not listen for shutdown signal");
        }
    })
    .await?;

    monitor.shutdown().await?;
    info!("server stopped");
    Ok(())
}

async fn require_api_key(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let Some(key) = request.headers().get(API_KEY_HEADER) else {
        return reject(StatusCode::UNAUTHORIZED, "Unauthorized: API key is missing.");
    };
    let known = key
        .to_str()
        .map(|k| state.api_keys.contains(k))
        .unwrap_or(false);
    if !known {
        return reject(StatusCode::FORBIDDEN, "Forbidden: Invalid API key.");
    }
    next.run(request).await
}

fn client_address(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn rate_limit(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if let Some(limiter) = &state.limiter {
        let client = client_address(&request);
        if !limiter.allow(&client).await {
            warn!(%client, "rate limit exceeded");
            return reject(
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests from this IP, please try again after a minute.",
            );
        }
    }
    next.run(request).await
}

async fn health_handler() -> &'static str {
    "Shopzap product monitor is running."
}

#[derive(Debug, Deserialize)]
struct ScrapeRequest {
    url: Option<String>,
    selector: Option<String>,
}

async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScrapeRequest>,
) -> Result<Json<ScrapeReport>, ApiError> {
    let url = req.url.unwrap_or_default();
    let report = state
        .monitor
        .pipeline()
        .run(&url, req.selector.as_deref())
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct BulkScrapeRequest {
    #[serde(default)]
    urls: Vec<BulkItem>,
}

async fn bulk_scrape_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BulkScrapeRequest>,
) -> Result<Json<Vec<BulkOutcome>>, ApiError> {
    if req.urls.is_empty() {
        return Err(MonitorError::Validation("An array of URLs is required.".to_string()).into());
    }
    Ok(Json(state.monitor.pipeline().extract_many(req.urls).await))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    site: Option<String>,
    keyword: Option<String>,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Response, ApiError> {
    let site = query.site.unwrap_or_default();
    let keyword = query.keyword.unwrap_or_default();
    let hits = state.monitor.pipeline().search(&site, &keyword).await?;
    Ok(Json(hits).into_response())
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    url: Option<String>,
    selector: Option<String>,
    frequency: Option<String>,
}

async fn schedule_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScheduleRequest>,
) -> Result<Response, ApiError> {
    let task = state
        .monitor
        .scheduler()
        .create_task(
            req.url.as_deref().unwrap_or_default(),
            req.selector.as_deref(),
            req.frequency.as_deref().unwrap_or_default(),
        )
        .await?;
    let body = json!({ "message": "Task scheduled successfully.", "taskId": task.task_id });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn list_schedules_handler(State(state): State<Arc<AppState>>) -> Json<Vec<MonitoringTask>> {
    Json(state.monitor.scheduler().list().await)
}

async fn cancel_schedule_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.monitor.scheduler().cancel(&TaskId::from(id)).await?;
    Ok(Json(json!({ "message": "Task stopped and deleted successfully." })).into_response())
}
