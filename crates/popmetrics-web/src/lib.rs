//! Axum read path over the aggregate view, plus internal endpoints.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use popmetrics_core::AggregateRow;
use popmetrics_storage::{AnalyticsStore, StoreError, TtlCache};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "popmetrics-web";

/// Cache key for the full aggregated model list.
pub const AGGREGATED_CACHE_KEY: &str = "models:aggregated";

/// Key the readiness probe reads to exercise the cache.
pub const HEALTH_CHECK_KEY: &str = "health_check";

/// Display name reported by `/internal/info`.
pub const SERVICE_NAME: &str = "Model Popularity Metrics";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    /// Lifetime of the cached aggregated list. `serve` also drops the entry
    /// after every successful sync cycle, so this only bounds staleness when
    /// syncs fail.
    pub cache_ttl: Duration,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8003,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("POPMETRICS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            cache_ttl: std::env::var("CACHE_DEFAULT_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularModel {
    pub category: String,
    pub total_count: i64,
    pub last_updated: DateTime<Utc>,
    /// Names of the experiments counted under this category.
    pub experiments: Vec<String>,
}

impl PopularModel {
    pub fn new(row: AggregateRow, experiments: Vec<String>) -> Self {
        Self {
            category: row.category,
            total_count: row.total_count,
            last_updated: row.last_updated,
            experiments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedModelsResponse {
    /// Latest extraction time across all categories; `None` before the first sync.
    pub last_extracted: Option<DateTime<Utc>>,
    pub models: Vec<PopularModel>,
}

impl AggregatedModelsResponse {
    /// Read the aggregate view and attach each category's experiment names.
    pub async fn load(analytics: &dyn AnalyticsStore) -> Result<Self, StoreError> {
        let rows = analytics.aggregate_view().await?;
        let last_extracted = rows.iter().map(|row| row.last_updated).max();
        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            let experiments = analytics.member_names(&row.category).await?;
            models.push(PopularModel::new(row, experiments));
        }
        Ok(Self {
            last_extracted,
            models,
        })
    }

    fn truncated(mut self, limit: Option<usize>) -> Self {
        if let Some(limit) = limit {
            self.models.truncate(limit);
        }
        self
    }
}

#[derive(Clone)]
pub struct AppState {
    pub analytics: Arc<dyn AnalyticsStore>,
    pub cache: Arc<TtlCache<AggregatedModelsResponse>>,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

impl AppState {
    pub fn new(analytics: Arc<dyn AnalyticsStore>, cache_ttl: Duration) -> Self {
        Self {
            analytics,
            cache: Arc::new(TtlCache::new(cache_ttl)),
            started_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AggregatedQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/metrics/popular-models/aggregated",
            get(aggregated_models_handler),
        )
        .route("/internal/health", get(health_handler))
        .route("/internal/ready", get(ready_handler))
        .route("/internal/status", get(status_handler))
        .route("/internal/info", get(info_handler))
        .route("/internal/clean_cache", get(clean_cache_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    config: &WebConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "web server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn aggregated_models_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AggregatedQuery>,
) -> Response {
    match state.cache.get(AGGREGATED_CACHE_KEY) {
        Ok(Some(cached)) => {
            debug!(cache_key = AGGREGATED_CACHE_KEY, "cache hit");
            return Json(cached.truncated(query.limit)).into_response();
        }
        Ok(None) => debug!(cache_key = AGGREGATED_CACHE_KEY, "cache miss"),
        Err(err) => warn!(error = %err, "cache unavailable, reading the view directly"),
    }

    let response = match AggregatedModelsResponse::load(state.analytics.as_ref()).await {
        Ok(response) => response,
        Err(err) => return store_error(err),
    };
    if let Err(err) = state.cache.set(AGGREGATED_CACHE_KEY, response.clone(), None) {
        warn!(error = %err, "could not cache aggregated models");
    }
    Json(response.truncated(query.limit)).into_response()
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    let (ready, cache_status) = match state.cache.get(HEALTH_CHECK_KEY) {
        Ok(_) => (true, "ok".to_string()),
        Err(err) => (false, format!("error: {err}")),
    };
    let status = if ready { "ready" } else { "not ready" };
    Json(json!({
        "status": status,
        "dependencies": { "cache": cache_status },
    }))
    .into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let uptime = Utc::now() - state.started_at;
    let mut body = json!({
        "status": "healthy",
        "version": state.version,
        "start_time": state.started_at.to_rfc3339(),
        "uptime_seconds": uptime.num_milliseconds() as f64 / 1000.0,
    });
    match state.cache.stats() {
        Ok(stats) => body["cache"] = json!(stats),
        Err(err) => body["cache"] = json!({ "error": err.to_string() }),
    }
    Json(body).into_response()
}

async fn info_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "name": SERVICE_NAME,
        "version": state.version,
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "license": env!("CARGO_PKG_LICENSE"),
    }))
    .into_response()
}

async fn clean_cache_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.cache.clear() {
        Ok(()) => Json(json!({ "detail": "Cache cleared" })).into_response(),
        Err(err) => {
            error!(error = %err, "cache clear failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "detail": "Cache not ready for cleaning" })),
            )
                .into_response()
        }
    }
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "aggregate view read failed");
    let detail = match err {
        StoreError::ViewMissing(_) => "Aggregated metrics are not available yet",
        _ => "Service temporarily unavailable",
    };
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "detail": detail })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{NaiveDate, TimeZone};
    use http_body_util::BodyExt;
    use popmetrics_core::{MemberRecord, PopularityBucket};
    use popmetrics_storage::{AnalyticsTx, MemoryAnalyticsStore};
    use tower::ServiceExt;

    fn bucket(category: &str, day: u32, count: i64, hour: u32) -> PopularityBucket {
        PopularityBucket {
            bucket_date: NaiveDate::from_ymd_opt(2023, 1, day).unwrap(),
            category: category.to_string(),
            incremental_count: count,
            cumulative_count: count,
            extracted_at: Utc.with_ymd_and_hms(2024, 2, 1, hour, 0, 0).single().unwrap(),
        }
    }

    fn member(id: &str, name: &str, category: &str) -> MemberRecord {
        MemberRecord {
            id: id.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            created_at: NaiveDate::from_ymd_opt(2023, 1, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        }
    }

    async fn seeded_state() -> AppState {
        let store = Arc::new(MemoryAnalyticsStore::new());
        let mut tx = store.begin().await.unwrap();
        tx.insert_members(&[
            member("3", "a003", "EC-Earth"),
            member("1", "a001", "EC-Earth"),
            member("2", "a002", "IFS"),
        ])
        .await
        .unwrap();
        tx.insert_buckets(&[
            bucket("EC-Earth", 1, 3, 1),
            bucket("IFS", 1, 5, 2),
            bucket("CMCC-ESM2", 2, 1, 3),
        ])
        .await
        .unwrap();
        tx.commit().await.unwrap();
        store.provision_aggregate_view().await.unwrap();
        AppState::new(store, Duration::from_secs(60))
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn aggregated_models_sorted_by_total() {
        let app = app(seeded_state().await);
        let (status, body) = get_json(&app, "/v1/metrics/popular-models/aggregated").await;
        assert_eq!(status, StatusCode::OK);

        let response: AggregatedModelsResponse = serde_json::from_value(body).unwrap();
        let categories = response
            .models
            .iter()
            .map(|m| m.category.as_str())
            .collect::<Vec<_>>();
        assert_eq!(categories, vec!["IFS", "EC-Earth", "CMCC-ESM2"]);
        assert_eq!(response.models[0].experiments, vec!["a002"]);
        assert_eq!(response.models[1].experiments, vec!["a001", "a003"]);
        assert!(response.models[2].experiments.is_empty());
        assert_eq!(
            response.last_extracted,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 3, 0, 0).single().unwrap())
        );
    }

    #[tokio::test]
    async fn limit_applies_after_the_cache() {
        let state = seeded_state().await;
        let cache = Arc::clone(&state.cache);
        let app = app(state);

        let (_, limited) = get_json(&app, "/v1/metrics/popular-models/aggregated?limit=1").await;
        assert_eq!(limited["models"].as_array().unwrap().len(), 1);

        let (_, full) = get_json(&app, "/v1/metrics/popular-models/aggregated").await;
        assert_eq!(full["models"].as_array().unwrap().len(), 3);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.keys[AGGREGATED_CACHE_KEY].misses, 1);
        assert_eq!(stats.keys[AGGREGATED_CACHE_KEY].hits, 1);
    }

    #[tokio::test]
    async fn missing_view_is_service_unavailable() {
        let state = AppState::new(Arc::new(MemoryAnalyticsStore::new()), Duration::from_secs(60));
        let cache = Arc::clone(&state.cache);
        let app = app(state);

        let (status, body) = get_json(&app, "/v1/metrics/popular-models/aggregated").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["detail"].as_str().unwrap().contains("not available"));
        assert_eq!(cache.stats().unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn internal_endpoints_report_status() {
        let app = app(seeded_state().await);

        let (status, health) = get_json(&app, "/internal/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "ok");

        let (_, ready) = get_json(&app, "/internal/ready").await;
        assert_eq!(ready["status"], "ready");
        assert_eq!(ready["dependencies"]["cache"], "ok");

        get_json(&app, "/v1/metrics/popular-models/aggregated").await;
        let (_, status_body) = get_json(&app, "/internal/status").await;
        assert_eq!(status_body["status"], "healthy");
        assert_eq!(status_body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(status_body["cache"]["total_entries"], 1);

        let (status, info) = get_json(&app, "/internal/info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["name"], SERVICE_NAME);
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(info["license"], "MIT");
        assert!(!info["description"].as_str().unwrap().is_empty());

        let (_, cleaned) = get_json(&app, "/internal/clean_cache").await;
        assert_eq!(cleaned["detail"], "Cache cleared");
        let (_, status_body) = get_json(&app, "/internal/status").await;
        assert_eq!(status_body["cache"]["total_entries"], 0);
    }
}
