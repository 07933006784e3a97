use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod aggregate;
mod bucketing;
mod config;
mod error;
mod event_log;
mod ingest;
mod models;
mod pairing;
mod projections;
mod store;


use aggregate::{activity_series, duration_series, pair_series, ActivityCounts, DurationStats, DurationView};
use bucketing::Granularity;
use config::Config;
use error::ApiError;
use event_log::{EventLog, LogFilter, SharedLog};
use ingest::{parse_json_value, parse_legacy_map, parse_ndjson, ImportBatch};
use models::{ApiResponse, Bucket, Event, ImportFormat, ImportReport, ImportRequest, NameCount, Pair};
use projections::{DeviceStats, EngagementStats, PageTime, Report, ResolutionCount, Summary};
use store::{Store, StoreError};

/// Telemetry analytics API.
/// The in-memory Event Log is the canonical snapshot; the store keeps it across restarts.
/// Every statistic is derived from a snapshot and never written back.
#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    log: Arc<SharedLog>,
    config: Arc<Config>,
}

impl AppState {
    fn new(store: Store, config: Config) -> Self {
        Self {
            store: Arc::new(store),
            log: Arc::new(SharedLog::new()),
            config: Arc::new(config),
        }
    }

    /// Merge every stored event into the in-memory log.
    fn restore(&self) -> Result<usize, StoreError> {
        let stored = self.store.load_all()?;
        Ok(self.log.apply(stored).total)
    }

    /// Current snapshot, narrowed by `filter` when it has any criteria.
    fn scoped(&self, filter: &LogFilter) -> Arc<EventLog> {
        let snapshot = self.log.snapshot();
        if filter.is_empty() {
            snapshot
        } else {
            Arc::new(snapshot.filtered(filter))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "log_monitor=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let store = Store::open(&config.database_path).with_context(|| {
        format!("failed to open event store at {}", config.database_path.display())
    })?;

    let addr = config.addr;
    let state = AppState::new(store, config);
    let restored = state.restore().context("failed to load stored events")?;
    tracing::info!(events = restored, "event log restored");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "log monitor listening");

    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn app(state: AppState) -> Router {
    let body_limit = state.config.body_limit;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/api/logs", post(ingest_logs).get(list_logs))
        .route("/api/import", post(import_files))
        .route("/api/user-agents", get(list_user_agents))
        .route("/api/stats/activity", get(activity_stats))
        .route("/api/stats/durations", get(duration_stats))
        .route("/api/stats/pairs", get(pair_stats))
        .route("/api/stats/summary", get(summary_stats))
        .route("/api/stats/devices", get(device_stats))
        .route("/api/stats/resolutions", get(resolution_stats))
        .route("/api/stats/engagement", get(engagement_stats))
        .route("/api/stats/clicks", get(click_stats))
        .route("/api/stats/page-times", get(page_time_stats))
        .route("/api/report", get(report))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "Log Monitor API v0.1.0"
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let stored = tokio::task::spawn_blocking(move || store.count()).await??;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "events": state.log.snapshot().len(),
        "stored": stored,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct IngestParams {
    source: Option<String>,
}

/// Ingest one batch.
/// NDJSON bodies are parsed line by line; `application/json` bodies may be an array or a
/// single event object.
async fn ingest_logs(
    State(state): State<AppState>,
    Query(params): Query<IngestParams>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<ApiResponse<ImportReport>>), ApiError> {
    let source = params.source.filter(|s| !s.is_empty());
    let is_plain_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    let batch = if is_plain_json {
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;
        parse_json_value(value, source.as_deref())
    } else {
        parse_ndjson(&body, source.as_deref())
    };

    if batch.events.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "No valid log entries found ({} rejected)",
            batch.failures.len()
        )));
    }

    let report = commit(&state, vec![batch]).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(
            format!("Saved {} log entries", report.added),
            report,
        )),
    ))
}

/// Import several files at once.
/// Each file is parsed on its own blocking worker; the batches are then merged in one step.
async fn import_files(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> Result<(StatusCode, Json<ApiResponse<ImportReport>>), ApiError> {
    if request.files.is_empty() {
        return Err(ApiError::BadRequest("no files supplied".to_string()));
    }

    let mut tasks = JoinSet::new();
    for (idx, file) in request.files.into_iter().enumerate() {
        tasks.spawn_blocking(move || {
            let source = Some(file.name.as_str());
            let batch = match file.format {
                ImportFormat::Ndjson => parse_ndjson(&file.content, source),
                ImportFormat::Legacy => parse_legacy_map(&file.content, source),
            };
            tracing::debug!(
                file = %file.name,
                parsed = batch.events.len(),
                failed = batch.failures.len(),
                "file parsed"
            );
            (idx, batch)
        });
    }

    let mut parsed = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        parsed.push(joined?);
    }
    // Fold in request order so first-seen resolution does not depend on worker timing.
    parsed.sort_by_key(|(idx, _)| *idx);
    let batches: Vec<ImportBatch> = parsed.into_iter().map(|(_, batch)| batch).collect();

    let report = commit(&state, batches).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(
            format!("Imported {} new events from {} files", report.added, report.files),
            report,
        )),
    ))
}

/// Merge parsed batches into the shared log and persist the events that were new.
async fn commit(state: &AppState, batches: Vec<ImportBatch>) -> Result<ImportReport, ApiError> {
    let batch_id = Uuid::new_v4();
    let files = batches.len();
    let mut combined = ImportBatch::default();
    for batch in batches {
        combined.extend(batch);
    }

    let parsed = combined.events.len();
    if !combined.failures.is_empty() {
        tracing::warn!(
            %batch_id,
            failed = combined.failures.len(),
            "some records could not be parsed"
        );
    }

    // The snapshot is replaced only after the new events are stored.
    let log = state.log.clone();
    let store = state.store.clone();
    let events = combined.events;
    let (outcome, stored) = tokio::task::spawn_blocking(move || {
        log.apply_persisted(events, |fresh| store.insert(fresh))
    })
    .await??;

    tracing::info!(
        %batch_id,
        files,
        parsed,
        added = outcome.added,
        duplicates = outcome.duplicates,
        stored,
        total = outcome.total,
        "batch merged"
    );

    Ok(ImportReport {
        batch_id,
        files,
        parsed,
        added: outcome.added,
        duplicates: outcome.duplicates,
        total: outcome.total,
        failures: combined.failures,
    })
}

#[derive(Debug, Default, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

/// Query the store, newest first.
async fn list_logs(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let cap = state.config.fetch_limit;
    let limit = params.limit.map_or(cap, |l| l.min(cap));
    let store = state.store.clone();
    let events = tokio::task::spawn_blocking(move || store.fetch(&filter, limit)).await??;
    Ok(Json(events))
}

async fn list_user_agents(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    let store = state.store.clone();
    let agents = tokio::task::spawn_blocking(move || store.user_agents()).await??;
    Ok(Json(agents))
}

#[derive(Debug, Default, Deserialize)]
struct SeriesParams {
    #[serde(default)]
    granularity: Granularity,
    #[serde(default)]
    view: DurationView,
}

#[derive(Debug, Serialize)]
struct SeriesResponse<T> {
    granularity: Granularity,
    bins: Vec<Bucket<T>>,
}

async fn activity_stats(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
    Query(params): Query<SeriesParams>,
) -> Json<SeriesResponse<ActivityCounts>> {
    let log = state.scoped(&filter);
    Json(SeriesResponse {
        granularity: params.granularity,
        bins: activity_series(log.events(), params.granularity),
    })
}

async fn duration_stats(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
    Query(params): Query<SeriesParams>,
) -> Json<SeriesResponse<DurationStats>> {
    let log = state.scoped(&filter);
    Json(SeriesResponse {
        granularity: params.granularity,
        bins: duration_series(log.events(), params.granularity, params.view),
    })
}

#[derive(Debug, Serialize)]
struct PairsResponse {
    granularity: Granularity,
    pairs: Vec<Pair>,
    bins: Vec<Bucket<DurationStats>>,
}

async fn pair_stats(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
    Query(params): Query<SeriesParams>,
) -> Json<PairsResponse> {
    let log = state.scoped(&filter);
    let pairs = pairing::pair(log.events());
    let bins = pair_series(&pairs, params.granularity);
    Json(PairsResponse {
        granularity: params.granularity,
        pairs,
        bins,
    })
}

async fn summary_stats(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
) -> Json<Summary> {
    Json(projections::summary(state.scoped(&filter).events()))
}

async fn device_stats(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
) -> Json<DeviceStats> {
    Json(projections::device_stats(state.scoped(&filter).events()))
}

async fn resolution_stats(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
) -> Json<Vec<ResolutionCount>> {
    Json(projections::resolution_stats(state.scoped(&filter).events()))
}

async fn engagement_stats(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
) -> Json<EngagementStats> {
    Json(projections::engagement_stats(state.scoped(&filter).events()))
}

#[derive(Debug, Default, Deserialize)]
struct ClickParams {
    url: Option<String>,
}

async fn click_stats(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
    Query(params): Query<ClickParams>,
) -> Json<Vec<NameCount>> {
    let url = params.url.filter(|u| !u.is_empty() && u != "all");
    Json(projections::click_breakdown(
        state.scoped(&filter).events(),
        url.as_deref(),
    ))
}

async fn page_time_stats(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
) -> Json<Vec<PageTime>> {
    Json(projections::page_times(state.scoped(&filter).events()))
}

/// Everything the export layer needs in one response.
async fn report(State(state): State<AppState>, Query(filter): Query<LogFilter>) -> Json<Report> {
    Json(projections::report(state.scoped(&filter).events()))
}
