// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Instruments outside the configured
// allow-list and unsupported interval codes are rejected with 422 before any
// upstream or store access.
//
// CORS is configured permissively; the chart front-end is served from a
// different origin.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::ApiError;
use crate::app_state::AppState;
use crate::ingest::BatchReport;
use crate::market_data::{MarketDataClient, SecurityInfo};
use crate::query::{History, StoredCandles};
use crate::types::{parse_wall_clock, Granularity};

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST API router with CORS middleware and shared state.
pub fn router<C: MarketDataClient>(state: Arc<AppState<C>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health::<C>))
        .route("/api/v1/securities/:ticker", get(history::<C>))
        .route("/api/v1/securities/:ticker/stored", get(stored::<C>))
        .route("/api/v1/securities/:ticker/info", get(security_info::<C>))
        .route("/api/v1/ingest", post(ingest::<C>))
        .layer(cors)
        .with_state(state)
}

fn resolve_instrument<C: MarketDataClient>(
    state: &AppState<C>,
    raw: &str,
) -> Result<String, ApiError> {
    state
        .known_instrument(raw)
        .ok_or_else(|| ApiError::Unprocessable(format!("unknown instrument {raw:?}")))
}

fn resolve_interval<C: MarketDataClient>(
    state: &AppState<C>,
    code: Option<u32>,
) -> Result<Granularity, ApiError> {
    state
        .granularity_or_default(code)
        .map_err(|c| ApiError::Unprocessable(format!("unsupported interval {c}")))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    instruments: Vec<String>,
    uptime_secs: u64,
    server_time: i64,
}

async fn health<C: MarketDataClient>(State(state): State<Arc<AppState<C>>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        instruments: state.config.instruments.clone(),
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Securities
// =============================================================================

#[derive(Debug, Deserialize)]
struct HistoryParams {
    interval: Option<u32>,
    from: Option<String>,
}

async fn history<C: MarketDataClient>(
    State(state): State<Arc<AppState<C>>>,
    Path(ticker): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<History>, ApiError> {
    let instrument = resolve_instrument(&state, &ticker)?;
    let granularity = resolve_interval(&state, params.interval)?;
    let from = match params.from.as_deref().filter(|s| !s.trim().is_empty()) {
        None => None,
        Some(raw) => Some(
            parse_wall_clock(raw)
                .ok_or_else(|| ApiError::Unprocessable(format!("invalid from {raw:?}")))?,
        ),
    };

    let history = state.query.history(&instrument, granularity, from).await?;
    Ok(Json(history))
}

#[derive(Debug, Deserialize)]
struct StoredParams {
    interval: Option<u32>,
}

/// Stored candles; the daily store unless an interval is given.
async fn stored<C: MarketDataClient>(
    State(state): State<Arc<AppState<C>>>,
    Path(ticker): Path<String>,
    Query(params): Query<StoredParams>,
) -> Result<Json<StoredCandles>, ApiError> {
    let instrument = resolve_instrument(&state, &ticker)?;
    let granularity = match params.interval {
        None => Granularity::Day,
        code => resolve_interval(&state, code)?,
    };
    Ok(Json(state.query.all_stored(&instrument, granularity)?))
}

async fn security_info<C: MarketDataClient>(
    State(state): State<Arc<AppState<C>>>,
    Path(ticker): Path<String>,
) -> Result<Json<SecurityInfo>, ApiError> {
    let instrument = resolve_instrument(&state, &ticker)?;
    state
        .client
        .fetch_security_info(&instrument)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no security card for {instrument}")))
}

// =============================================================================
// Ingestion trigger (for external schedulers)
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct IngestRequest {
    ticker: Option<String>,
    interval: Option<u32>,
    /// Reload the full lookback instead of resuming after the last candle.
    #[serde(default)]
    all: bool,
}

async fn ingest<C: MarketDataClient>(
    State(state): State<Arc<AppState<C>>>,
    body: Option<Json<IngestRequest>>,
) -> Result<Json<BatchReport>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let granularity = resolve_interval(&state, req.interval)?;
    let instruments = match req.ticker.as_deref() {
        Some(raw) => vec![resolve_instrument(&state, raw)?],
        None => state.config.instruments.clone(),
    };

    info!(
        count = instruments.len(),
        interval = %granularity,
        force_full_reload = req.all,
        "ingestion triggered via API"
    );
    let report = state
        .pipeline
        .run_batch(&instruments, granularity, req.all)
        .await;
    Ok(Json(report))
}

// =============================================================================
// Tests
// =============================================================================
