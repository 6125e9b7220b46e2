//! HTTP query API
//!
//! Read-only JSON endpoints over the prediction service and the tick store.
//! Failures cross this boundary as structured `{"error": ...}` bodies with
//! the appropriate status code, never as unstructured panics.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::aggregate::Aggregator;
use crate::prediction::PredictionService;
use crate::store::TickStore;
use crate::types::{Exchange, OracleConfig};

const BACKTEST_MAX_SAMPLES: usize = 1_000;

/// Shared state for the API handlers
pub struct ApiState {
    pub service: PredictionService,
    pub aggregator: Aggregator,
    pub store: TickStore,
}

/// Structured error response
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }

    fn internal(error: anyhow::Error) -> Self {
        tracing::error!(error = %error, "Internal error serving request");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Create the API router with all endpoints
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/price/:symbol", get(get_price))
        .route("/priceAt/:symbol", get(get_price_at))
        .route("/oracles", get(get_oracles))
        .route("/oracles/:chain_id/:addr/prediction", get(get_prediction))
        .route(
            "/oracles/:chain_id/:addr/predictionAt",
            get(get_prediction_at),
        )
        .route("/metrics", get(get_metrics))
        .route("/metrics/backtest", get(get_backtest))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn lookup_oracle(state: &ApiState, chain_id: u64, addr: &str) -> Result<OracleConfig, ApiError> {
    let oracle_addr: Address = addr
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid oracle address {addr}")))?;
    state
        .store
        .get_oracle_config(chain_id, oracle_addr)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("unknown oracle {chain_id}/{addr}")))
}

// ─────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────

/// GET /price/:symbol - Aggregated price now
async fn get_price(
    Path(symbol): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> ApiResult<crate::prediction::PriceSummary> {
    let summary = state
        .service
        .price_now(&symbol, now_ms())
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::unavailable(format!("no price available for {symbol}")))?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct PriceAtQuery {
    ts: Option<i64>,
    lag: Option<i64>,
    sources: Option<String>,
    weights: Option<String>,
}

#[derive(Debug, Serialize)]
struct PriceAtResponse {
    symbol: String,
    ts: i64,
    lag_ms: i64,
    price: f64,
    used_weight: f64,
    sources: Vec<SourcePrice>,
}

#[derive(Debug, Serialize)]
struct SourcePrice {
    source: Exchange,
    price: f64,
}

/// GET /priceAt/:symbol?ts=&lag=&sources=&weights= - Ad-hoc weighted price at
/// a timestamp, with optional caller-supplied source/weight override
async fn get_price_at(
    Path(symbol): Path<String>,
    Query(query): Query<PriceAtQuery>,
    State(state): State<Arc<ApiState>>,
) -> ApiResult<PriceAtResponse> {
    let ts = query
        .ts
        .ok_or_else(|| ApiError::bad_request("ts query parameter is required"))?;
    let lag_ms = query.lag.unwrap_or(0);
    if lag_ms < 0 {
        return Err(ApiError::bad_request("lag must be non-negative"));
    }

    let weights = match (query.sources, query.weights) {
        (None, None) => {
            let n = Exchange::all().len() as f64;
            Exchange::all().into_iter().map(|s| (s, 1.0 / n)).collect()
        }
        (Some(sources), Some(weights)) => parse_weight_override(&sources, &weights)?,
        _ => {
            return Err(ApiError::bad_request(
                "sources and weights must be supplied together",
            ))
        }
    };

    let combined = state
        .aggregator
        .weighted_at(&symbol, ts - lag_ms, &weights)
        .map_err(ApiError::internal)?
        .ok_or_else(|| {
            ApiError::unavailable(format!("no source has coverage for {symbol} at {ts}"))
        })?;

    Ok(Json(PriceAtResponse {
        symbol,
        ts,
        lag_ms,
        price: combined.value,
        used_weight: combined.used_weight,
        sources: combined
            .per_source
            .into_iter()
            .map(|(source, price)| SourcePrice { source, price })
            .collect(),
    }))
}

fn parse_weight_override(
    sources: &str,
    weights: &str,
) -> Result<Vec<(Exchange, f64)>, ApiError> {
    let sources: Vec<Exchange> = sources
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Exchange::from_str(s).ok_or_else(|| ApiError::bad_request(format!("unknown source {s}")))
        })
        .collect::<Result<_, _>>()?;
    let weights: Vec<f64> = weights
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| ApiError::bad_request(format!("invalid weight {s}")))
        })
        .collect::<Result<_, _>>()?;

    if sources.len() != weights.len() || sources.is_empty() {
        return Err(ApiError::bad_request(
            "sources and weights must be non-empty lists of equal length",
        ));
    }
    if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
        return Err(ApiError::bad_request("weights must be non-negative"));
    }
    Ok(sources.into_iter().zip(weights).collect())
}

/// GET /oracles - Configured oracles
async fn get_oracles(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<OracleConfig>> {
    let configs = state.store.list_oracle_configs().map_err(ApiError::internal)?;
    Ok(Json(configs))
}

#[derive(Debug, Serialize)]
struct PredictionResponse {
    chain_id: u64,
    oracle_addr: Address,
    prediction: crate::prediction::Prediction,
    transmit: crate::prediction::TransmitCheck,
}

/// GET /oracles/:chain_id/:addr/prediction - Current prediction and
/// transmit-now decision
async fn get_prediction(
    Path((chain_id, addr)): Path<(u64, String)>,
    State(state): State<Arc<ApiState>>,
) -> ApiResult<PredictionResponse> {
    let cfg = lookup_oracle(&state, chain_id, &addr)?;
    let now = now_ms();

    let prediction = state
        .service
        .predicted_now(&cfg, now)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::unavailable("no CEX coverage for prediction"))?;
    let transmit = state
        .service
        .should_transmit(&cfg, now)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::unavailable("no on-chain sample to compare against"))?;

    Ok(Json(PredictionResponse {
        chain_id,
        oracle_addr: cfg.oracle_addr,
        prediction,
        transmit,
    }))
}

#[derive(Debug, Deserialize)]
struct PredictionAtQuery {
    ts: Option<i64>,
    lag: Option<i64>,
}

#[derive(Debug, Serialize)]
struct PredictionAtResponse {
    chain_id: u64,
    oracle_addr: Address,
    ts: i64,
    lag_ms: i64,
    prediction: crate::prediction::Prediction,
}

/// GET /oracles/:chain_id/:addr/predictionAt?ts=&lag= - Prediction at a
/// historical instant
async fn get_prediction_at(
    Path((chain_id, addr)): Path<(u64, String)>,
    Query(query): Query<PredictionAtQuery>,
    State(state): State<Arc<ApiState>>,
) -> ApiResult<PredictionAtResponse> {
    let cfg = lookup_oracle(&state, chain_id, &addr)?;
    let ts = query
        .ts
        .ok_or_else(|| ApiError::bad_request("ts query parameter is required"))?;
    let lag_ms = query.lag.unwrap_or(cfg.lag_secs as i64 * 1_000);
    if lag_ms < 0 {
        return Err(ApiError::bad_request("lag must be non-negative"));
    }

    let prediction = state
        .service
        .predicted_at(&cfg, ts, lag_ms)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::unavailable("no CEX coverage at that instant"))?;

    Ok(Json(PredictionAtResponse {
        chain_id,
        oracle_addr: cfg.oracle_addr,
        ts,
        lag_ms,
        prediction,
    }))
}

#[derive(Debug, Serialize)]
struct OracleMetrics {
    #[serde(flatten)]
    config: OracleConfig,
    sample_count: u64,
    latest_error_bps: Option<f64>,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    trade_rows: u64,
    source_bin_rows: u64,
    aggregate_bin_rows: u64,
    oracles: Vec<OracleMetrics>,
}

/// GET /metrics - Configuration and store observability dump
async fn get_metrics(State(state): State<Arc<ApiState>>) -> ApiResult<MetricsResponse> {
    let trade_rows = state.store.trade_count().map_err(ApiError::internal)?;
    let (source_bin_rows, aggregate_bin_rows) =
        state.store.bin_counts().map_err(ApiError::internal)?;

    let mut oracles = Vec::new();
    for config in state.store.list_oracle_configs().map_err(ApiError::internal)? {
        let sample_count = state
            .store
            .sample_count(config.chain_id, config.oracle_addr)
            .map_err(ApiError::internal)?;
        let latest_error_bps = state
            .store
            .latest_sample(config.chain_id, config.oracle_addr)
            .map_err(ApiError::internal)?
            .map(|s| s.error_bps);
        oracles.push(OracleMetrics {
            config,
            sample_count,
            latest_error_bps,
        });
    }

    Ok(Json(MetricsResponse {
        trade_rows,
        source_bin_rows,
        aggregate_bin_rows,
        oracles,
    }))
}

/// GET /metrics/backtest - Realized error distributions per oracle
async fn get_backtest(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<HashMap<String, crate::prediction::BacktestReport>> {
    let mut reports = HashMap::new();
    for config in state.store.list_oracle_configs().map_err(ApiError::internal)? {
        let report = state
            .service
            .backtest(&config, BACKTEST_MAX_SAMPLES)
            .map_err(ApiError::internal)?;
        reports.insert(
            format!("{}/{:#x}", config.chain_id, config.oracle_addr),
            report,
        );
    }
    Ok(Json(reports))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_override_parses_matched_lists() {
        let parsed = parse_weight_override("binance,bybit", "2, 1").unwrap();
        assert_eq!(
            parsed,
            vec![(Exchange::Binance, 2.0), (Exchange::Bybit, 1.0)]
        );
    }

    #[test]
    fn weight_override_rejects_bad_input() {
        assert!(parse_weight_override("binance,bybit", "1").is_err());
        assert!(parse_weight_override("kraken", "1").is_err());
        assert!(parse_weight_override("binance", "-1").is_err());
        assert!(parse_weight_override("", "").is_err());
    }
}
