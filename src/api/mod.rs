//! HTTP surface
//!
//! - `GET  /status`                      worker kill-switch state
//! - `POST /toggle {"enable": bool}`     flip the kill-switch
//! - `GET  /prices?ticker=X`             one ticker, re-read from store when stale
//! - `GET  /prices?tickers=X,Y,Z`        many tickers, one entry per requested symbol
//! - `GET  /prices[?refresh=true]`       everything cached; `refresh` re-reads from store first

use crate::cache::PriceCache;
use crate::error::ApiError;
use crate::freshness::{Clock, FreshnessPolicy};
use crate::models::CacheEntry;
use crate::scraper::cleaner::normalise_symbol;
use crate::worker::WorkerState;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const MAX_TICKERS_PER_REQUEST: usize = 250;

#[derive(Clone)]
pub struct ApiState {
    pub worker: Arc<WorkerState>,
    pub cache: Arc<PriceCache>,
    pub policy: Arc<FreshnessPolicy>,
    pub clock: Arc<dyn Clock>,
    pub universe: Arc<Vec<String>>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/toggle", post(post_toggle))
        .route("/prices", get(get_prices))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ── Control ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub enabled: bool,
    pub running: bool,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enable: bool,
}

fn require_ready(worker: &WorkerState) -> Result<(), ApiError> {
    if worker.is_ready() { Ok(()) } else { Err(ApiError::NotReady) }
}

async fn get_status(State(state): State<ApiState>) -> Result<Json<StatusResponse>, ApiError> {
    require_ready(&state.worker)?;
    Ok(Json(StatusResponse {
        enabled: state.worker.is_enabled(),
        running: state.worker.is_running(),
    }))
}

async fn post_toggle(
    State(state): State<ApiState>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    require_ready(&state.worker)?;
    let enabled = state.worker.set_enabled(req.enable);
    Ok(Json(StatusResponse {
        enabled,
        running: state.worker.is_running(),
    }))
}

// ── Prices ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct PricesQuery {
    pub ticker: Option<String>,
    pub tickers: Option<String>,
    #[serde(default)]
    pub refresh: bool,
}

/// One requested ticker. `available: false` means no real quote has been stored yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceView {
    pub ticker: String,
    pub available: bool,
    pub price: Option<f64>,
    pub price_change: Option<f64>,
    pub price_change_percent: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PriceView {
    fn unavailable(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            available: false,
            price: None,
            price_change: None,
            price_change_percent: None,
            updated_at: None,
        }
    }
}

impl From<CacheEntry> for PriceView {
    fn from(e: CacheEntry) -> Self {
        // Zero price is the placeholder row written when every source failed
        let available = e.price > 0.0;
        Self {
            ticker: e.ticker,
            available,
            price: available.then_some(e.price),
            price_change: e.price_change,
            price_change_percent: e.price_change_percent,
            updated_at: Some(e.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PricesResponse {
    One(PriceView),
    Many(Vec<PriceView>),
}

fn parse_ticker_list(raw: &str) -> Result<Vec<String>, ApiError> {
    let mut tickers: Vec<String> = Vec::new();
    for t in raw.split(',').map(normalise_symbol).filter(|t| !t.is_empty()) {
        if !tickers.contains(&t) {
            tickers.push(t);
        }
    }
    if tickers.is_empty() {
        return Err(ApiError::BadRequest("tickers must name at least one symbol".into()));
    }
    if tickers.len() > MAX_TICKERS_PER_REQUEST {
        return Err(ApiError::BadRequest(format!(
            "at most {} tickers per request",
            MAX_TICKERS_PER_REQUEST
        )));
    }
    Ok(tickers)
}

async fn get_prices(
    State(state): State<ApiState>,
    Query(query): Query<PricesQuery>,
) -> Result<Json<PricesResponse>, ApiError> {
    if let Some(raw) = query.ticker.as_deref() {
        let ticker = normalise_symbol(raw);
        if ticker.is_empty() {
            return Err(ApiError::BadRequest("ticker must not be empty".into()));
        }
        let entry = if query.refresh {
            state.cache.refresh(std::slice::from_ref(&ticker)).await?;
            state.cache.get_by_ticker(&ticker).await?
        } else {
            state.cache.get_fresh(&ticker, &state.policy, state.clock.now()).await?
        };
        let view = entry.map(PriceView::from).unwrap_or_else(|| PriceView::unavailable(&ticker));
        return Ok(Json(PricesResponse::One(view)));
    }

    if let Some(raw) = query.tickers.as_deref() {
        let tickers = parse_ticker_list(raw)?;
        if query.refresh {
            state.cache.refresh(&tickers).await?;
        }
        let mut found = state.cache.get_many(&tickers).await?;

        if !query.refresh {
            let now = state.clock.now();
            let reread: Vec<String> = tickers
                .iter()
                .filter(|t| state.policy.is_stale(t, found.get(*t).map(|e| e.updated_at), now))
                .cloned()
                .collect();
            if !reread.is_empty() {
                for e in state.cache.refresh(&reread).await? {
                    found.insert(e.ticker.clone(), e);
                }
            }
        }
        return Ok(Json(PricesResponse::Many(ordered_views(&tickers, found))));
    }

    if query.refresh {
        state.cache.refresh(&state.universe).await?;
    }
    let all = state.cache.get_all().await?;
    Ok(Json(PricesResponse::Many(all.into_iter().map(PriceView::from).collect())))
}

fn ordered_views(tickers: &[String], mut found: HashMap<String, CacheEntry>) -> Vec<PriceView> {
    tickers
        .iter()
        .map(|t| {
            found
                .remove(t)
                .map(PriceView::from)
                .unwrap_or_else(|| PriceView::unavailable(t))
        })
        .collect()
}
