//! Axum JSON surface over the live subscriptions.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use matchfeed_core::{MatchView, ViewFilter};
use matchfeed_sync::{FeedRuntime, RefreshBus, RefreshOutcome, ViewSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "matchfeed-web";

#[derive(Clone)]
pub struct AppState {
    views: BTreeMap<String, watch::Receiver<ViewSnapshot>>,
    bus: RefreshBus,
    last_refresh: Arc<RwLock<Option<RefreshOutcome>>>,
}

impl AppState {
    pub fn new(views: BTreeMap<String, watch::Receiver<ViewSnapshot>>, bus: RefreshBus) -> Self {
        Self {
            views,
            bus,
            last_refresh: Arc::new(RwLock::new(None)),
        }
    }

    pub fn from_runtime(runtime: &FeedRuntime) -> Self {
        Self::new(runtime.views(), runtime.bus().clone())
    }

    fn record_completion(&self, outcome: RefreshOutcome) {
        if let Ok(mut slot) = self.last_refresh.write() {
            *slot = Some(outcome);
        }
    }

    fn last_completion(&self) -> Option<RefreshOutcome> {
        self.last_refresh.read().ok().and_then(|slot| slot.clone())
    }

    /// Keep `/refresh/last` current by following the completion channel.
    pub fn spawn_completion_tracker(&self) -> JoinHandle<()> {
        let state = self.clone();
        let mut completions = self.bus.subscribe_completions();
        tokio::spawn(async move {
            loop {
                match completions.recv().await {
                    Ok(outcome) => state.record_completion(outcome),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "completion tracker lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[derive(Debug, Serialize)]
struct SubscriptionSummary {
    name: String,
    matches: usize,
}

#[derive(Debug, Deserialize, Default)]
struct ViewsQuery {
    sport: Option<String>,
    q: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/views", get(views_index_handler))
        .route("/views/{name}", get(view_handler))
        .route("/refresh", post(refresh_handler))
        .route("/refresh/last", get(last_refresh_handler))
        .with_state(Arc::new(state))
}

/// Bind on `port` and serve until the process is interrupted.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let tracker = state.spawn_completion_tracker();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving match views");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    tracker.abort();
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "subscriptions": state.views.len()}))
}

async fn views_index_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SubscriptionSummary>> {
    let rows = state
        .views
        .iter()
        .map(|(name, rx)| SubscriptionSummary {
            name: name.clone(),
            matches: rx.borrow().len(),
        })
        .collect();
    Json(rows)
}

async fn view_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ViewsQuery>,
) -> Response {
    let Some(rx) = state.views.get(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no subscription named {name}")})),
        )
            .into_response();
    };
    let snapshot = rx.borrow().clone();
    let filter = ViewFilter::new(query.sport, query.q);
    let rows: Vec<MatchView> = snapshot
        .iter()
        .filter(|v| filter.matches_view(v))
        .cloned()
        .collect();
    Json(rows).into_response()
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let reached = state.bus.request_refresh();
    info!(reached, "refresh requested over http");
    (StatusCode::ACCEPTED, Json(json!({"reached": reached}))).into_response()
}

async fn last_refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.last_completion() {
        Some(outcome) => Json(outcome).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
