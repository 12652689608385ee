//! HTTP API handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::watch;

use crate::engine::{Engine, EngineStats};
use crate::exchange::Exchange;
use crate::finder::OpportunityMap;

/// Source of engine counters for the status endpoint.
pub trait StatusProvider: Send + Sync {
    /// Current counters.
    fn engine_stats(&self) -> EngineStats;
}

impl<E: Exchange + ?Sized> StatusProvider for Engine<E> {
    fn engine_stats(&self) -> EngineStats {
        self.stats()
    }
}

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Whether the graph is built and the first balance fetch succeeded.
    pub ready: Arc<AtomicBool>,
    /// Exchange name.
    pub exchange: Arc<str>,
    /// Opportunities published by the finder.
    pub opportunities: Option<watch::Receiver<OpportunityMap>>,
    /// Engine counters.
    pub engine: Option<Arc<dyn StatusProvider>>,
    /// Prometheus recorder handle.
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Create new app state.
    pub fn new(exchange: &str) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            exchange: Arc::from(exchange),
            opportunities: None,
            engine: None,
            prometheus: None,
        }
    }

    /// Attach the finder's opportunity map.
    pub fn with_opportunities(mut self, opportunities: watch::Receiver<OpportunityMap>) -> Self {
        self.opportunities = Some(opportunities);
        self
    }

    /// Attach the engine.
    pub fn with_engine(mut self, engine: Arc<dyn StatusProvider>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Attach the Prometheus recorder.
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Set ready state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether service is ready.
    pub ready: bool,
    /// Exchange name.
    pub exchange: String,
}

/// One open opportunity in the status response.
#[derive(Debug, Serialize)]
pub struct OpportunitySummary {
    pub id: String,
    pub cycle: String,
    pub arbitrage: String,
    pub max_volume: Option<String>,
    pub age_ms: u64,
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Service status.
    pub status: &'static str,
    /// Exchange name.
    pub exchange: String,
    /// Number of open opportunities.
    pub open_opportunities: usize,
    /// Open opportunities, best first.
    pub opportunities: Vec<OpportunitySummary>,
    /// Engine counters.
    pub engine: Option<EngineStats>,
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if ready, 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let is_ready = state.is_ready();
    let response = ReadyResponse {
        ready: is_ready,
        exchange: state.exchange.to_string(),
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Prometheus scrape handler - 404 when no recorder is installed.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// Status handler - returns open opportunities and engine counters.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let mut open: Vec<_> = match &state.opportunities {
        Some(rx) => rx
            .borrow()
            .values()
            .map(|o| {
                let summary = OpportunitySummary {
                    id: o.id().to_string(),
                    cycle: o.to_string(),
                    arbitrage: o.arbitrage().to_string(),
                    max_volume: o.max_volume().map(|v| v.to_string()),
                    age_ms: o.duration().as_millis() as u64,
                };
                (o.arbitrage(), summary)
            })
            .collect(),
        None => Vec::new(),
    };
    open.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
    let opportunities: Vec<OpportunitySummary> = open.into_iter().map(|(_, s)| s).collect();

    let status = if state.is_ready() { "running" } else { "starting" };

    Json(StatusResponse {
        status,
        exchange: state.exchange.to_string(),
        open_opportunities: opportunities.len(),
        opportunities,
        engine: state.engine.as_ref().map(|e| e.engine_stats()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_state_ready_toggle() {
        let state = AppState::new("mock");
        assert!(!state.is_ready());

        state.set_ready(true);
        assert!(state.is_ready());

        state.set_ready(false);
        assert!(!state.is_ready());
    }
}
