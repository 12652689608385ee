//! HTTP API route definitions.

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use super::handlers::{health, metrics, ready, status, AppState};

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Status endpoint
        .route("/api/v1/status", get(status))
        // Prometheus scrape endpoint
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::OpportunityMap;
    use crate::graph::Edge;
    use crate::opportunity::Opportunity;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = create_router(AppState::new("mock"));

        let response = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_endpoint_returns_503_when_not_ready() {
        let app = create_router(AppState::new("mock"));

        let response = app.oneshot(get("/ready")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ready_endpoint_returns_200_when_ready() {
        let state = AppState::new("mock");
        state.set_ready(true);
        let app = create_router(state);

        let response = app.oneshot(get("/ready")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_404_without_recorder() {
        let app = create_router(AppState::new("mock"));

        let response = app.oneshot(get("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_lists_open_opportunities() {
        let mut edges = [
            Edge::direct("A", "B", dec!(0), dec!(0)),
            Edge::direct("B", "C", dec!(0), dec!(0)),
            Edge::direct("C", "A", dec!(0), dec!(0)),
        ];
        for (edge, price) in edges.iter_mut().zip([dec!(2), dec!(3), dec!(0.2)]) {
            edge.set_real_price(price).unwrap();
        }
        let opportunity = Opportunity::new("mock", edges);
        let map: OpportunityMap = Arc::new(HashMap::from([(opportunity.id().to_string(), opportunity)]));
        let (_tx, rx) = watch::channel(map);
        let app = create_router(AppState::new("mock").with_opportunities(rx));

        let response = app.oneshot(get("/api/v1/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["open_opportunities"], 1);
        assert_eq!(json["opportunities"][0]["id"], "ABC");
        assert_eq!(json["opportunities"][0]["arbitrage"], "1.2");
        assert!(json["engine"].is_null());
    }
}
