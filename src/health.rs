// =============================================================================
// Operational HTTP endpoint — GET /health
// =============================================================================
//
// Grounded on `api::rest::router`/`health` (CORS layer, `with_state`,
// a small `Serialize` response struct). The authenticated dashboard routes
// that used to live alongside it (`/api/v1/state`, `/positions`,
// `/control/*`) have no counterpart here: this process only needs to answer
// a liveness probe, so this router carries just the one public route.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::ingestion::IngestionGateway;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time_ms: i64,
    providers: Vec<crate::providers::ProviderHealth>,
}

pub fn router(gateway: Arc<IngestionGateway>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .layer(cors)
        .with_state(gateway)
}

async fn health(State(gateway): State<Arc<IngestionGateway>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time_ms: chrono::Utc::now().timestamp_millis(),
        providers: gateway.providers_health(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket_store::BucketStore;
    use crate::evaluator::{EvaluatorConfig, TriggerEvaluator};
    use crate::market_state::MarketState;
    use crate::notifier::NotificationPipeline;
    use crate::registry::{InMemorySignalRepository, InMemoryTriggerRepository, RecordingChatSink, TriggerRegistry};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_gateway() -> Arc<IngestionGateway> {
        let buckets = Arc::new(BucketStore::new(300, 70));
        let market = Arc::new(MarketState::new(100));
        let repo = Arc::new(InMemoryTriggerRepository::new());
        let registry = Arc::new(TriggerRegistry::new(repo));
        let notifier = Arc::new(NotificationPipeline::new(Arc::new(RecordingChatSink::new())));
        let signals = Arc::new(InMemorySignalRepository::new());
        let evaluator = Arc::new(TriggerEvaluator::new(
            buckets.clone(),
            market.clone(),
            registry,
            notifier,
            signals,
            EvaluatorConfig::default(),
        ));
        Arc::new(IngestionGateway::new(buckets, market, evaluator))
    }

    #[tokio::test]
    async fn health_route_returns_200() {
        let app = router(make_gateway());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
