use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use health::HealthRegistry;
use serde::Serialize;
use tokio::sync::watch;

use crate::anomaly::AnomalyTracker;
use crate::dispatch::ConnectorStatusBoard;
use crate::metadata::Metadata;
use crate::pool::Pool;

/// Read-only diagnostics surface. Every handler is a snapshot query;
/// nothing mutates through here.
#[derive(Clone)]
pub struct StatusState {
    pub pool: Arc<Pool>,
    pub anomaly: Arc<AnomalyTracker>,
    pub metadata_rx: watch::Receiver<Arc<Metadata>>,
    pub board: Arc<ConnectorStatusBoard>,
    pub liveness: HealthRegistry,
}

pub fn status_router(state: StatusState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/v1/counters", get(counters))
        .route("/v1/discards", get(discards))
        .route("/v1/metadata", get(metadata))
        .route("/v1/brokers", get(brokers))
        .route("/v1/pool", get(pool))
        .with_state(state)
}

async fn index() -> &'static str {
    "dory"
}

async fn liveness(State(state): State<StatusState>) -> impl IntoResponse {
    state.liveness.get_status()
}

#[derive(Serialize)]
struct CountersView {
    total_discards: u64,
    discards: BTreeMap<&'static str, u64>,
    possible_duplicates: u64,
}

async fn counters(State(state): State<StatusState>) -> Json<CountersView> {
    let discards = crate::anomaly::DiscardKind::ALL
        .iter()
        .map(|k| (k.as_tag(), state.anomaly.total(*k)))
        .collect();
    Json(CountersView {
        total_discards: state.anomaly.total_discards(),
        discards,
        possible_duplicates: state.anomaly.possible_duplicates(),
    })
}

async fn discards(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.anomaly.snapshot())
}

async fn metadata(State(state): State<StatusState>) -> impl IntoResponse {
    let md = state.metadata_rx.borrow().clone();
    Json(md.summary())
}

async fn brokers(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.board.snapshot())
}

async fn pool(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.pool.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::DiscardKind;
    use crate::msg::test_support;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> StatusState {
        // The handlers only borrow the latest value, so the dropped
        // sender is fine here.
        let (_md_tx, metadata_rx) = watch::channel(Arc::new(Metadata::default()));
        StatusState {
            pool: Pool::new(64, 4).unwrap(),
            anomaly: Arc::new(AnomalyTracker::new()),
            metadata_rx,
            board: Arc::new(ConnectorStatusBoard::default()),
            liveness: HealthRegistry::new("liveness"),
        }
    }

    async fn get_json(router: Router, path: &str) -> serde_json::Value {
        let response = router
            .oneshot(
                Request::builder()
                    .uri(path)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn counters_and_pool_snapshots() {
        let state = state();
        state.anomaly.discard_msg(
            test_support::msg(&state.pool, "t", b"v"),
            DiscardKind::RateLimited,
        );
        let router = status_router(state);

        let counters = get_json(router.clone(), "/v1/counters").await;
        assert_eq!(counters["total_discards"], 1);
        assert_eq!(counters["discards"]["rate_limited"], 1);

        let pool = get_json(router, "/v1/pool").await;
        assert_eq!(pool["block_count"], 4);
        assert_eq!(pool["free_blocks"], 4);
    }

    #[tokio::test]
    async fn discard_samples_are_served() {
        let state = state();
        state.anomaly.discard_frame(DiscardKind::Malformed, b"junk");
        let router = status_router(state);

        let discards = get_json(router, "/v1/discards").await;
        assert_eq!(discards["recent"]["malformed"][0]["value_prefix"], "junk");
    }
}
