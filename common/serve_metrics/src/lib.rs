use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Serve a `Router` on the provided listener, typically the status router
/// with the prometheus route already attached.
pub async fn serve(router: Router, listener: tokio::net::TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, router).await
}

/// Adds the `/metrics` endpoint to a router, installing the global
/// prometheus recorder as a side effect. Call once, last.
pub fn setup_metrics_routes(router: Router) -> Router {
    let handle = setup_metrics_recorder();
    router.route(
        "/metrics",
        get(move || std::future::ready(handle.render())),
    )
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const BUCKETS: &[f64] = &[
        0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .expect("buckets are nonempty")
        .install_recorder()
        .expect("failed to install prometheus recorder")
}
