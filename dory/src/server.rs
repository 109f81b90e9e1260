use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use health::HealthRegistry;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::anomaly::AnomalyTracker;
use crate::config::Config;
use crate::dispatch::{ConnectorStatusBoard, Dispatcher};
use crate::input::{DatagramInputAgent, InputShared, StreamInputAgent, StreamListener};
use crate::metadata::Metadata;
use crate::metadata_fetcher::MetadataRefresher;
use crate::pool::Pool;
use crate::router::Router;
use crate::shutdown::ShutdownRx;
use crate::status::{status_router, StatusState};

/// Router input queue depth. Bursts beyond this block the ingest tasks
/// briefly; sustained overload lands on the pool cap instead.
const ROUTER_QUEUE_DEPTH: usize = 1024;

/// Builds every component, spawns the pipeline, and runs until shutdown.
pub async fn serve(config: Config, shutdown: ShutdownRx) -> anyhow::Result<()> {
    config.validate()?;

    let pool = Pool::new(config.pool_block_size, config.pool_block_count())?;
    let anomaly = Arc::new(AnomalyTracker::new());
    let board = Arc::new(ConnectorStatusBoard::default());
    let liveness = HealthRegistry::new("liveness");

    let (router_tx, router_rx) = mpsc::channel(ROUTER_QUEUE_DEPTH);
    let (md_tx, md_rx) = watch::channel(Arc::new(Metadata::default()));
    let (refresh_tx, refresh_rx) = mpsc::channel(16);

    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    // Input agents.
    let input_shared = InputShared {
        pool: Arc::clone(&pool),
        anomaly: Arc::clone(&anomaly),
        router_tx,
        max_msg_size: config.max_input_msg_size,
    };
    if let Some(path) = &config.receive_socket_name {
        let agent = DatagramInputAgent::bind(
            Path::new(path),
            input_shared.clone(),
            config.allow_large_unix_datagrams,
            liveness.register("datagram_input", Duration::from_secs(60)),
        )?;
        tasks.push(("datagram_input", tokio::spawn(agent.run(shutdown.clone()))));
    }
    if let Some(path) = &config.receive_stream_socket_name {
        let listener = StreamListener::bind_unix(Path::new(path))?;
        let agent = StreamInputAgent::new(
            listener,
            input_shared.clone(),
            liveness.register("unix_stream_input", Duration::from_secs(60)),
        );
        tasks.push(("unix_stream_input", tokio::spawn(agent.run(shutdown.clone()))));
    }
    if let Some(port) = config.input_port {
        let listener = StreamListener::bind_tcp(port).await?;
        let agent = StreamInputAgent::new(
            listener,
            input_shared.clone(),
            liveness.register("tcp_input", Duration::from_secs(60)),
        );
        tasks.push(("tcp_input", tokio::spawn(agent.run(shutdown.clone()))));
    }
    // The original sender must drop with the agents so the router can
    // observe input close.
    drop(input_shared);

    // Metadata refresher.
    let refresher = MetadataRefresher::new(
        config.refresher_config()?,
        config.metadata_protocol(),
        md_tx,
        refresh_rx,
        liveness.register("metadata_refresher", Duration::from_secs(120)),
    );
    tasks.push(("metadata_refresher", tokio::spawn(refresher.run(shutdown.clone()))));

    // Router owns the dispatcher.
    let settings = Arc::new(config.producer_settings()?);
    let dispatcher = Dispatcher::new(
        Arc::clone(&settings),
        Arc::clone(&anomaly),
        Arc::clone(&board),
    );
    let router = Router::new(
        config.router_config(),
        settings.protocol.single_msg_overhead(),
        Arc::clone(&anomaly),
        config.topic_rate_limiter()?,
        router_rx,
        md_rx.clone(),
        refresh_tx,
        dispatcher,
        liveness.register("router", Duration::from_secs(60)),
    );
    tasks.push(("router", tokio::spawn(router.run(shutdown.clone()))));

    // Discard report intervals.
    {
        let anomaly = Arc::clone(&anomaly);
        let mut shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.discard_report_interval_secs.max(1));
        tasks.push((
            "discard_reporter",
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if shutdown.borrow().is_requested() {
                                return;
                            }
                        }
                        _ = tick.tick() => anomaly.roll_interval(),
                    }
                }
            }),
        ));
    }

    // Status and metrics endpoint.
    let status_state = StatusState {
        pool,
        anomaly,
        metadata_rx: md_rx,
        board,
        liveness,
    };
    let mut app = status_router(status_state);
    if config.export_prometheus {
        app = serve_metrics::setup_metrics_routes(app);
    }
    let status_listener = tokio::net::TcpListener::bind(config.status_address).await?;
    info!(address = %config.status_address, "status endpoint listening");
    {
        let mut shutdown = shutdown.clone();
        tasks.push((
            "status_server",
            tokio::spawn(async move {
                let server = axum::serve(status_listener, app).with_graceful_shutdown(async move {
                    while !shutdown.borrow_and_update().is_requested() {
                        if shutdown.changed().await.is_err() {
                            return;
                        }
                    }
                });
                if let Err(err) = server.await {
                    error!(error = %err, "status server failed");
                }
            }),
        ));
    }

    for (name, task) in tasks {
        if let Err(err) = task.await {
            error!(task = name, error = %err, "task panicked");
        }
    }
    info!("all tasks stopped");
    Ok(())
}
