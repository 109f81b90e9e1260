use std::time::Duration;

use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use dory::config::Config;
use dory::shutdown::{self, ShutdownSignal, ShutdownTx};

fn setup_tracing(level: tracing::Level) {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(level).into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

/// First SIGTERM/SIGINT starts a slow shutdown with the configured
/// drain window; a second signal upgrades it to fast.
async fn watch_signals(shutdown_tx: ShutdownTx, max_delay: Duration) {
    let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {}
        _ = interrupt.recv() => {}
    }
    info!("shutdown requested; draining for up to {max_delay:?}");
    _ = shutdown_tx.send(ShutdownSignal::Slow {
        deadline: tokio::time::Instant::now() + max_delay,
    });

    tokio::select! {
        _ = term.recv() => {}
        _ = interrupt.recv() => {}
    }
    warn!("second signal; dropping buffered messages");
    _ = shutdown_tx.send(ShutdownSignal::Fast);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env()?;
    setup_tracing(config.log_level);
    info!("starting dory");

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let max_delay = Duration::from_millis(config.kafka.kafka_shutdown_max_delay_ms);
    tokio::spawn(watch_signals(shutdown_tx, max_delay));

    dory::server::serve(config, shutdown_rx).await?;
    info!("dory stopped");
    Ok(())
}
