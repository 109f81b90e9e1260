use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use health::HealthHandle;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::kafka::metadata::{MetadataDecodeError, MetadataProtocol, MetadataResponse};
use crate::metadata::Metadata;
use crate::shutdown::ShutdownRx;

/// Largest metadata response we will buffer.
const MAX_RESPONSE_SIZE: i32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("i/o error talking to broker: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out talking to broker")]
    TimedOut,
    #[error("bad response frame size {0}")]
    BadFrameSize(i32),
    #[error("failed to decode metadata response: {0}")]
    Decode(#[from] MetadataDecodeError),
    #[error("response correlation id {got} does not match request {expected}")]
    BadCorrelationId { expected: i32, got: i32 },
}

/// One metadata round trip: connect, request, read, decode. An empty
/// topic list requests everything; a single-topic request against a
/// cluster with auto-create enabled is also the topic creation call.
pub async fn fetch_metadata(
    host: &str,
    port: u16,
    client_id: &str,
    topics: &[&str],
    correlation_id: i32,
    timeout: Duration,
    protocol: &dyn MetadataProtocol,
) -> Result<MetadataResponse, FetchError> {
    let io = async {
        let mut stream = TcpStream::connect((host, port)).await?;

        let mut request = BytesMut::new();
        protocol.encode_request(correlation_id, client_id, topics, &mut request);
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        let size = i32::from_be_bytes(head);
        if !(0..=MAX_RESPONSE_SIZE).contains(&size) {
            return Err(FetchError::BadFrameSize(size));
        }

        let mut payload = vec![0u8; size as usize];
        stream.read_exact(&mut payload).await?;
        Ok(payload)
    };

    let payload = tokio::time::timeout(timeout, io)
        .await
        .map_err(|_| FetchError::TimedOut)??;

    let response = protocol.decode_response(&payload)?;
    if response.correlation_id != correlation_id {
        return Err(FetchError::BadCorrelationId {
            expected: correlation_id,
            got: response.correlation_id,
        });
    }
    Ok(response)
}

/// Asks the refresher for out-of-band work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshRequest {
    /// Fetch now and publish even if nothing changed (pause recovery:
    /// the router is waiting on the watch channel).
    Full,
    /// Issue a single-topic metadata request so the broker auto-creates
    /// the topic, then publish a fresh view.
    AutoCreate(String),
}

#[derive(Debug, Clone)]
pub struct RefresherConfig {
    pub client_id: String,
    pub refresh_interval: Duration,
    pub socket_timeout: Duration,
    pub retry_backoff_initial: Duration,
    pub retry_backoff_max_doublings: u32,
    pub initial_brokers: Vec<(String, u16)>,
}

/// Keeps the shared `Arc<Metadata>` fresh: periodically, and on demand
/// when a pause or an auto-create needs a new view. On failure it cycles
/// through known brokers with exponential backoff, preferring whichever
/// broker answered last.
pub struct MetadataRefresher {
    config: RefresherConfig,
    protocol: Arc<dyn MetadataProtocol>,
    md_tx: watch::Sender<Arc<Metadata>>,
    request_rx: mpsc::Receiver<RefreshRequest>,
    health: HealthHandle,
    brokers: Vec<(String, u16)>,
    last_good: usize,
    correlation_id: i32,
}

impl MetadataRefresher {
    pub fn new(
        config: RefresherConfig,
        protocol: Arc<dyn MetadataProtocol>,
        md_tx: watch::Sender<Arc<Metadata>>,
        request_rx: mpsc::Receiver<RefreshRequest>,
        health: HealthHandle,
    ) -> MetadataRefresher {
        let brokers = config.initial_brokers.clone();
        MetadataRefresher {
            config,
            protocol,
            md_tx,
            request_rx,
            health,
            brokers,
            last_good: 0,
            correlation_id: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: ShutdownRx) {
        // Nothing can be routed before the first topology arrives.
        match self.fetch_until_success(&mut shutdown).await {
            Some(md) => self.publish(md),
            None => return,
        }

        let mut tick = tokio::time::interval(self.config.refresh_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.reset();
        let mut health_tick = tokio::time::interval(Duration::from_secs(15));

        loop {
            self.health.report_healthy();
            tokio::select! {
                _ = health_tick.tick() => {}
                _ = shutdown.changed() => {
                    if shutdown.borrow().is_requested() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Some(md) = self.fetch_all_once_around().await {
                        self.publish_if_changed(md);
                    }
                }
                request = self.request_rx.recv() => match request {
                    None => break,
                    Some(RefreshRequest::Full) => {
                        let Some(md) = self.fetch_until_success(&mut shutdown).await else {
                            break;
                        };
                        self.publish(md);
                        tick.reset();
                    }
                    Some(RefreshRequest::AutoCreate(topic)) => {
                        self.request_auto_create(&topic).await;
                        let Some(md) = self.fetch_until_success(&mut shutdown).await else {
                            break;
                        };
                        self.publish(md);
                        tick.reset();
                    }
                },
            }
        }
        info!("metadata refresher stopped");
    }

    /// One pass over the known brokers starting at the last good one.
    async fn fetch_all_once_around(&mut self) -> Option<Metadata> {
        let broker_count = self.brokers.len();
        for attempt in 0..broker_count {
            let index = (self.last_good + attempt) % broker_count;
            let (host, port) = self.brokers[index].clone();
            match self.fetch_from(&host, port, &[]).await {
                Ok(response) => {
                    let md = Metadata::from_response(&response);
                    self.last_good = index;
                    self.learn_brokers(&md);
                    return Some(md);
                }
                Err(err) => {
                    metrics::counter!("dory_metadata_fetch_errors_total").increment(1);
                    warn!(host = %host, port, error = %err, "metadata fetch failed");
                }
            }
        }
        None
    }

    /// Cycles brokers with bounded exponential backoff until a fetch
    /// lands or shutdown is requested.
    async fn fetch_until_success(&mut self, shutdown: &mut ShutdownRx) -> Option<Metadata> {
        let mut failures = 0u32;
        loop {
            // The refresher itself is alive; it is the cluster that is
            // not answering.
            self.health.report_healthy();
            if let Some(md) = self.fetch_all_once_around().await {
                return Some(md);
            }

            let doublings = failures.min(self.config.retry_backoff_max_doublings);
            let base = self.config.retry_backoff_initial * 2u32.pow(doublings);
            // Jitter keeps a fleet of restarting daemons from thundering.
            let wait = base.mul_f64(rand::thread_rng().gen_range(0.75..1.25));
            failures += 1;
            warn!(?wait, "no broker answered a metadata request; backing off");

            tokio::select! {
                _ = shutdown.changed() => {
                    if shutdown.borrow().is_requested() {
                        return None;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn request_auto_create(&mut self, topic: &str) {
        let broker_count = self.brokers.len();
        for attempt in 0..broker_count {
            let index = (self.last_good + attempt) % broker_count;
            let (host, port) = self.brokers[index].clone();
            match self.fetch_from(&host, port, &[topic]).await {
                Ok(_) => {
                    info!(topic, "requested topic auto-create");
                    return;
                }
                Err(err) => warn!(topic, host = %host, error = %err, "auto-create request failed"),
            }
        }
    }

    async fn fetch_from(
        &mut self,
        host: &str,
        port: u16,
        topics: &[&str],
    ) -> Result<MetadataResponse, FetchError> {
        self.correlation_id = self.correlation_id.wrapping_add(1);
        fetch_metadata(
            host,
            port,
            &self.config.client_id,
            topics,
            self.correlation_id,
            self.config.socket_timeout,
            self.protocol.as_ref(),
        )
        .await
    }

    fn learn_brokers(&mut self, md: &Metadata) {
        let brokers: Vec<(String, u16)> = md
            .brokers()
            .iter()
            .map(|b| (b.host.clone(), b.port))
            .collect();
        if !brokers.is_empty() && brokers != self.brokers {
            self.brokers = brokers;
            self.last_good = 0;
        }
    }

    fn publish_if_changed(&self, md: Metadata) {
        if **self.md_tx.borrow() == md {
            return;
        }
        info!(
            brokers = md.brokers().len(),
            topics = md.topic_count(),
            "cluster metadata changed"
        );
        self.publish(md);
    }

    fn publish(&self, md: Metadata) {
        metrics::counter!("dory_metadata_updates_total").increment(1);
        self.md_tx.send_replace(Arc::new(md));
    }
}
