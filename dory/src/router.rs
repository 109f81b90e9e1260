use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::anomaly::{AnomalyTracker, DiscardKind};
use crate::dispatch::{Dispatcher, DispatcherEvent};
use crate::limiters::TopicRateLimiter;
use crate::metadata::{AnyPartitionChooser, Metadata};
use crate::metadata_fetcher::RefreshRequest;
use crate::msg::{Msg, RoutedMsg, Routing};
use crate::shutdown::{ShutdownRx, ShutdownSignal};

/// Metadata publishes an auto-created topic may take to show up before
/// the create is considered failed.
const AUTO_CREATE_MAX_REFRESHES: u32 = 2;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub topic_autocreate: bool,
    pub message_max_bytes: usize,
    /// Pauses spaced closer than this double the backoff wait.
    pub min_pause_delay: Duration,
    pub pause_backoff_initial: Duration,
    pub pause_backoff_max_doublings: u32,
}

enum AutoCreateState {
    Pending { msgs: Vec<Msg>, refreshes_seen: u32 },
    Failed,
}

/// Exponential backoff for pause-triggered rebalances, so a flapping
/// broker cannot make the whole daemon thrash.
struct PauseBackoff {
    min_delay: Duration,
    initial: Duration,
    max_doublings: u32,
    consecutive: u32,
    last_pause: Option<Instant>,
}

impl PauseBackoff {
    fn next_delay(&mut self, now: Instant) -> Duration {
        let close_together = self
            .last_pause
            .is_some_and(|last| now.duration_since(last) < self.min_delay);
        self.last_pause = Some(now);

        if !close_together {
            self.consecutive = 0;
            return Duration::ZERO;
        }
        let doublings = self.consecutive.min(self.max_doublings);
        self.consecutive += 1;
        self.initial * 2u32.pow(doublings)
    }
}

/// The routing task. Consumes ingested messages, assigns each a broker
/// and partition from the current metadata snapshot, and feeds the
/// dispatcher it owns. Also the one place rebalances happen: on a pause
/// or a topology change it drains every connector, re-routes what they
/// held, and starts a fresh connector set.
pub struct Router {
    config: RouterConfig,
    msg_overhead: usize,
    anomaly: Arc<AnomalyTracker>,
    rate_limiter: TopicRateLimiter,
    msg_rx: mpsc::Receiver<Msg>,
    metadata_rx: watch::Receiver<Arc<Metadata>>,
    refresh_tx: mpsc::Sender<RefreshRequest>,
    dispatcher: Dispatcher,
    health: HealthHandle,

    md: Arc<Metadata>,
    choosers: HashMap<(usize, String), AnyPartitionChooser>,
    broker_cursor: HashMap<String, u64>,
    auto_create: HashMap<String, AutoCreateState>,
    /// Messages waiting for a connector (mid-rebalance or backed up).
    /// New arrivals append here whenever it is nonempty, so relative
    /// order is preserved.
    parked: VecDeque<Msg>,
    pause_backoff: PauseBackoff,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        msg_overhead: usize,
        anomaly: Arc<AnomalyTracker>,
        rate_limiter: TopicRateLimiter,
        msg_rx: mpsc::Receiver<Msg>,
        metadata_rx: watch::Receiver<Arc<Metadata>>,
        refresh_tx: mpsc::Sender<RefreshRequest>,
        dispatcher: Dispatcher,
        health: HealthHandle,
    ) -> Router {
        let pause_backoff = PauseBackoff {
            min_delay: config.min_pause_delay,
            initial: config.pause_backoff_initial,
            max_doublings: config.pause_backoff_max_doublings,
            consecutive: 0,
            last_pause: None,
        };
        Router {
            config,
            msg_overhead,
            anomaly,
            rate_limiter,
            msg_rx,
            metadata_rx,
            refresh_tx,
            dispatcher,
            health,
            md: Arc::new(Metadata::default()),
            choosers: HashMap::new(),
            broker_cursor: HashMap::new(),
            auto_create: HashMap::new(),
            parked: VecDeque::new(),
            pause_backoff,
        }
    }

    pub async fn run(mut self, mut shutdown: ShutdownRx) {
        if !self.wait_initial_metadata(&mut shutdown).await {
            return;
        }
        self.md = self.metadata_rx.borrow_and_update().clone();
        self.dispatcher.start(&self.md);
        info!(
            brokers = self.md.brokers().len(),
            topics = self.md.topic_count(),
            "router started"
        );

        let mut input_closed = false;
        let mut health_tick = tokio::time::interval(Duration::from_secs(15));
        loop {
            self.health.report_healthy();

            // Backoff sleeps and rebalances may have consumed the watch
            // notification; always act on the current value.
            let signal = *shutdown.borrow_and_update();
            match signal {
                ShutdownSignal::Running => {}
                ShutdownSignal::Slow { deadline } => {
                    self.finish_slow(deadline, &mut shutdown).await;
                    return;
                }
                ShutdownSignal::Fast => {
                    self.finish_fast().await;
                    return;
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = health_tick.tick() => {}
                msg = self.msg_rx.recv(), if !input_closed => match msg {
                    Some(msg) => self.accept(msg),
                    None => input_closed = true,
                },
                _ = self.metadata_rx.changed() => {
                    let md = self.metadata_rx.borrow_and_update().clone();
                    self.rebalance(md).await;
                }
                event = self.dispatcher.events().recv() => {
                    if let Some(event) = event {
                        self.handle_pause(event, &mut shutdown).await;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(50)),
                        if !self.parked.is_empty() => {
                    self.retry_parked();
                }
            }
        }
    }

    async fn wait_initial_metadata(&mut self, shutdown: &mut ShutdownRx) -> bool {
        while self.metadata_rx.borrow_and_update().brokers().is_empty() {
            self.health.report_healthy();
            tokio::select! {
                _ = shutdown.changed() => {
                    if shutdown.borrow().is_requested() {
                        return false;
                    }
                }
                changed = self.metadata_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Entry point for a newly ingested message.
    fn accept(&mut self, msg: Msg) {
        metrics::counter!("dory_msgs_routed_total").increment(1);
        if !self.parked.is_empty() {
            self.parked.push_back(msg);
            return;
        }
        if let Err(msg) = self.try_route(msg) {
            self.parked.push_back(msg);
        }
    }

    /// Routes one message against the current snapshot. `Err` hands the
    /// message back when no connector can take it right now.
    fn try_route(&mut self, msg: Msg) -> Result<(), Msg> {
        if msg.payload_size() + self.msg_overhead > self.config.message_max_bytes {
            warn!(
                topic = msg.topic(),
                size = msg.payload_size(),
                "message exceeds message.max.bytes"
            );
            self.anomaly.discard_msg(msg, DiscardKind::ProduceErr);
            return Ok(());
        }
        if self.rate_limiter.is_limited(msg.topic()) {
            self.anomaly.discard_msg(msg, DiscardKind::RateLimited);
            return Ok(());
        }

        let md = Arc::clone(&self.md);
        let Some(topic_md) = md.topic(msg.topic()) else {
            self.handle_unknown_topic(msg);
            return Ok(());
        };

        match msg.routing() {
            Routing::PartitionKey(key) => {
                let leader = topic_md
                    .partition_for_key(key)
                    .expect("known topics have partitions");
                let routed = RoutedMsg {
                    msg,
                    partition: leader.id,
                };
                self.dispatcher
                    .dispatch(leader.broker_index, routed)
                    .map_err(|routed| routed.msg)
            }
            Routing::AnyPartition => {
                let topic = msg.topic().to_owned();
                let brokers = topic_md.broker_indexes();
                let cursor = self.broker_cursor.get(&topic).copied().unwrap_or(0);
                let broker_index = brokers[(cursor % brokers.len() as u64) as usize];

                let partitions = topic_md.partitions_on(broker_index);
                let chooser = self
                    .choosers
                    .entry((broker_index, topic.clone()))
                    .or_default();
                let partition = chooser.choice(partitions);

                match self.dispatcher.dispatch(broker_index, RoutedMsg { msg, partition }) {
                    Ok(()) => {
                        let chooser = self
                            .choosers
                            .get_mut(&(broker_index, topic.clone()))
                            .expect("chooser just inserted");
                        chooser.set_choice_used();
                        chooser.clear_choice();
                        *self.broker_cursor.entry(topic).or_insert(0) += 1;
                        Ok(())
                    }
                    Err(routed) => Err(routed.msg),
                }
            }
        }
    }

    fn handle_unknown_topic(&mut self, msg: Msg) {
        if !self.config.topic_autocreate {
            self.anomaly.discard_msg(msg, DiscardKind::UnknownTopic);
            return;
        }

        let topic = msg.topic().to_owned();
        match self.auto_create.get_mut(&topic) {
            Some(AutoCreateState::Pending { msgs, .. }) => msgs.push(msg),
            Some(AutoCreateState::Failed) => {
                self.anomaly.discard_msg(msg, DiscardKind::UnknownTopic);
            }
            None => {
                info!(topic = %topic, "unknown topic; requesting auto-create");
                drop(
                    self.refresh_tx
                        .try_send(RefreshRequest::AutoCreate(topic.clone())),
                );
                self.auto_create.insert(
                    topic,
                    AutoCreateState::Pending {
                        msgs: vec![msg],
                        refreshes_seen: 0,
                    },
                );
            }
        }
    }

    /// Swap in fresh metadata: drain connectors, restart them against
    /// the new topology, then re-route everything that was in flight.
    async fn rebalance(&mut self, md: Arc<Metadata>) {
        metrics::counter!("dory_rebalances_total").increment(1);
        info!(
            brokers = md.brokers().len(),
            topics = md.topic_count(),
            "rebalancing"
        );

        let leftovers = self.dispatcher.drain_all().await;
        self.md = md;
        self.choosers.clear();
        self.broker_cursor.clear();
        self.dispatcher.start(&self.md);

        // Drained messages go to the head of the parked queue so their
        // relative order survives the reroute.
        for msg in leftovers.into_iter().rev() {
            self.parked.push_front(msg);
        }

        self.resolve_auto_creates();
        self.retry_parked();
    }

    fn resolve_auto_creates(&mut self) {
        let topics: Vec<String> = self.auto_create.keys().cloned().collect();
        for topic in topics {
            let Some(AutoCreateState::Pending {
                msgs,
                refreshes_seen,
            }) = self.auto_create.get_mut(&topic)
            else {
                continue;
            };

            if self.md.topic(&topic).is_some() {
                let msgs = std::mem::take(msgs);
                self.auto_create.remove(&topic);
                info!(topic = %topic, count = msgs.len(), "auto-created topic is live");
                for msg in msgs {
                    self.parked.push_back(msg);
                }
            } else {
                *refreshes_seen += 1;
                if *refreshes_seen >= AUTO_CREATE_MAX_REFRESHES {
                    let msgs = std::mem::take(msgs);
                    warn!(topic = %topic, "topic auto-create failed");
                    self.auto_create.insert(topic, AutoCreateState::Failed);
                    for msg in msgs {
                        self.anomaly.discard_msg(msg, DiscardKind::UnknownTopic);
                    }
                }
            }
        }
    }

    fn retry_parked(&mut self) {
        while let Some(msg) = self.parked.pop_front() {
            if let Err(msg) = self.try_route(msg) {
                self.parked.push_front(msg);
                break;
            }
        }
    }

    /// A connector hit trouble: back off if pauses are coming fast, then
    /// drain everyone and ask for fresh metadata. The rebalance itself
    /// runs when the refresher publishes.
    async fn handle_pause(&mut self, event: DispatcherEvent, shutdown: &mut ShutdownRx) {
        let DispatcherEvent::PauseNeeded {
            broker_index,
            reason,
        } = event;
        warn!(broker_index, reason = reason.as_tag(), "connector paused");

        let delay = self.pause_backoff.next_delay(Instant::now());
        if !delay.is_zero() {
            debug!(?delay, "pause backoff");
            self.health.report_healthy();
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let leftovers = self.dispatcher.drain_all().await;
        for msg in leftovers.into_iter().rev() {
            self.parked.push_front(msg);
        }
        drop(self.refresh_tx.send(RefreshRequest::Full).await);
    }

    async fn finish_slow(&mut self, deadline: Instant, shutdown: &mut ShutdownRx) {
        info!("router shutting down (slow)");
        // Whatever is already buffered still gets a chance to ship.
        while let Ok(msg) = self.msg_rx.try_recv() {
            self.accept(msg);
        }
        self.retry_parked();
        self.discard_unroutable();

        tokio::select! {
            clean = self.dispatcher.slow_shutdown(deadline) => {
                info!(clean, "dispatcher finished");
            }
            _ = wait_for_fast(shutdown) => {
                info!("fast shutdown requested mid-drain");
                self.dispatcher.fast_shutdown().await;
            }
        }
    }

    async fn finish_fast(&mut self) {
        info!("router shutting down (fast)");
        while let Ok(msg) = self.msg_rx.try_recv() {
            self.anomaly.discard_msg(msg, DiscardKind::ShutdownDiscard);
        }
        self.discard_unroutable();
        self.dispatcher.fast_shutdown().await;
    }

    fn discard_unroutable(&mut self) {
        for msg in self.parked.drain(..) {
            self.anomaly.discard_msg(msg, DiscardKind::ShutdownDiscard);
        }
        for (_, state) in self.auto_create.drain() {
            if let AutoCreateState::Pending { msgs, .. } = state {
                for msg in msgs {
                    self.anomaly.discard_msg(msg, DiscardKind::ShutdownDiscard);
                }
            }
        }
    }
}

async fn wait_for_fast(shutdown: &mut ShutdownRx) {
    loop {
        if shutdown.borrow_and_update().is_fast() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
