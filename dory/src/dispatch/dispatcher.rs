use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::anomaly::AnomalyTracker;
use crate::batch::BrokerBatcher;
use crate::metadata::Metadata;
use crate::msg::{Msg, RoutedMsg};

use super::connector::{
    Connector, ConnectorCommand, ConnectorReport, ConnectorStatusBoard,
};
use super::ProducerSettings;

/// Per-connector input queue depth. Small on purpose: the pool is the
/// real buffer, this only smooths bursts.
const CONNECTOR_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    ConnectFailed,
    ConnectionLost,
    BrokerAck,
}

impl PauseReason {
    pub fn as_tag(self) -> &'static str {
        match self {
            PauseReason::ConnectFailed => "connect_failed",
            PauseReason::ConnectionLost => "connection_lost",
            PauseReason::BrokerAck => "broker_ack",
        }
    }
}

/// Connector-to-supervisor notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherEvent {
    PauseNeeded {
        broker_index: usize,
        reason: PauseReason,
    },
}

struct ConnectorEntry {
    broker_index: usize,
    msg_tx: mpsc::Sender<RoutedMsg>,
    command_tx: watch::Sender<ConnectorCommand>,
    join: JoinHandle<ConnectorReport>,
}

/// Supervises one connector per in-service broker. The router owns the
/// dispatcher and drives its lifecycle: start against a metadata
/// snapshot, dispatch by broker index, drain everything for a rebalance,
/// and coordinate shutdown.
pub struct Dispatcher {
    settings: Arc<ProducerSettings>,
    anomaly: Arc<AnomalyTracker>,
    board: Arc<ConnectorStatusBoard>,
    event_tx: mpsc::Sender<DispatcherEvent>,
    event_rx: mpsc::Receiver<DispatcherEvent>,
    connectors: Vec<ConnectorEntry>,
}

impl Dispatcher {
    pub fn new(
        settings: Arc<ProducerSettings>,
        anomaly: Arc<AnomalyTracker>,
        board: Arc<ConnectorStatusBoard>,
    ) -> Dispatcher {
        let (event_tx, event_rx) = mpsc::channel(64);
        Dispatcher {
            settings,
            anomaly,
            board,
            event_tx,
            event_rx,
            connectors: Vec::new(),
        }
    }

    /// Spawns one connector per in-service broker in `md`. Any previous
    /// set must have been drained or shut down first.
    pub fn start(&mut self, md: &Metadata) {
        debug_assert!(self.connectors.is_empty());

        for broker_index in md.in_service_brokers() {
            let Some(broker) = md.broker(broker_index) else {
                continue;
            };
            let (msg_tx, msg_rx) = mpsc::channel(CONNECTOR_QUEUE_DEPTH);
            let (command_tx, command_rx) = watch::channel(ConnectorCommand::Run);
            let overhead = self.settings.protocol.single_msg_overhead();
            let connector = Connector {
                broker_index,
                broker: broker.clone(),
                settings: Arc::clone(&self.settings),
                anomaly: Arc::clone(&self.anomaly),
                board: Arc::clone(&self.board),
                msg_rx,
                command_rx,
                event_tx: self.event_tx.clone(),
                batcher: BrokerBatcher::new(self.settings.batching.clone(), overhead),
                send_wait: VecDeque::new(),
                no_ack: VecDeque::new(),
                correlation_id: 0,
            };
            self.connectors.push(ConnectorEntry {
                broker_index,
                msg_tx,
                command_tx,
                join: tokio::spawn(connector.run()),
            });
        }
        metrics::gauge!("dory_connectors").set(self.connectors.len() as f64);
        info!(connectors = self.connectors.len(), "dispatcher started");
    }

    pub fn connector_count(&self) -> usize {
        self.connectors.len()
    }

    /// Hands a routed message to its broker's connector. Fails without
    /// blocking (returning the message) when the connector is missing or
    /// backed up; the router parks and retries after the next rebalance.
    pub fn dispatch(&self, broker_index: usize, routed: RoutedMsg) -> Result<(), RoutedMsg> {
        let Some(entry) = self
            .connectors
            .iter()
            .find(|c| c.broker_index == broker_index)
        else {
            return Err(routed);
        };
        entry.msg_tx.try_send(routed).map_err(|err| match err {
            mpsc::error::TrySendError::Full(routed) => routed,
            mpsc::error::TrySendError::Closed(routed) => routed,
        })
    }

    /// For the router's select loop.
    pub fn events(&mut self) -> &mut mpsc::Receiver<DispatcherEvent> {
        &mut self.event_rx
    }

    /// Stops every connector and collects everything they still owned,
    /// in pipeline order per connector. Stale pause events are dropped:
    /// the connectors they speak of no longer exist.
    pub async fn drain_all(&mut self) -> Vec<Msg> {
        for entry in &self.connectors {
            _ = entry.command_tx.send(ConnectorCommand::Drain);
        }

        let mut leftovers = Vec::new();
        for entry in self.connectors.drain(..) {
            match entry.join.await {
                Ok(report) => leftovers.extend(report.leftovers),
                Err(err) => error!(error = %err, "connector task failed"),
            }
        }
        while self.event_rx.try_recv().is_ok() {}

        metrics::gauge!("dory_connectors").set(0.0);
        leftovers
    }

    /// Lets connectors finish in-flight work until the deadline.
    /// Returns true when nothing had to be discarded.
    pub async fn slow_shutdown(&mut self, deadline: Instant) -> bool {
        self.finish(ConnectorCommand::SlowShutdown(deadline)).await
    }

    /// Drops everything immediately.
    pub async fn fast_shutdown(&mut self) -> bool {
        self.finish(ConnectorCommand::FastShutdown).await
    }

    async fn finish(&mut self, command: ConnectorCommand) -> bool {
        for entry in &self.connectors {
            _ = entry.command_tx.send(command);
        }

        let mut clean = true;
        for entry in self.connectors.drain(..) {
            match entry.join.await {
                Ok(report) => {
                    // Shutdown paths discard internally; anything handed
                    // back here has nowhere to go.
                    clean &= report.clean && report.leftovers.is_empty();
                    for msg in report.leftovers {
                        self.anomaly
                            .discard_msg(msg, crate::anomaly::DiscardKind::ShutdownDiscard);
                    }
                }
                Err(err) => {
                    error!(error = %err, "connector task failed during shutdown");
                    clean = false;
                }
            }
        }
        while self.event_rx.try_recv().is_ok() {}
        metrics::gauge!("dory_connectors").set(0.0);
        clean
    }
}
