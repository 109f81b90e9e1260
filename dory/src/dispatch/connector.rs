use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::anomaly::{AnomalyTracker, DiscardKind};
use crate::batch::{BrokerBatcher, TopicBatch};
use crate::kafka::produce::{PartitionData, ProduceRequest, TopicData};
use crate::kafka::{ack_action, error_name, AckAction};
use crate::metadata::Broker;
use crate::msg::{Msg, MsgState, RoutedMsg};

use super::dispatcher::{DispatcherEvent, PauseReason};
use super::ProducerSettings;

/// Largest produce response we will buffer.
const MAX_RESPONSE_SIZE: i32 = 4 * 1024 * 1024;

/// Connector lifecycle. Only `Running` accepts new dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Running,
    Paused,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatus {
    pub broker_id: i32,
    pub host: String,
    pub port: u16,
    pub state: ConnectorState,
    pub send_wait_batches: usize,
    pub no_ack_requests: usize,
}

/// Shared read-only view of every connector, for the diagnostics surface.
#[derive(Default)]
pub struct ConnectorStatusBoard {
    inner: Mutex<HashMap<i32, ConnectorStatus>>,
}

impl ConnectorStatusBoard {
    pub fn snapshot(&self) -> Vec<ConnectorStatus> {
        let mut all: Vec<ConnectorStatus> = self
            .inner
            .lock()
            .expect("poisoned connector board")
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|s| s.broker_id);
        all
    }

    fn update(&self, status: ConnectorStatus) {
        self.inner
            .lock()
            .expect("poisoned connector board")
            .insert(status.broker_id, status);
    }

    fn remove(&self, broker_id: i32) {
        self.inner
            .lock()
            .expect("poisoned connector board")
            .remove(&broker_id);
    }
}

/// Dispatcher-to-connector control. Watch-carried so a connector sees the
/// latest command at any suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorCommand {
    Run,
    /// Stop and hand every owned message back for rerouting.
    Drain,
    /// Finish in-flight work until the deadline, then discard the rest.
    SlowShutdown(Instant),
    /// Discard everything and stop now.
    FastShutdown,
}

/// What a connector hands back when it stops.
pub struct ConnectorReport {
    /// Messages to reroute after a drain; empty on shutdown paths.
    pub leftovers: Vec<Msg>,
    /// True when the connector stopped without discarding anything.
    pub clean: bool,
}

/// A request on the wire, awaiting its ack: the correlation id and the
/// per-(topic, partition) message groups it carried.
pub(crate) struct InFlight {
    correlation_id: i32,
    sent_at: Instant,
    groups: Vec<SentGroup>,
}

pub(crate) struct SentGroup {
    topic: String,
    partition: i32,
    msgs: Vec<Msg>,
}

/// One broker's produce pipeline: a TCP connection, the batcher feeding
/// it, the send-wait queue of ready batches, and the no-ack queue of
/// requests written but not yet answered. Responses arrive in request
/// order, so acks always match the head of the no-ack queue.
pub(crate) struct Connector {
    pub(crate) broker_index: usize,
    pub(crate) broker: Broker,
    pub(crate) settings: Arc<ProducerSettings>,
    pub(crate) anomaly: Arc<AnomalyTracker>,
    pub(crate) board: Arc<ConnectorStatusBoard>,
    pub(crate) msg_rx: mpsc::Receiver<RoutedMsg>,
    pub(crate) command_rx: watch::Receiver<ConnectorCommand>,
    pub(crate) event_tx: mpsc::Sender<DispatcherEvent>,
    pub(crate) batcher: BrokerBatcher,
    pub(crate) send_wait: VecDeque<TopicBatch>,
    pub(crate) no_ack: VecDeque<InFlight>,
    pub(crate) correlation_id: i32,
}

type AckFrame = Result<Vec<u8>, std::io::Error>;

/// How the connector's main loop ended.
enum LoopExit {
    Report(ConnectorReport),
    /// Pause requested; true when the ack stream is still worth reading.
    Pause(PauseReason, bool),
}

impl Connector {
    pub(crate) async fn run(mut self) -> ConnectorReport {
        let report = self.run_inner().await;
        self.set_state(ConnectorState::Stopped);
        self.board.remove(self.broker.id);
        report
    }

    async fn run_inner(&mut self) -> ConnectorReport {
        self.set_state(ConnectorState::Connecting);

        let connect = tokio::time::timeout(
            self.settings.socket_timeout,
            TcpStream::connect((self.broker.host.as_str(), self.broker.port)),
        )
        .await;
        let stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                warn!(broker = self.broker.id, error = %err, "broker connect failed");
                return self.pause_and_wait(PauseReason::ConnectFailed, None).await;
            }
            Err(_) => {
                warn!(broker = self.broker.id, "broker connect timed out");
                return self.pause_and_wait(PauseReason::ConnectFailed, None).await;
            }
        };
        drop(stream.set_nodelay(true));
        info!(broker = self.broker.id, host = %self.broker.host, "connected");

        let (read_half, mut write_half) = stream.into_split();
        let (ack_tx, mut ack_rx) = mpsc::channel::<AckFrame>(16);
        let reader = tokio::spawn(read_acks(read_half, ack_tx));

        self.set_state(ConnectorState::Running);
        let mut closing: Option<Instant> = None;
        let mut input_open = true;

        let exit = loop {
            if let Err(err) = self.flush_send_wait(&mut write_half).await {
                warn!(broker = self.broker.id, error = %err, "produce write failed");
                self.recycle_no_ack(true);
                break LoopExit::Pause(PauseReason::ConnectionLost, false);
            }

            if closing.is_some() && self.is_idle() {
                break LoopExit::Report(ConnectorReport {
                    leftovers: Vec::new(),
                    clean: true,
                });
            }

            let batch_deadline = self.batcher.next_complete_time();
            let ack_deadline = self
                .no_ack
                .front()
                .map(|f| f.sent_at + self.settings.socket_timeout);

            tokio::select! {
                changed = self.command_rx.changed() => {
                    if changed.is_err() {
                        // Supervisor is gone; nothing can reroute for us.
                        break LoopExit::Report(self.discard_everything());
                    }
                    let command = *self.command_rx.borrow();
                    match command {
                        ConnectorCommand::Run => {}
                        ConnectorCommand::Drain => break LoopExit::Report(self.drain_now()),
                        ConnectorCommand::FastShutdown => {
                            break LoopExit::Report(self.discard_everything());
                        }
                        ConnectorCommand::SlowShutdown(deadline) => {
                            closing = Some(deadline);
                            let flushed = self.batcher.take_all();
                            self.send_wait.extend(flushed);
                        }
                    }
                }
                _ = async { tokio::time::sleep_until(closing.unwrap()).await },
                        if closing.is_some() => {
                    break LoopExit::Report(self.discard_everything());
                }
                routed = self.msg_rx.recv(), if input_open && closing.is_none() => {
                    match routed {
                        Some(routed) => {
                            let ready = self.batcher.add(routed, Instant::now());
                            self.send_wait.extend(ready);
                        }
                        None => input_open = false,
                    }
                }
                _ = async { tokio::time::sleep_until(batch_deadline.unwrap()).await },
                        if batch_deadline.is_some() && closing.is_none() => {
                    let ready = self.batcher.take_expired(Instant::now());
                    self.send_wait.extend(ready);
                }
                ack = ack_rx.recv() => match ack {
                    Some(Ok(payload)) => match self.handle_ack(&payload) {
                        Ok(false) => {}
                        Ok(true) => break LoopExit::Pause(PauseReason::BrokerAck, true),
                        Err(err) => {
                            warn!(broker = self.broker.id, error = %err, "bad produce response");
                            self.recycle_no_ack(true);
                            break LoopExit::Pause(PauseReason::ConnectionLost, false);
                        }
                    },
                    Some(Err(err)) => {
                        warn!(broker = self.broker.id, error = %err, "broker connection lost");
                        self.recycle_no_ack(true);
                        break LoopExit::Pause(PauseReason::ConnectionLost, false);
                    }
                    None => {
                        self.recycle_no_ack(true);
                        break LoopExit::Pause(PauseReason::ConnectionLost, false);
                    }
                },
                _ = async { tokio::time::sleep_until(ack_deadline.unwrap()).await },
                        if ack_deadline.is_some() => {
                    warn!(broker = self.broker.id, "timed out waiting for produce ack");
                    self.recycle_no_ack(true);
                    break LoopExit::Pause(PauseReason::ConnectionLost, false);
                }
            }
        };

        match exit {
            LoopExit::Report(report) => {
                reader.abort();
                report
            }
            LoopExit::Pause(reason, true) => {
                let report = self.pause_and_wait(reason, Some(&mut ack_rx)).await;
                reader.abort();
                report
            }
            LoopExit::Pause(reason, false) => {
                reader.abort();
                self.pause_and_wait(reason, None).await
            }
        }
    }

    /// Signals the dispatcher, then sits paused until told what to do.
    /// While the ack stream is still alive, in-flight requests are given
    /// until the socket timeout to resolve so their messages do not get
    /// recycled as possible duplicates needlessly.
    async fn pause_and_wait(
        &mut self,
        reason: PauseReason,
        mut ack_rx: Option<&mut mpsc::Receiver<AckFrame>>,
    ) -> ConnectorReport {
        self.set_state(ConnectorState::Paused);
        metrics::counter!("dory_connector_pauses_total", "reason" => reason.as_tag())
            .increment(1);
        _ = self
            .event_tx
            .send(DispatcherEvent::PauseNeeded {
                broker_index: self.broker_index,
                reason,
            })
            .await;

        let ack_grace = Instant::now() + self.settings.socket_timeout;
        loop {
            let acks_pending = ack_rx.is_some() && !self.no_ack.is_empty();
            tokio::select! {
                changed = self.command_rx.changed() => {
                    if changed.is_err() {
                        return self.discard_everything();
                    }
                    let command = *self.command_rx.borrow();
                    match command {
                        ConnectorCommand::Run => {}
                        ConnectorCommand::Drain => return self.drain_now(),
                        // A paused broker cannot flush anything, slow or
                        // not: discard rather than hang the shutdown.
                        ConnectorCommand::SlowShutdown(_) | ConnectorCommand::FastShutdown => {
                            return self.discard_everything();
                        }
                    }
                }
                ack = recv_opt(&mut ack_rx), if acks_pending => {
                    match ack {
                        Some(Ok(payload)) => {
                            // Later pause causes are already moot.
                            if self.handle_ack(&payload).is_err() {
                                self.recycle_no_ack(true);
                                ack_rx = None;
                            }
                        }
                        _ => {
                            self.recycle_no_ack(true);
                            ack_rx = None;
                        }
                    }
                }
                _ = tokio::time::sleep_until(ack_grace), if acks_pending => {
                    self.recycle_no_ack(true);
                    ack_rx = None;
                }
            }
        }
    }

    /// Hands back everything this connector owns, in pipeline order:
    /// unacked wire messages first, then ready batches, then whatever was
    /// still batching, then anything that raced into the input channel.
    fn drain_now(&mut self) -> ConnectorReport {
        self.set_state(ConnectorState::Draining);
        self.recycle_no_ack(true);

        let mut leftovers: Vec<Msg> = Vec::new();
        for batch in self.send_wait.drain(..) {
            leftovers.extend(batch.msgs.into_iter().map(|r| r.msg));
        }
        for batch in self.batcher.take_all() {
            leftovers.extend(batch.msgs.into_iter().map(|r| r.msg));
        }
        while let Ok(routed) = self.msg_rx.try_recv() {
            leftovers.push(routed.msg);
        }

        debug!(
            broker = self.broker.id,
            count = leftovers.len(),
            "connector drained"
        );
        ConnectorReport {
            leftovers,
            clean: true,
        }
    }

    fn discard_everything(&mut self) -> ConnectorReport {
        let report = self.drain_now();
        let clean = report.leftovers.is_empty();
        for msg in report.leftovers {
            self.anomaly.discard_msg(msg, DiscardKind::ShutdownDiscard);
        }
        ConnectorReport {
            leftovers: Vec::new(),
            clean,
        }
    }

    /// Moves every in-flight request back onto the head of the send-wait
    /// queue, preserving order. `mark_duplicates` is set when their
    /// delivery outcome is unknown (lost connection, missing ack).
    fn recycle_no_ack(&mut self, mark_duplicates: bool) {
        let inflight: Vec<InFlight> = self.no_ack.drain(..).collect();
        for flight in inflight.into_iter().rev() {
            for group in flight.groups.into_iter().rev() {
                if mark_duplicates {
                    for msg in &group.msgs {
                        self.anomaly.possible_duplicate(msg);
                    }
                }
                let partition = group.partition;
                self.send_wait.push_front(TopicBatch {
                    topic: group.topic,
                    msgs: group
                        .msgs
                        .into_iter()
                        .map(|msg| RoutedMsg { msg, partition })
                        .collect(),
                });
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.send_wait.is_empty() && self.no_ack.is_empty() && self.batcher.is_empty()
    }

    /// Builds and writes produce requests until the send-wait queue is
    /// empty. A write failure leaves the unwritten messages at the head
    /// of the queue.
    async fn flush_send_wait(&mut self, write_half: &mut OwnedWriteHalf) -> std::io::Result<()> {
        while let Some((bytes, mut groups)) = self.build_request() {
            let write = tokio::time::timeout(
                self.settings.socket_timeout,
                write_half.write_all(&bytes),
            )
            .await;
            match write {
                Ok(Ok(())) => {
                    let msg_count: usize = groups.iter().map(|g| g.msgs.len()).sum();
                    metrics::counter!("dory_produce_requests_total").increment(1);
                    metrics::histogram!("dory_produce_request_bytes").record(bytes.len() as f64);
                    for group in &mut groups {
                        for msg in &mut group.msgs {
                            msg.set_state(MsgState::AwaitingAck);
                        }
                    }
                    debug!(
                        broker = self.broker.id,
                        correlation_id = self.correlation_id,
                        msgs = msg_count,
                        "produce request written"
                    );
                    self.no_ack.push_back(InFlight {
                        correlation_id: self.correlation_id,
                        sent_at: Instant::now(),
                        groups,
                    });
                }
                Ok(Err(err)) => {
                    self.requeue_groups(groups);
                    return Err(err);
                }
                Err(_) => {
                    self.requeue_groups(groups);
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "produce write timed out",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Pops ready batches and folds them into one produce request, up to
    /// the data limit. The first batch always goes, even when it is
    /// larger than the limit by itself.
    fn build_request(&mut self) -> Option<(BytesMut, Vec<SentGroup>)> {
        let first = self.send_wait.pop_front()?;
        let overhead = self.settings.protocol.single_msg_overhead();

        let mut total = first.wire_size(overhead);
        let mut taken = vec![first];
        while let Some(next) = self.send_wait.front() {
            let size = next.wire_size(overhead);
            if total + size > self.settings.produce_request_data_limit {
                break;
            }
            total += size;
            let next = self.send_wait.pop_front().expect("front exists");
            taken.push(next);
        }

        let mut groups: Vec<SentGroup> = Vec::new();
        for batch in taken {
            for routed in batch.msgs {
                let mut msg = routed.msg;
                msg.set_state(MsgState::Sending);
                match groups
                    .iter_mut()
                    .find(|g| g.topic == batch.topic && g.partition == routed.partition)
                {
                    Some(group) => group.msgs.push(msg),
                    None => groups.push(SentGroup {
                        topic: batch.topic.clone(),
                        partition: routed.partition,
                        msgs: vec![msg],
                    }),
                }
            }
        }

        self.correlation_id = self.correlation_id.wrapping_add(1);
        let mut topics: Vec<TopicData<'_>> = Vec::new();
        for group in &groups {
            let wire_size: usize = group
                .msgs
                .iter()
                .map(|m| overhead + m.payload_size())
                .sum();
            let compression = self.settings.compression.for_batch(
                &group.topic,
                wire_size,
                self.settings.message_max_bytes,
            );
            let partition_data = PartitionData {
                partition: group.partition,
                compression: compression.codec,
                compression_level: compression.level,
                msgs: &group.msgs,
            };
            match topics.iter_mut().find(|t| t.topic == group.topic) {
                Some(topic) => topic.partitions.push(partition_data),
                None => topics.push(TopicData {
                    topic: &group.topic,
                    partitions: vec![partition_data],
                }),
            }
        }

        let request = ProduceRequest {
            correlation_id: self.correlation_id,
            client_id: &self.settings.client_id,
            required_acks: self.settings.required_acks,
            replication_timeout_ms: self.settings.replication_timeout_ms,
            topics,
        };

        let mut bytes = BytesMut::new();
        if let Err(err) = self.settings.protocol.encode_request(&request, &mut bytes) {
            // Compression failed; ship the batch uncompressed instead of
            // losing it.
            warn!(error = %err, "produce encode failed; retrying uncompressed");
            bytes.clear();
            let plain = ProduceRequest {
                correlation_id: self.correlation_id,
                client_id: &self.settings.client_id,
                required_acks: self.settings.required_acks,
                replication_timeout_ms: self.settings.replication_timeout_ms,
                topics: groups
                    .iter()
                    .fold(Vec::new(), |mut topics: Vec<TopicData<'_>>, group| {
                        let partition_data = PartitionData {
                            partition: group.partition,
                            compression: crate::compress::CompressionType::None,
                            compression_level: None,
                            msgs: &group.msgs,
                        };
                        match topics.iter_mut().find(|t| t.topic == group.topic) {
                            Some(topic) => topic.partitions.push(partition_data),
                            None => topics.push(TopicData {
                                topic: &group.topic,
                                partitions: vec![partition_data],
                            }),
                        }
                        topics
                    }),
            };
            self.settings
                .protocol
                .encode_request(&plain, &mut bytes)
                .expect("uncompressed encode cannot fail");
        }

        Some((bytes, groups))
    }

    /// Applies the ack-action table to one produce response. Returns
    /// `Ok(true)` when some partition demands a pause.
    fn handle_ack(&mut self, payload: &[u8]) -> Result<bool, AckError> {
        let response = self
            .settings
            .protocol
            .decode_response(payload)
            .map_err(AckError::Decode)?;

        // Validate against the head in place: on any error the request
        // stays in the no-ack queue for the caller to recycle.
        let front = self.no_ack.front().ok_or(AckError::Unexpected)?;
        if front.correlation_id != response.correlation_id {
            return Err(AckError::CorrelationMismatch {
                expected: front.correlation_id,
                got: response.correlation_id,
            });
        }
        for group in &front.groups {
            if !response
                .acks
                .iter()
                .any(|a| a.topic == group.topic && a.partition == group.partition)
            {
                return Err(AckError::MissingPartition);
            }
        }
        let flight = self.no_ack.pop_front().expect("validated head");
        metrics::histogram!("dory_produce_ack_seconds")
            .record(flight.sent_at.elapsed().as_secs_f64());

        let mut pause_needed = false;
        let mut resend: Vec<SentGroup> = Vec::new();
        for group in flight.groups {
            let ack = response
                .acks
                .iter()
                .find(|a| a.topic == group.topic && a.partition == group.partition)
                .expect("validated above");

            match ack_action(ack.error_code) {
                AckAction::Ok => {
                    metrics::counter!("dory_msgs_delivered_total")
                        .increment(group.msgs.len() as u64);
                    for mut msg in group.msgs {
                        msg.set_state(MsgState::Processed);
                    }
                }
                AckAction::Resend => {
                    debug!(
                        topic = %group.topic,
                        partition = group.partition,
                        error = error_name(ack.error_code),
                        "transient produce error; requeueing"
                    );
                    let mut keep = SentGroup {
                        topic: group.topic,
                        partition: group.partition,
                        msgs: Vec::with_capacity(group.msgs.len()),
                    };
                    for mut msg in group.msgs {
                        msg.record_failed_delivery();
                        if msg.failed_deliveries() > self.settings.max_failed_deliveries {
                            self.anomaly.discard_msg(msg, DiscardKind::FailedDelivery);
                        } else {
                            keep.msgs.push(msg);
                        }
                    }
                    if !keep.msgs.is_empty() {
                        resend.push(keep);
                    }
                }
                AckAction::Discard => {
                    warn!(
                        topic = %group.topic,
                        partition = group.partition,
                        error = error_name(ack.error_code),
                        "permanent produce error; discarding batch"
                    );
                    for msg in group.msgs {
                        self.anomaly.discard_msg(msg, DiscardKind::ProduceErr);
                    }
                }
                AckAction::Pause => {
                    info!(
                        topic = %group.topic,
                        partition = group.partition,
                        error = error_name(ack.error_code),
                        "broker asks for a pause"
                    );
                    pause_needed = true;
                    resend.push(group);
                }
                AckAction::DiscardAndPause => {
                    warn!(
                        topic = %group.topic,
                        partition = group.partition,
                        error = error_name(ack.error_code),
                        "discarding batch and pausing"
                    );
                    pause_needed = true;
                    for msg in group.msgs {
                        self.anomaly.discard_msg(msg, DiscardKind::ProduceErr);
                    }
                }
            }
        }

        // Failed groups go back to the head, oldest first.
        for group in resend.into_iter().rev() {
            let partition = group.partition;
            self.send_wait.push_front(TopicBatch {
                topic: group.topic,
                msgs: group
                    .msgs
                    .into_iter()
                    .map(|msg| RoutedMsg { msg, partition })
                    .collect(),
            });
        }

        Ok(pause_needed)
    }

    fn requeue_groups(&mut self, groups: Vec<SentGroup>) {
        for group in groups.into_iter().rev() {
            let partition = group.partition;
            self.send_wait.push_front(TopicBatch {
                topic: group.topic,
                msgs: group
                    .msgs
                    .into_iter()
                    .map(|msg| RoutedMsg { msg, partition })
                    .collect(),
            });
        }
    }

    fn set_state(&self, state: ConnectorState) {
        self.board.update(ConnectorStatus {
            broker_id: self.broker.id,
            host: self.broker.host.clone(),
            port: self.broker.port,
            state,
            send_wait_batches: self.send_wait.len(),
            no_ack_requests: self.no_ack.len(),
        });
    }
}

#[derive(Debug, thiserror::Error)]
enum AckError {
    #[error("{0}")]
    Decode(crate::kafka::produce::ProduceDecodeError),
    #[error("response with no request in flight")]
    Unexpected,
    #[error("correlation id mismatch: expected {expected}, got {got}")]
    CorrelationMismatch { expected: i32, got: i32 },
    #[error("response is missing an acked partition")]
    MissingPartition,
}

async fn recv_opt(rx: &mut Option<&mut mpsc::Receiver<AckFrame>>) -> Option<AckFrame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Reads length-prefixed response frames until the connection dies.
async fn read_acks(mut read_half: OwnedReadHalf, tx: mpsc::Sender<AckFrame>) {
    loop {
        let mut head = [0u8; 4];
        if let Err(err) = read_half.read_exact(&mut head).await {
            drop(tx.send(Err(err)).await);
            return;
        }
        let size = i32::from_be_bytes(head);
        if !(0..=MAX_RESPONSE_SIZE).contains(&size) {
            drop(
                tx.send(Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad response frame size {size}"),
                )))
                .await,
            );
            return;
        }

        let mut payload = vec![0u8; size as usize];
        if let Err(err) = read_half.read_exact(&mut payload).await {
            drop(tx.send(Err(err)).await);
            return;
        }
        if tx.send(Ok(payload)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchConfig, BatchingConfig};
    use crate::compress::CompressionPolicy;
    use crate::kafka::produce::{self, ProduceProtocolV0};
    use crate::msg::test_support;
    use crate::pool::Pool;
    use std::time::Duration;

    fn settings() -> Arc<ProducerSettings> {
        Arc::new(ProducerSettings {
            client_id: "dory".to_owned(),
            required_acks: 1,
            replication_timeout_ms: 10_000,
            message_max_bytes: 1_000_000,
            produce_request_data_limit: 100,
            socket_timeout: Duration::from_secs(5),
            max_failed_deliveries: 2,
            batching: BatchingConfig {
                default_topic: Some(BatchConfig {
                    max_count: Some(100),
                    ..Default::default()
                }),
                ..Default::default()
            },
            compression: CompressionPolicy::default(),
            protocol: Arc::new(ProduceProtocolV0),
        })
    }

    fn connector(settings: Arc<ProducerSettings>) -> (Connector, mpsc::Receiver<DispatcherEvent>) {
        let (_msg_tx, msg_rx) = mpsc::channel(16);
        let (_command_tx, command_rx) = watch::channel(ConnectorCommand::Run);
        let (event_tx, event_rx) = mpsc::channel(16);
        let batching = settings.batching.clone();
        let overhead = settings.protocol.single_msg_overhead();
        (
            Connector {
                broker_index: 0,
                broker: Broker {
                    id: 1,
                    host: "127.0.0.1".to_owned(),
                    port: 9092,
                },
                settings,
                anomaly: Arc::new(crate::anomaly::AnomalyTracker::new()),
                board: Arc::new(ConnectorStatusBoard::default()),
                msg_rx,
                command_rx,
                event_tx,
                batcher: BrokerBatcher::new(batching, overhead),
                send_wait: VecDeque::new(),
                no_ack: VecDeque::new(),
                correlation_id: 0,
            },
            event_rx,
        )
    }

    fn batch(pool: &Arc<Pool>, topic: &str, partition: i32, values: &[&[u8]]) -> TopicBatch {
        TopicBatch {
            topic: topic.to_owned(),
            msgs: values
                .iter()
                .map(|v| RoutedMsg {
                    msg: test_support::msg(pool, topic, v),
                    partition,
                })
                .collect(),
        }
    }

    fn discard_all(connector: &mut Connector) {
        let report = connector.drain_now();
        for msg in report.leftovers {
            connector
                .anomaly
                .discard_msg(msg, DiscardKind::ShutdownDiscard);
        }
    }

    #[tokio::test]
    async fn request_packing_respects_data_limit() {
        // Each message is 26 (overhead) + 4 bytes = 30; the limit of 100
        // fits three batches of one message each, not four.
        let (mut connector, _events) = connector(settings());
        let pool = Pool::new(64, 64).unwrap();
        for i in 0..4 {
            connector
                .send_wait
                .push_back(batch(&pool, "t", i, &[b"xxxx"]));
        }

        let (bytes, groups) = connector.build_request().unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(connector.send_wait.len(), 1);
        assert_eq!(connector.correlation_id, 1);

        let decoded = produce::decode_request_v0(&bytes[4..]).unwrap();
        assert_eq!(decoded.correlation_id, 1);
        assert_eq!(decoded.topics.len(), 1);
        assert_eq!(decoded.topics[0].partitions.len(), 3);

        for group in groups {
            for mut msg in group.msgs {
                assert_eq!(msg.state(), MsgState::Sending);
                msg.set_state(MsgState::Processed);
            }
        }
        discard_all(&mut connector);
    }

    #[tokio::test]
    async fn oversized_first_batch_still_ships() {
        let (mut connector, _events) = connector(settings());
        let pool = Pool::new(64, 64).unwrap();
        connector
            .send_wait
            .push_back(batch(&pool, "t", 0, &[&[b'x'; 200]]));

        let (_bytes, groups) = connector.build_request().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].msgs.len(), 1);

        for group in groups {
            for mut msg in group.msgs {
                msg.set_state(MsgState::Processed);
            }
        }
    }

    #[tokio::test]
    async fn resend_ack_requeues_at_head_and_counts_failures() {
        // S5 core: a RequestTimedOut ack puts the batch back at the head
        // with its failed-delivery counts bumped.
        let (mut connector, _events) = connector(settings());
        let pool = Pool::new(64, 64).unwrap();

        connector.send_wait.push_back(batch(&pool, "t", 0, &[b"v1"]));
        let (_bytes, groups) = connector.build_request().unwrap();
        connector.no_ack.push_back(InFlight {
            correlation_id: connector.correlation_id,
            sent_at: Instant::now(),
            groups,
        });

        let mut response = BytesMut::new();
        produce::encode_response_v0(
            &produce::ProduceResponse {
                correlation_id: 1,
                acks: vec![produce::PartitionAck {
                    topic: "t".into(),
                    partition: 0,
                    error_code: crate::kafka::error_code::REQUEST_TIMED_OUT,
                    offset: -1,
                }],
            },
            &mut response,
        );

        let pause = connector.handle_ack(&response[4..]).unwrap();
        assert!(!pause);
        assert!(connector.no_ack.is_empty());
        assert_eq!(connector.send_wait.len(), 1);
        assert_eq!(connector.send_wait[0].msgs[0].msg.failed_deliveries(), 1);
        assert_eq!(connector.anomaly.total_discards(), 0);

        discard_all(&mut connector);
    }

    #[tokio::test]
    async fn too_many_failed_deliveries_discards() {
        let (mut connector, _events) = connector(settings());
        let pool = Pool::new(64, 64).unwrap();

        for round in 0..3 {
            if round == 0 {
                connector.send_wait.push_back(batch(&pool, "t", 0, &[b"v"]));
            }
            let (_bytes, groups) = connector.build_request().unwrap();
            connector.no_ack.push_back(InFlight {
                correlation_id: connector.correlation_id,
                sent_at: Instant::now(),
                groups,
            });

            let mut response = BytesMut::new();
            produce::encode_response_v0(
                &produce::ProduceResponse {
                    correlation_id: connector.correlation_id,
                    acks: vec![produce::PartitionAck {
                        topic: "t".into(),
                        partition: 0,
                        error_code: crate::kafka::error_code::REQUEST_TIMED_OUT,
                        offset: -1,
                    }],
                },
                &mut response,
            );
            connector.handle_ack(&response[4..]).unwrap();
        }

        // max_failed_deliveries = 2: the third timeout discards.
        assert!(connector.send_wait.is_empty());
        assert_eq!(
            connector.anomaly.total(DiscardKind::FailedDelivery),
            1
        );
    }

    #[tokio::test]
    async fn ok_ack_processes_messages() {
        let (mut connector, _events) = connector(settings());
        let pool = Pool::new(64, 64).unwrap();

        connector
            .send_wait
            .push_back(batch(&pool, "t", 0, &[b"v1", b"v2"]));
        let (_bytes, groups) = connector.build_request().unwrap();
        connector.no_ack.push_back(InFlight {
            correlation_id: connector.correlation_id,
            sent_at: Instant::now(),
            groups,
        });

        let mut response = BytesMut::new();
        produce::encode_response_v0(
            &produce::ProduceResponse {
                correlation_id: 1,
                acks: vec![produce::PartitionAck {
                    topic: "t".into(),
                    partition: 0,
                    error_code: 0,
                    offset: 7,
                }],
            },
            &mut response,
        );

        assert!(!connector.handle_ack(&response[4..]).unwrap());
        assert!(connector.no_ack.is_empty());
        assert!(connector.send_wait.is_empty());
        // Everything was freed back to the pool.
        assert_eq!(pool.stats().free_blocks, 64);
    }

    #[tokio::test]
    async fn pause_ack_keeps_messages_for_reroute() {
        let (mut connector, _events) = connector(settings());
        let pool = Pool::new(64, 64).unwrap();

        connector.send_wait.push_back(batch(&pool, "t", 0, &[b"v"]));
        let (_bytes, groups) = connector.build_request().unwrap();
        connector.no_ack.push_back(InFlight {
            correlation_id: 1,
            sent_at: Instant::now(),
            groups,
        });

        let mut response = BytesMut::new();
        produce::encode_response_v0(
            &produce::ProduceResponse {
                correlation_id: 1,
                acks: vec![produce::PartitionAck {
                    topic: "t".into(),
                    partition: 0,
                    error_code: crate::kafka::error_code::NOT_LEADER_FOR_PARTITION,
                    offset: -1,
                }],
            },
            &mut response,
        );

        assert!(connector.handle_ack(&response[4..]).unwrap());
        // The batch is intact for rerouting, with no discard counted.
        assert_eq!(connector.send_wait.len(), 1);
        assert_eq!(connector.anomaly.total_discards(), 0);

        discard_all(&mut connector);
    }

    #[tokio::test]
    async fn correlation_mismatch_is_an_error() {
        let (mut connector, _events) = connector(settings());
        let pool = Pool::new(64, 64).unwrap();

        connector.send_wait.push_back(batch(&pool, "t", 0, &[b"v"]));
        let (_bytes, groups) = connector.build_request().unwrap();
        connector.no_ack.push_back(InFlight {
            correlation_id: 1,
            sent_at: Instant::now(),
            groups,
        });

        let mut response = BytesMut::new();
        produce::encode_response_v0(
            &produce::ProduceResponse {
                correlation_id: 99,
                acks: vec![produce::PartitionAck {
                    topic: "t".into(),
                    partition: 0,
                    error_code: 0,
                    offset: 0,
                }],
            },
            &mut response,
        );

        assert!(connector.handle_ack(&response[4..]).is_err());
        // The unanswered request is still in the no-ack queue.
        assert_eq!(connector.no_ack.len(), 1);
        discard_all(&mut connector);
    }
}
