use std::sync::Arc;

use tokio::time::Instant;
use tracing::error;

use crate::pool::{Pool, PoolError, PooledBuf};

/// How the sender wants the message placed on a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Dory picks a partition, round-robining per broker.
    AnyPartition,
    /// The key deterministically selects `key mod partition_count`.
    PartitionKey(i32),
}

/// Lifecycle of a message inside the daemon. Every message ends in
/// `Processed`, whether it was delivered or discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    New,
    Batching,
    Sending,
    AwaitingAck,
    Processed,
}

/// One client message. The key and value live back to back in pool blocks;
/// the blocks return to the pool when the message is dropped, and dropping
/// a message that never reached `Processed` is a bug we surface loudly.
pub struct Msg {
    routing: Routing,
    timestamp: i64,
    created: Instant,
    topic: String,
    key_size: usize,
    body: PooledBuf,
    body_truncated: bool,
    failed_deliveries: u32,
    state: MsgState,
}

impl Msg {
    pub fn new(
        routing: Routing,
        timestamp: i64,
        topic: &str,
        key: &[u8],
        value: &[u8],
        body_truncated: bool,
        pool: &Arc<Pool>,
    ) -> Result<Msg, PoolError> {
        let body = pool.alloc(&[key, value])?;
        Ok(Msg {
            routing,
            timestamp,
            created: Instant::now(),
            topic: topic.to_owned(),
            key_size: key.len(),
            body,
            body_truncated,
            failed_deliveries: 0,
            state: MsgState::New,
        })
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Monotonic creation time, used for batch time limits and age checks.
    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn value_size(&self) -> usize {
        self.body.len() - self.key_size
    }

    /// Total key + value bytes, the payload portion of the wire size.
    pub fn payload_size(&self) -> usize {
        self.body.len()
    }

    pub fn body_truncated(&self) -> bool {
        self.body_truncated
    }

    pub fn key_chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.body.chunks_in(0, self.key_size)
    }

    pub fn value_chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.body.chunks_in(self.key_size, self.body.len())
    }

    /// First value bytes, for discard samples.
    pub fn value_prefix(&self, max: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max.min(self.value_size()));
        for chunk in self.value_chunks() {
            let take = chunk.len().min(max - out.len());
            out.extend_from_slice(&chunk[..take]);
            if out.len() == max {
                break;
            }
        }
        out
    }

    pub fn failed_deliveries(&self) -> u32 {
        self.failed_deliveries
    }

    pub fn record_failed_delivery(&mut self) {
        self.failed_deliveries += 1;
    }

    pub fn state(&self) -> MsgState {
        self.state
    }

    pub fn set_state(&mut self, state: MsgState) {
        self.state = state;
    }
}

/// A message with its partition assigned by the router. The broker is
/// implicit: a routed message lives in exactly one connector's pipeline.
pub struct RoutedMsg {
    pub msg: Msg,
    pub partition: i32,
}

impl Drop for Msg {
    fn drop(&mut self) {
        if self.state != MsgState::Processed {
            metrics::counter!("dory_msg_dropped_unprocessed_total").increment(1);
            error!(
                topic = %self.topic,
                state = ?self.state,
                "message dropped without reaching a terminal state"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn msg(pool: &Arc<Pool>, topic: &str, value: &[u8]) -> Msg {
        Msg::new(Routing::AnyPartition, 0, topic, b"", value, false, pool).unwrap()
    }

    /// Marks a message terminal so dropping it in a test is not an error.
    pub fn finish(mut msg: Msg) {
        msg.set_state(MsgState::Processed);
    }
}
