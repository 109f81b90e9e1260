use tokio::time::Instant;

use crate::msg::Msg;

use super::BatchConfig;

/// What to do with an arriving message, given the current batch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    /// Add to the current batch; it is not complete yet.
    TakeMsgAndLeaveBatch,
    /// Add to the current batch; it is now complete.
    TakeMsgAndReturnBatch,
    /// The current batch completes without this message; emit it, then
    /// offer the message to the fresh batch.
    ReturnBatchAndTakeMsg,
    /// Emit the current batch; this message cannot join any batch whole
    /// (it alone exceeds the byte cap).
    LeaveMsgAndReturnBatch,
}

/// The limit arithmetic shared by both batcher flavors: a `{time, count,
/// bytes}` triple where unset members are disabled. Byte accounting uses
/// the protocol's per-message overhead so caps track wire cost.
///
/// The core only tracks aggregates; owners hold the message lists and
/// reset the core when they emit a batch.
#[derive(Debug, Clone)]
pub struct BatcherCore {
    config: BatchConfig,
    msg_overhead: usize,
    oldest: Option<Instant>,
    msg_count: usize,
    byte_count: usize,
}

impl BatcherCore {
    pub fn new(config: BatchConfig, msg_overhead: usize) -> BatcherCore {
        BatcherCore {
            config,
            msg_overhead,
            oldest: None,
            msg_count: 0,
            byte_count: 0,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn is_empty(&self) -> bool {
        self.msg_count == 0
    }

    pub fn msg_count(&self) -> usize {
        self.msg_count
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// Bytes this message will occupy on the wire.
    pub fn wire_size(&self, msg: &Msg) -> usize {
        self.msg_overhead + msg.payload_size()
    }

    /// When the open batch hits its time limit, if it has one.
    pub fn next_complete_time(&self) -> Option<Instant> {
        Some(self.oldest? + self.config.time_limit?)
    }

    pub fn time_expired(&self, now: Instant) -> bool {
        self.next_complete_time().is_some_and(|at| now >= at)
    }

    /// Decides the action for one message. State is updated only when the
    /// action takes the message; for the emit-first actions the owner
    /// clears the core and offers the message again.
    pub fn process_new_msg(&mut self, now: Instant, msg: &Msg) -> BatchAction {
        let bytes = self.wire_size(msg);

        if !self.is_empty() && self.time_expired(now) {
            return BatchAction::ReturnBatchAndTakeMsg;
        }

        if let Some(max_bytes) = self.config.max_bytes {
            if bytes > max_bytes {
                // A message too large for any batch still ships, alone.
                if self.is_empty() {
                    self.take(msg, bytes);
                    return BatchAction::TakeMsgAndReturnBatch;
                }
                return BatchAction::LeaveMsgAndReturnBatch;
            }
            if self.byte_count + bytes > max_bytes {
                return BatchAction::ReturnBatchAndTakeMsg;
            }
        }

        self.take(msg, bytes);
        if self.complete(now) {
            return BatchAction::TakeMsgAndReturnBatch;
        }
        BatchAction::TakeMsgAndLeaveBatch
    }

    pub fn clear(&mut self) {
        self.oldest = None;
        self.msg_count = 0;
        self.byte_count = 0;
    }

    fn take(&mut self, msg: &Msg, bytes: usize) {
        self.oldest = Some(match self.oldest {
            Some(oldest) => oldest.min(msg.created()),
            None => msg.created(),
        });
        self.msg_count += 1;
        self.byte_count += bytes;
    }

    fn complete(&self, now: Instant) -> bool {
        if self.time_expired(now) {
            return true;
        }
        if self.config.max_count.is_some_and(|max| self.msg_count >= max) {
            return true;
        }
        self.config
            .max_bytes
            .is_some_and(|max| self.byte_count >= max)
    }
}
