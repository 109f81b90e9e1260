use std::collections::HashMap;

use tokio::time::Instant;

use crate::msg::{MsgState, RoutedMsg};

use super::core::{BatchAction, BatcherCore};
use super::{BatchConfig, TopicBatch};

struct TopicState {
    core: BatcherCore,
    msgs: Vec<RoutedMsg>,
}

/// Independent batching per topic: each topic gets its own limit triple
/// and its own open batch. State is created lazily the first time a topic
/// shows up and keeps that topic's config from then on.
pub struct PerTopicBatcher {
    msg_overhead: usize,
    states: HashMap<String, TopicState>,
}

impl PerTopicBatcher {
    pub fn new(msg_overhead: usize) -> PerTopicBatcher {
        PerTopicBatcher {
            msg_overhead,
            states: HashMap::new(),
        }
    }

    /// Offers one message under `config`; returns completed batches. A
    /// message the core will not take (emit-first actions) is offered
    /// again after the emit, so an oversized message comes back out as a
    /// batch of one.
    pub fn add(&mut self, config: BatchConfig, routed: RoutedMsg, now: Instant) -> Vec<TopicBatch> {
        let topic = routed.msg.topic().to_owned();
        let msg_overhead = self.msg_overhead;
        let state = self.states.entry(topic.clone()).or_insert_with(|| TopicState {
            core: BatcherCore::new(config, msg_overhead),
            msgs: Vec::new(),
        });

        let mut out = Vec::new();
        let mut pending = Some(routed);
        while let Some(mut r) = pending.take() {
            match state.core.process_new_msg(now, &r.msg) {
                BatchAction::TakeMsgAndLeaveBatch => {
                    r.msg.set_state(MsgState::Batching);
                    state.msgs.push(r);
                }
                BatchAction::TakeMsgAndReturnBatch => {
                    r.msg.set_state(MsgState::Batching);
                    state.msgs.push(r);
                    out.push(emit(&topic, state));
                }
                BatchAction::ReturnBatchAndTakeMsg | BatchAction::LeaveMsgAndReturnBatch => {
                    out.push(emit(&topic, state));
                    pending = Some(r);
                }
            }
        }
        out
    }

    pub fn next_complete_time(&self) -> Option<Instant> {
        self.states
            .values()
            .filter_map(|s| s.core.next_complete_time())
            .min()
    }

    pub fn take_expired(&mut self, now: Instant) -> Vec<TopicBatch> {
        let mut out = Vec::new();
        for (topic, state) in &mut self.states {
            if !state.core.is_empty() && state.core.time_expired(now) {
                out.push(emit(topic, state));
            }
        }
        out
    }

    pub fn take_all(&mut self) -> Vec<TopicBatch> {
        let mut out = Vec::new();
        for (topic, state) in &mut self.states {
            if !state.core.is_empty() {
                out.push(emit(topic, state));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.states.values().all(|s| s.core.is_empty())
    }
}

fn emit(topic: &str, state: &mut TopicState) -> TopicBatch {
    state.core.clear();
    TopicBatch {
        topic: topic.to_owned(),
        msgs: std::mem::take(&mut state.msgs),
    }
}
