use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::msg::RoutedMsg;

mod combined;
mod core;
mod per_topic;

pub use combined::CombinedTopicsBatcher;
pub use per_topic::PerTopicBatcher;
pub use self::core::{BatchAction, BatcherCore};

/// The `{time, count, bytes}` limit triple. Unset members are disabled;
/// a config with nothing set means the topic is not batched at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchConfig {
    pub time_limit: Option<Duration>,
    pub max_count: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl BatchConfig {
    pub fn is_enabled(&self) -> bool {
        self.time_limit.is_some() || self.max_count.is_some() || self.max_bytes.is_some()
    }
}

/// Include or exclude list over topic names.
#[derive(Debug, Clone, Default)]
pub struct TopicFilter {
    topics: HashSet<String>,
    exclude: bool,
}

impl TopicFilter {
    /// Matches every topic.
    pub fn all() -> TopicFilter {
        TopicFilter {
            topics: HashSet::new(),
            exclude: true,
        }
    }

    pub fn include(topics: impl IntoIterator<Item = String>) -> TopicFilter {
        TopicFilter {
            topics: topics.into_iter().collect(),
            exclude: false,
        }
    }

    pub fn exclude(topics: impl IntoIterator<Item = String>) -> TopicFilter {
        TopicFilter {
            topics: topics.into_iter().collect(),
            exclude: true,
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.topics.contains(topic) != self.exclude
    }
}

/// A completed batch: messages for one topic (each already carrying its
/// partition), in arrival order.
pub struct TopicBatch {
    pub topic: String,
    pub msgs: Vec<RoutedMsg>,
}

impl TopicBatch {
    pub fn wire_size(&self, msg_overhead: usize) -> usize {
        self.msgs
            .iter()
            .map(|r| msg_overhead + r.msg.payload_size())
            .sum()
    }
}

/// Which batcher handles which topic, decided once from configuration:
/// topics with an explicit per-topic config batch independently; otherwise
/// the combined batcher takes the topics its filter admits; otherwise the
/// default per-topic config applies; topics with nothing configured skip
/// batching entirely.
#[derive(Debug, Clone, Default)]
pub struct BatchingConfig {
    pub per_topic: HashMap<String, BatchConfig>,
    pub default_topic: Option<BatchConfig>,
    pub combined: Option<BatchConfig>,
    pub combined_filter: TopicFilter,
}

enum BatcherChoice {
    PerTopic(BatchConfig),
    Combined,
    Immediate,
}

impl BatchingConfig {
    fn choice_for(&self, topic: &str) -> BatcherChoice {
        if let Some(config) = self.per_topic.get(topic) {
            return if config.is_enabled() {
                BatcherChoice::PerTopic(*config)
            } else {
                BatcherChoice::Immediate
            };
        }
        if self.combined.is_some() && self.combined_filter.matches(topic) {
            return BatcherChoice::Combined;
        }
        match self.default_topic {
            Some(config) if config.is_enabled() => BatcherChoice::PerTopic(config),
            _ => BatcherChoice::Immediate,
        }
    }
}

/// All batching state for one broker's traffic.
pub struct BrokerBatcher {
    config: BatchingConfig,
    per_topic: PerTopicBatcher,
    combined: Option<CombinedTopicsBatcher>,
}

impl BrokerBatcher {
    pub fn new(config: BatchingConfig, msg_overhead: usize) -> BrokerBatcher {
        let combined = config
            .combined
            .map(|c| CombinedTopicsBatcher::new(c, msg_overhead));
        BrokerBatcher {
            config,
            per_topic: PerTopicBatcher::new(msg_overhead),
            combined,
        }
    }

    /// Offers one message; returns any batches that completed.
    pub fn add(&mut self, routed: RoutedMsg, now: Instant) -> Vec<TopicBatch> {
        match self.config.choice_for(routed.msg.topic()) {
            BatcherChoice::Immediate => vec![TopicBatch {
                topic: routed.msg.topic().to_owned(),
                msgs: vec![routed],
            }],
            BatcherChoice::PerTopic(config) => self.per_topic.add(config, routed, now),
            BatcherChoice::Combined => self
                .combined
                .as_mut()
                .expect("combined choice without combined batcher")
                .add(routed, now),
        }
    }

    /// Earliest time any open batch hits its time limit.
    pub fn next_complete_time(&self) -> Option<Instant> {
        let combined = self.combined.as_ref().and_then(|c| c.next_complete_time());
        match (self.per_topic.next_complete_time(), combined) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Emits every batch whose time limit has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TopicBatch> {
        let mut out = self.per_topic.take_expired(now);
        if let Some(combined) = &mut self.combined {
            out.append(&mut combined.take_expired(now));
        }
        out
    }

    /// Flushes everything, complete or not. Used on pause, rebalance and
    /// shutdown.
    pub fn take_all(&mut self) -> Vec<TopicBatch> {
        let mut out = self.per_topic.take_all();
        if let Some(combined) = &mut self.combined {
            out.append(&mut combined.take_all());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.per_topic.is_empty() && self.combined.as_ref().map_or(true, |c| c.is_empty())
    }
}
