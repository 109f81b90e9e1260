use std::collections::HashMap;

use tokio::time::Instant;

use crate::msg::{MsgState, RoutedMsg};

use super::core::{BatchAction, BatcherCore};
use super::{BatchConfig, TopicBatch};

/// One shared limit triple across all of a broker's (unlisted) topics.
/// Messages are stored grouped by topic so the emitted batches stay
/// per-topic even though the limits are pooled.
pub struct CombinedTopicsBatcher {
    core: BatcherCore,
    topics: HashMap<String, Vec<RoutedMsg>>,
    arrival: Vec<String>,
}

impl CombinedTopicsBatcher {
    pub fn new(config: BatchConfig, msg_overhead: usize) -> CombinedTopicsBatcher {
        CombinedTopicsBatcher {
            core: BatcherCore::new(config, msg_overhead),
            topics: HashMap::new(),
            arrival: Vec::new(),
        }
    }

    /// Offers one message; when the shared limits trip, every topic's
    /// messages flush together, grouped by topic.
    pub fn add(&mut self, routed: RoutedMsg, now: Instant) -> Vec<TopicBatch> {
        let mut out = Vec::new();
        let mut pending = Some(routed);
        while let Some(r) = pending.take() {
            match self.core.process_new_msg(now, &r.msg) {
                BatchAction::TakeMsgAndLeaveBatch => self.store(r),
                BatchAction::TakeMsgAndReturnBatch => {
                    self.store(r);
                    out.append(&mut self.take_all());
                }
                BatchAction::ReturnBatchAndTakeMsg | BatchAction::LeaveMsgAndReturnBatch => {
                    out.append(&mut self.take_all());
                    pending = Some(r);
                }
            }
        }
        out
    }

    pub fn next_complete_time(&self) -> Option<Instant> {
        self.core.next_complete_time()
    }

    pub fn take_expired(&mut self, now: Instant) -> Vec<TopicBatch> {
        if self.core.is_empty() || !self.core.time_expired(now) {
            return Vec::new();
        }
        self.take_all()
    }

    /// Empties the batcher, returning its messages grouped by topic in
    /// first-arrival order.
    pub fn take_all(&mut self) -> Vec<TopicBatch> {
        self.core.clear();
        let mut topics = std::mem::take(&mut self.topics);
        std::mem::take(&mut self.arrival)
            .into_iter()
            .filter_map(|topic| {
                let msgs = topics.remove(&topic)?;
                Some(TopicBatch { topic, msgs })
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    fn store(&mut self, mut routed: RoutedMsg) {
        routed.msg.set_state(MsgState::Batching);
        let topic = routed.msg.topic().to_owned();
        match self.topics.get_mut(&topic) {
            Some(list) => list.push(routed),
            None => {
                self.arrival.push(topic.clone());
                self.topics.insert(topic, vec![routed]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::msg::test_support;
    use crate::pool::Pool;

    fn routed(pool: &Arc<Pool>, topic: &str, value: &[u8]) -> RoutedMsg {
        RoutedMsg {
            msg: test_support::msg(pool, topic, value),
            partition: 0,
        }
    }

    fn drain(batches: Vec<TopicBatch>) -> Vec<(String, usize)> {
        batches
            .into_iter()
            .map(|b| {
                let n = b.msgs.len();
                for r in b.msgs {
                    test_support::finish(r.msg);
                }
                (b.topic, n)
            })
            .collect()
    }

    #[test]
    fn shared_count_limit_flushes_all_topics() {
        let pool = Pool::new(64, 32).unwrap();
        let mut batcher = CombinedTopicsBatcher::new(
            BatchConfig {
                max_count: Some(3),
                ..Default::default()
            },
            0,
        );
        let now = Instant::now();

        assert!(batcher.add(routed(&pool, "a", b"1"), now).is_empty());
        assert!(batcher.add(routed(&pool, "b", b"2"), now).is_empty());
        let out = batcher.add(routed(&pool, "a", b"3"), now);

        assert_eq!(drain(out), vec![("a".to_owned(), 2), ("b".to_owned(), 1)]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn shared_time_limit() {
        let pool = Pool::new(64, 16).unwrap();
        let mut batcher = CombinedTopicsBatcher::new(
            BatchConfig {
                time_limit: Some(Duration::from_millis(50)),
                ..Default::default()
            },
            0,
        );

        let r = routed(&pool, "t", b"x");
        let created = r.msg.created();
        assert!(batcher.add(r, created).is_empty());
        assert!(batcher.take_expired(created + Duration::from_millis(49)).is_empty());
        let due = batcher.take_expired(created + Duration::from_millis(50));
        assert_eq!(drain(due), vec![("t".to_owned(), 1)]);
    }

    #[test]
    fn byte_cap_counts_all_topics_together() {
        let pool = Pool::new(64, 32).unwrap();
        let mut batcher = CombinedTopicsBatcher::new(
            BatchConfig {
                max_bytes: Some(10),
                ..Default::default()
            },
            0,
        );
        let now = Instant::now();

        assert!(batcher.add(routed(&pool, "a", b"aaaa"), now).is_empty());
        assert!(batcher.add(routed(&pool, "b", b"bbbb"), now).is_empty());
        // 8 + 4 exceeds the shared cap: both topics flush first.
        let out = batcher.add(routed(&pool, "a", b"cccc"), now);
        assert_eq!(drain(out), vec![("a".to_owned(), 1), ("b".to_owned(), 1)]);

        let rest = batcher.take_all();
        assert_eq!(drain(rest), vec![("a".to_owned(), 1)]);
    }
}
