use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::msg::{Msg, MsgState};

/// Bytes of message value kept in a discard sample.
pub const SAMPLE_PREFIX_BYTES: usize = 128;

/// Recent samples kept per discard kind.
const SAMPLES_PER_KIND: usize = 16;

/// Why a message (or raw input frame) was dropped instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscardKind {
    Malformed,
    NoMem,
    TooLong,
    UnsupportedApiKey,
    UnsupportedApiVersion,
    FailedDelivery,
    Paused,
    ProduceErr,
    ShutdownDiscard,
    UnknownTopic,
    RateLimited,
}

impl DiscardKind {
    pub const ALL: [DiscardKind; 11] = [
        DiscardKind::Malformed,
        DiscardKind::NoMem,
        DiscardKind::TooLong,
        DiscardKind::UnsupportedApiKey,
        DiscardKind::UnsupportedApiVersion,
        DiscardKind::FailedDelivery,
        DiscardKind::Paused,
        DiscardKind::ProduceErr,
        DiscardKind::ShutdownDiscard,
        DiscardKind::UnknownTopic,
        DiscardKind::RateLimited,
    ];

    pub fn as_tag(self) -> &'static str {
        match self {
            DiscardKind::Malformed => "malformed",
            DiscardKind::NoMem => "no_mem",
            DiscardKind::TooLong => "too_long",
            DiscardKind::UnsupportedApiKey => "unsupported_api_key",
            DiscardKind::UnsupportedApiVersion => "unsupported_api_version",
            DiscardKind::FailedDelivery => "failed_delivery",
            DiscardKind::Paused => "paused",
            DiscardKind::ProduceErr => "produce_error",
            DiscardKind::ShutdownDiscard => "shutdown",
            DiscardKind::UnknownTopic => "unknown_topic",
            DiscardKind::RateLimited => "rate_limited",
        }
    }

    fn index(self) -> usize {
        DiscardKind::ALL
            .iter()
            .position(|k| *k == self)
            .expect("kind missing from ALL")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscardSample {
    /// Absent for frames that never parsed far enough to carry a topic.
    pub topic: Option<String>,
    /// Client timestamp when known, else 0.
    pub timestamp: i64,
    /// Lossy first bytes of the value (or raw frame), for debugging clients.
    pub value_prefix: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntervalReport {
    pub started_unix_secs: u64,
    pub counts: BTreeMap<&'static str, u64>,
}

#[derive(Debug, Serialize)]
pub struct AnomalySnapshot {
    pub discard_totals: BTreeMap<&'static str, u64>,
    pub discards_by_topic: BTreeMap<String, u64>,
    pub recent: BTreeMap<&'static str, Vec<DiscardSample>>,
    pub possible_duplicates: u64,
    pub recent_duplicates: Vec<DiscardSample>,
    pub current_interval: IntervalReport,
    pub previous_interval: Option<IntervalReport>,
}

struct Inner {
    samples: Vec<VecDeque<DiscardSample>>,
    by_topic: HashMap<String, u64>,
    duplicates: VecDeque<DiscardSample>,
    interval_started: u64,
    interval_counts: [u64; DiscardKind::ALL.len()],
    previous_interval: Option<IntervalReport>,
}

/// Counts and summarizes everything that went wrong: discards by kind and
/// topic, recent samples per kind, and messages whose delivery outcome is
/// unknown (possible duplicates). Snapshots feed the status endpoint.
pub struct AnomalyTracker {
    totals: [AtomicU64; DiscardKind::ALL.len()],
    duplicate_total: AtomicU64,
    inner: Mutex<Inner>,
}

impl Default for AnomalyTracker {
    fn default() -> Self {
        AnomalyTracker::new()
    }
}

impl AnomalyTracker {
    pub fn new() -> AnomalyTracker {
        AnomalyTracker {
            totals: std::array::from_fn(|_| AtomicU64::new(0)),
            duplicate_total: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                samples: (0..DiscardKind::ALL.len()).map(|_| VecDeque::new()).collect(),
                by_topic: HashMap::new(),
                duplicates: VecDeque::new(),
                interval_started: unix_now_secs(),
                interval_counts: [0; DiscardKind::ALL.len()],
                previous_interval: None,
            }),
        }
    }

    /// Records the discard of a fully-built message and consumes it,
    /// releasing its pool blocks.
    pub fn discard_msg(&self, mut msg: Msg, kind: DiscardKind) {
        let sample = DiscardSample {
            topic: Some(msg.topic().to_owned()),
            timestamp: msg.timestamp(),
            value_prefix: lossy_prefix(&msg.value_prefix(SAMPLE_PREFIX_BYTES)),
        };
        self.record(kind, Some(msg.topic()), sample);
        msg.set_state(MsgState::Processed);
    }

    /// Records the discard of an input frame that never became a message.
    pub fn discard_frame(&self, kind: DiscardKind, frame_prefix: &[u8]) {
        let prefix = &frame_prefix[..frame_prefix.len().min(SAMPLE_PREFIX_BYTES)];
        let sample = DiscardSample {
            topic: None,
            timestamp: 0,
            value_prefix: lossy_prefix(prefix),
        };
        self.record(kind, None, sample);
    }

    /// Records a NoMem discard for a message that could not be allocated.
    pub fn discard_no_mem(&self, topic: &str, timestamp: i64, value: &[u8]) {
        let sample = DiscardSample {
            topic: Some(topic.to_owned()),
            timestamp,
            value_prefix: lossy_prefix(&value[..value.len().min(SAMPLE_PREFIX_BYTES)]),
        };
        self.record(DiscardKind::NoMem, Some(topic), sample);
    }

    /// Marks a message as possibly duplicated: it was written to a broker
    /// whose connection died before the ack arrived.
    pub fn possible_duplicate(&self, msg: &Msg) {
        self.duplicate_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dory_possible_duplicates_total").increment(1);

        let mut inner = self.inner.lock().expect("poisoned anomaly tracker");
        push_sample(
            &mut inner.duplicates,
            DiscardSample {
                topic: Some(msg.topic().to_owned()),
                timestamp: msg.timestamp(),
                value_prefix: lossy_prefix(&msg.value_prefix(SAMPLE_PREFIX_BYTES)),
            },
        );
    }

    pub fn total(&self, kind: DiscardKind) -> u64 {
        self.totals[kind.index()].load(Ordering::Relaxed)
    }

    pub fn total_discards(&self) -> u64 {
        self.totals.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn possible_duplicates(&self) -> u64 {
        self.duplicate_total.load(Ordering::Relaxed)
    }

    /// Closes the current reporting interval and starts a new one.
    pub fn roll_interval(&self) {
        let mut inner = self.inner.lock().expect("poisoned anomaly tracker");
        let counts = interval_report(inner.interval_started, &inner.interval_counts);
        inner.previous_interval = Some(counts);
        inner.interval_started = unix_now_secs();
        inner.interval_counts = [0; DiscardKind::ALL.len()];
    }

    pub fn snapshot(&self) -> AnomalySnapshot {
        let inner = self.inner.lock().expect("poisoned anomaly tracker");
        let discard_totals = DiscardKind::ALL
            .iter()
            .map(|k| (k.as_tag(), self.total(*k)))
            .collect();
        let recent = DiscardKind::ALL
            .iter()
            .map(|k| {
                (
                    k.as_tag(),
                    inner.samples[k.index()].iter().cloned().collect::<Vec<_>>(),
                )
            })
            .filter(|(_, samples): &(_, Vec<_>)| !samples.is_empty())
            .collect();

        AnomalySnapshot {
            discard_totals,
            discards_by_topic: inner
                .by_topic
                .iter()
                .map(|(t, n)| (t.clone(), *n))
                .collect(),
            recent,
            possible_duplicates: self.possible_duplicates(),
            recent_duplicates: inner.duplicates.iter().cloned().collect(),
            current_interval: interval_report(inner.interval_started, &inner.interval_counts),
            previous_interval: inner.previous_interval.clone(),
        }
    }

    fn record(&self, kind: DiscardKind, topic: Option<&str>, sample: DiscardSample) {
        self.totals[kind.index()].fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dory_discards_total", "kind" => kind.as_tag()).increment(1);

        let mut inner = self.inner.lock().expect("poisoned anomaly tracker");
        inner.interval_counts[kind.index()] += 1;
        if let Some(topic) = topic {
            *inner.by_topic.entry(topic.to_owned()).or_insert(0) += 1;
        }
        push_sample(&mut inner.samples[kind.index()], sample);
    }
}

fn push_sample(buf: &mut VecDeque<DiscardSample>, sample: DiscardSample) {
    if buf.len() == SAMPLES_PER_KIND {
        buf.pop_front();
    }
    buf.push_back(sample);
}

fn interval_report(started: u64, counts: &[u64; DiscardKind::ALL.len()]) -> IntervalReport {
    IntervalReport {
        started_unix_secs: started,
        counts: DiscardKind::ALL
            .iter()
            .zip(counts.iter())
            .filter(|(_, n)| **n > 0)
            .map(|(k, n)| (k.as_tag(), *n))
            .collect(),
    }
}

fn lossy_prefix(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::test_support;
    use crate::pool::Pool;

    #[tokio::test]
    async fn discard_counts_and_samples() {
        let pool = Pool::new(64, 8).unwrap();
        let tracker = AnomalyTracker::new();

        tracker.discard_msg(
            test_support::msg(&pool, "events", b"payload-bytes"),
            DiscardKind::UnknownTopic,
        );
        tracker.discard_frame(DiscardKind::Malformed, b"\x00\x00\x00\x04junk");

        assert_eq!(tracker.total(DiscardKind::UnknownTopic), 1);
        assert_eq!(tracker.total(DiscardKind::Malformed), 1);
        assert_eq!(tracker.total_discards(), 2);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.discards_by_topic.get("events"), Some(&1));
        let samples = &snapshot.recent["unknown_topic"];
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value_prefix, "payload-bytes");

        // Dropping the message released its blocks.
        assert_eq!(pool.stats().free_blocks, 8);
    }

    #[tokio::test]
    async fn sample_ring_is_capped() {
        let pool = Pool::new(64, 64).unwrap();
        let tracker = AnomalyTracker::new();
        for i in 0..SAMPLES_PER_KIND + 5 {
            tracker.discard_msg(
                test_support::msg(&pool, "t", format!("v{i}").as_bytes()),
                DiscardKind::RateLimited,
            );
        }

        let snapshot = tracker.snapshot();
        let samples = &snapshot.recent["rate_limited"];
        assert_eq!(samples.len(), SAMPLES_PER_KIND);
        // Oldest entries were evicted first.
        assert_eq!(samples[0].value_prefix, "v5");
    }

    #[tokio::test]
    async fn interval_rollover() {
        let pool = Pool::new(64, 8).unwrap();
        let tracker = AnomalyTracker::new();
        tracker.discard_msg(
            test_support::msg(&pool, "t", b"x"),
            DiscardKind::ProduceErr,
        );

        tracker.roll_interval();
        tracker.discard_msg(
            test_support::msg(&pool, "t", b"y"),
            DiscardKind::ProduceErr,
        );

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.current_interval.counts["produce_error"], 1);
        let previous = snapshot.previous_interval.expect("previous interval");
        assert_eq!(previous.counts["produce_error"], 1);
        assert_eq!(tracker.total(DiscardKind::ProduceErr), 2);
    }
}
