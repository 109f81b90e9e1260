use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{clock, state, Quota, RateLimiter};

type DirectLimiter = RateLimiter<state::NotKeyed, state::InMemoryState, clock::DefaultClock>;

/// Per-topic throughput cap: at most `max_count` messages per `interval`.
/// `max_count == None` means the topic is unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRateSpec {
    pub interval: Duration,
    pub max_count: Option<NonZeroU32>,
}

impl TopicRateSpec {
    pub fn unlimited() -> TopicRateSpec {
        TopicRateSpec {
            interval: Duration::ZERO,
            max_count: None,
        }
    }

    fn quota(&self) -> Option<Quota> {
        let max_count = self.max_count?;
        Quota::with_period(self.interval / max_count.get()).map(|q| q.allow_burst(max_count))
    }
}

/// Topic rate limiting, one leaky bucket per topic. Topics named in
/// `overrides` get their own spec; everything else uses the default.
/// Messages over the limit are discarded as RateLimited by the router.
pub struct TopicRateLimiter {
    default_spec: TopicRateSpec,
    overrides: HashMap<String, TopicRateSpec>,
    limiters: DashMap<String, Arc<DirectLimiter>>,
}

impl TopicRateLimiter {
    pub fn new(
        default_spec: TopicRateSpec,
        overrides: HashMap<String, TopicRateSpec>,
    ) -> TopicRateLimiter {
        TopicRateLimiter {
            default_spec,
            overrides,
            limiters: DashMap::new(),
        }
    }

    /// True if this message would exceed the topic's rate and must be
    /// dropped.
    pub fn is_limited(&self, topic: &str) -> bool {
        let spec = self.overrides.get(topic).unwrap_or(&self.default_spec);
        let Some(quota) = spec.quota() else {
            return false;
        };

        let limiter = self
            .limiters
            .entry(topic.to_owned())
            .or_insert_with(|| Arc::new(RateLimiter::direct(quota)))
            .clone();
        limiter.check().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(interval: Duration, max_count: u32) -> TopicRateSpec {
        TopicRateSpec {
            interval,
            max_count: NonZeroU32::new(max_count),
        }
    }

    #[test]
    fn default_spec_limits_after_burst() {
        let limiter = TopicRateLimiter::new(spec(Duration::from_secs(60), 2), HashMap::new());

        assert!(!limiter.is_limited("t"));
        assert!(!limiter.is_limited("t"));
        assert!(limiter.is_limited("t"));
    }

    #[test]
    fn topics_are_limited_independently() {
        let limiter = TopicRateLimiter::new(spec(Duration::from_secs(60), 1), HashMap::new());

        assert!(!limiter.is_limited("a"));
        assert!(limiter.is_limited("a"));
        assert!(!limiter.is_limited("b"));
    }

    #[test]
    fn overrides_and_unlimited() {
        let mut overrides = HashMap::new();
        overrides.insert("chatty".to_owned(), TopicRateSpec::unlimited());
        let limiter = TopicRateLimiter::new(spec(Duration::from_secs(60), 1), overrides);

        for _ in 0..100 {
            assert!(!limiter.is_limited("chatty"));
        }
        assert!(!limiter.is_limited("other"));
        assert!(limiter.is_limited("other"));
    }
}
