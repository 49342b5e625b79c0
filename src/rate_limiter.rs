use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use hive_worker_job::Queue;

/// Dispatch ceilings of a queue. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
}

impl RateLimit {
    pub fn of(queue: &Queue) -> Self {
        Self {
            per_minute: queue.rate_limit_per_minute(),
            per_hour: queue.rate_limit_per_hour(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.per_minute.is_none() && self.per_hour.is_none()
    }

    /// Whether one more dispatch fits given how many happened in the last
    /// minute and the last hour.
    pub fn admits(&self, last_minute: usize, last_hour: usize) -> bool {
        self.per_minute.is_none_or(|limit| last_minute < limit as usize)
            && self.per_hour.is_none_or(|limit| last_hour < limit as usize)
    }
}

fn minute() -> Duration {
    Duration::seconds(60)
}

fn hour() -> Duration {
    Duration::minutes(60)
}

/// Number of recorded dispatches strictly inside `(now - window, now]`.
fn count_within(dispatches: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> usize {
    let cutoff = now - window;
    let upto = dispatches.partition_point(|at| *at <= now);
    upto - dispatches.partition_point(|at| *at <= cutoff)
}

/// Per-queue sliding-window log of dispatches.
///
/// A dispatch is admitted only if fewer than `per_minute` dispatches happened
/// in the last 60 seconds and fewer than `per_hour` in the last 60 minutes.
/// The log holds no lock of its own: its owner checks and records under the
/// same lock it claims jobs with, so every worker sharing that owner shares
/// the windows.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `queue` admits a dispatch at `now`, without recording it.
    pub fn admits(&self, queue: &str, limit: &RateLimit, now: DateTime<Utc>) -> bool {
        if limit.is_unlimited() {
            return true;
        }
        match self.windows.get(queue) {
            Some(dispatches) => limit.admits(
                count_within(dispatches, now, minute()),
                count_within(dispatches, now, hour()),
            ),
            None => limit.admits(0, 0),
        }
    }

    /// Records a dispatch on `queue` if both windows have room. Returns
    /// whether the dispatch was admitted.
    pub fn try_acquire(&mut self, queue: &str, limit: &RateLimit, now: DateTime<Utc>) -> bool {
        if limit.is_unlimited() {
            return true;
        }
        if !self.admits(queue, limit, now) {
            return false;
        }

        let dispatches = self.windows.entry(queue.to_string()).or_default();
        while dispatches.front().is_some_and(|at| *at <= now - hour()) {
            dispatches.pop_front();
        }
        let pos = dispatches.partition_point(|at| *at <= now);
        dispatches.insert(pos, now);
        true
    }

    /// Forgets dispatches recorded at or before `before`. Returns how many
    /// were dropped.
    pub fn prune(&mut self, before: DateTime<Utc>) -> u64 {
        let mut pruned = 0;
        self.windows.retain(|_, dispatches| {
            let expired = dispatches.partition_point(|at| *at <= before);
            dispatches.drain(..expired);
            pruned += expired as u64;
            !dispatches.is_empty()
        });
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(per_minute: Option<u32>, per_hour: Option<u32>) -> RateLimit {
        RateLimit {
            per_minute,
            per_hour,
        }
    }

    #[test]
    fn per_minute_limit_is_never_exceeded() {
        let mut limiter = RateLimiter::new();
        let limit = limited(Some(10), None);
        let start = Utc::now();

        let mut admitted = 0;
        for i in 0..100 {
            if limiter.try_acquire("sms", &limit, start + Duration::milliseconds(i * 100)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert!(!limiter.admits("sms", &limit, start + Duration::seconds(30)));

        assert!(limiter.try_acquire("sms", &limit, start + Duration::seconds(61)));
    }

    #[test]
    fn hour_window_applies_independently() {
        let mut limiter = RateLimiter::new();
        let limit = limited(Some(5), Some(6));
        let start = Utc::now();

        for i in 0..5 {
            assert!(limiter.try_acquire("sms", &limit, start + Duration::seconds(i)));
        }
        assert!(!limiter.try_acquire("sms", &limit, start + Duration::seconds(10)));

        let later = start + Duration::minutes(2);
        assert!(limiter.try_acquire("sms", &limit, later));
        assert!(!limiter.try_acquire("sms", &limit, later + Duration::seconds(1)));

        assert!(limiter.try_acquire("sms", &limit, start + Duration::minutes(61)));
    }

    #[test]
    fn queues_have_separate_windows() {
        let mut limiter = RateLimiter::new();
        let limit = limited(Some(1), None);
        let now = Utc::now();

        assert!(limiter.try_acquire("sms", &limit, now));
        assert!(!limiter.admits("sms", &limit, now));
        assert!(limiter.try_acquire("mail", &limit, now));
    }

    #[test]
    fn prune_drops_old_dispatches() {
        let mut limiter = RateLimiter::new();
        let limit = limited(None, Some(2));
        let start = Utc::now();

        assert!(limiter.try_acquire("sms", &limit, start));
        assert!(limiter.try_acquire("sms", &limit, start + Duration::minutes(30)));
        assert!(!limiter.admits("sms", &limit, start + Duration::minutes(31)));
        assert_eq!(limiter.prune(start + Duration::minutes(1)), 1);
        assert!(limiter.admits("sms", &limit, start + Duration::minutes(31)));
    }

    #[test]
    fn unlimited_queues_always_admit() {
        let mut limiter = RateLimiter::new();
        let limit = limited(None, None);
        for _ in 0..1000 {
            assert!(limiter.try_acquire("sms", &limit, Utc::now()));
        }
    }
}
