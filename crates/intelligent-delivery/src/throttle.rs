//! Message throttling — sliding-window admission control over the last hour
//! and the last second.

use campaign_core::config::RateLimitConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const HOUR: Duration = Duration::from_secs(3600);
const SECOND: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub sent_last_hour: usize,
    pub max_per_hour: usize,
    pub remaining: usize,
    /// When the oldest counted send leaves the window.
    pub reset_time: DateTime<Utc>,
}

pub struct RateLimiter {
    max_per_hour: usize,
    max_per_second: usize,
    poll_interval: Duration,
    /// Admission timestamps, oldest first.
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_per_hour: config.max_per_hour,
            max_per_second: config.max_per_second,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            window: Mutex::new(VecDeque::with_capacity(config.max_per_hour)),
        }
    }

    /// Single non-blocking check. Records the send when admitted.
    pub fn acquire(&self) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock();

        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= HOUR {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_per_hour {
            metrics::counter!("throttle.rejections", "window" => "hour").increment(1);
            return false;
        }

        let last_second = window
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) < SECOND)
            .count();
        if last_second >= self.max_per_second {
            metrics::counter!("throttle.rejections", "window" => "second").increment(1);
            return false;
        }

        window.push_back(now);
        true
    }

    /// Poll [`acquire`](Self::acquire) until a slot opens.
    pub async fn wait_for_slot(&self) {
        while !self.acquire() {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn get_stats(&self) -> RateLimitStats {
        let now = Instant::now();
        let window = self.window.lock();
        let mut counted = window
            .iter()
            .filter(|t| now.duration_since(**t) < HOUR)
            .peekable();

        let reset_time = match counted.peek() {
            Some(oldest) => {
                let left = (**oldest + HOUR).saturating_duration_since(now);
                Utc::now() + chrono::Duration::from_std(left).unwrap_or_else(|_| chrono::Duration::zero())
            }
            None => Utc::now(),
        };
        let sent_last_hour = counted.count();

        RateLimitStats {
            sent_last_hour,
            max_per_hour: self.max_per_hour,
            remaining: self.max_per_hour.saturating_sub(sent_last_hour),
            reset_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_per_hour: usize, max_per_second: usize) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            max_per_hour,
            max_per_second,
            poll_interval_ms: 500,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_second_budget() {
        let limiter = limiter(100, 2);
        assert!(limiter.acquire());
        assert!(limiter.acquire());
        assert!(!limiter.acquire());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!limiter.acquire());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_hour_budget() {
        let limiter = limiter(3, 10);
        for _ in 0..3 {
            assert!(limiter.acquire());
        }
        assert!(!limiter.acquire());

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert!(!limiter.acquire());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.acquire());
        assert_eq!(limiter.get_stats().sent_last_hour, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_slot_suspends_until_admitted() {
        let limiter = limiter(100, 1);
        assert!(limiter.acquire());

        let start = Instant::now();
        limiter.wait_for_slot().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_windows_never_exceeded() {
        let max_per_hour = 40;
        let max_per_second = 3;
        let limiter = limiter(max_per_hour, max_per_second);
        let origin = Instant::now();
        let mut admitted = Vec::new();

        // 2 hours of attempts every 50ms
        for _ in 0..(2 * 3600 * 20) {
            if limiter.acquire() {
                admitted.push(Instant::now().duration_since(origin));
            }
            tokio::time::advance(Duration::from_millis(50)).await;
        }

        assert!(!admitted.is_empty());
        for (i, at) in admitted.iter().enumerate() {
            let in_second = admitted[i..]
                .iter()
                .take_while(|t| **t - *at < SECOND)
                .count();
            assert!(in_second <= max_per_second);
            let in_hour = admitted[i..].iter().take_while(|t| **t - *at < HOUR).count();
            assert!(in_hour <= max_per_hour);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let limiter = limiter(5, 10);
        let empty = limiter.get_stats();
        assert_eq!(empty.sent_last_hour, 0);
        assert_eq!(empty.remaining, 5);

        assert!(limiter.acquire());
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(limiter.acquire());

        let before = Utc::now();
        let stats = limiter.get_stats();
        assert_eq!(stats.sent_last_hour, 2);
        assert_eq!(stats.max_per_hour, 5);
        assert_eq!(stats.remaining, 3);
        // oldest send leaves the window in 50 minutes
        let until_reset = stats.reset_time - before;
        assert!(until_reset <= chrono::Duration::minutes(50));
        assert!(until_reset > chrono::Duration::minutes(49));
    }
}
