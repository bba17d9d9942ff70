use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitSection;

/// Token bucket request pacer.
///
/// The bucket refills continuously at `requests / interval` tokens per
/// second and holds at most `requests` tokens, so a fresh limiter allows a
/// burst of up to `requests` calls before the steady rate applies. One
/// limiter is shared by every task of a run; [`acquire`](Self::acquire)
/// sleeps until a token is available.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<Bucket>,
    capacity: f64,
    refill_per_sec: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(requests: u32, interval: Duration) -> Self {
        let capacity = f64::from(requests);
        Self {
            state: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec: capacity / interval.as_secs_f64(),
        }
    }

    pub fn from_config(config: &RateLimitSection) -> Self {
        Self::new(config.requests, Duration::from_secs_f64(config.interval_secs))
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().expect("rate limiter mutex poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fresh_bucket_allows_a_full_burst() {
        let limiter = RateLimiter::new(6, Duration::from_secs(5));
        let start = Instant::now();
        for _ in 0..6 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO, "burst should not sleep");
    }

    #[tokio::test(start_paused = true)]
    async fn seventh_request_waits_for_refill() {
        let limiter = RateLimiter::new(6, Duration::from_secs(5));
        for _ in 0..6 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await;
        // One token refills in interval / capacity seconds.
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_millis(830) && waited <= Duration::from_millis(880),
            "expected ~833ms wait, got {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_does_not_accumulate_beyond_capacity() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(3600)).await;

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third call must wait: the hour of idle time bought nothing extra.
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(490));
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_rate_matches_configuration() {
        let limiter = RateLimiter::new(6, Duration::from_secs(5));
        let start = Instant::now();
        for _ in 0..18 {
            limiter.acquire().await;
        }
        // 6 burst + 12 refills at 1.2 req/s is 10 seconds of refill time.
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(9) && elapsed <= Duration::from_secs(11),
            "expected ~10s for 18 requests, got {elapsed:?}"
        );
    }
}
