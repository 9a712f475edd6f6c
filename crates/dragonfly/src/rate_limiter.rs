//! Token bucket shared by the concurrent readers of one download, or by all
//! the uploads of the peer server.
use std::{sync::Mutex, time::Duration};

use tokio::time::{sleep, Instant};

use crate::constants::DEFAULT_LOCAL_LIMIT;

/// Token bucket quantized into windows of `[1, 1000]` milliseconds.
///
/// The capacity of the bucket is the rate itself, so at most one second of
/// tokens can be saved up. A rate `<= 0` disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    capacity: i64,
    tokens: i64,
    rate: i64,
    rate_per_window: i64,
    /// In milliseconds.
    window: i64,
    last: Instant,
}

impl Bucket {
    fn compute_rate_per_window(&mut self) {
        self.window = self.window.clamp(1, 1000);
        if self.rate <= 0 {
            self.rate_per_window = 0;
            return;
        }
        let rate_per_window = self.rate * self.window / 1000;
        if rate_per_window > 0 {
            self.rate_per_window = rate_per_window;
            return;
        }
        self.rate_per_window = 1;
        self.window = (1000 / self.rate).max(1);
    }

    fn created_tokens(&self, now: Instant) -> i64 {
        let elapsed = now.duration_since(self.last).as_millis() as i64;
        if elapsed < 1 {
            return 0;
        }
        elapsed / self.window * self.rate_per_window
    }

    /// Take `n` tokens, or return how many are still missing.
    fn take(&mut self, n: i64) -> Result<(), i64> {
        let now = Instant::now();
        let ceiling = self.capacity.max(n);
        let total = (self.created_tokens(now) + self.tokens).min(ceiling);

        if total >= n {
            self.tokens = total - n;
            self.last = now;
            return Ok(());
        }
        Err(n - total)
    }

    fn wait_for(&self, missing: i64) -> Duration {
        let windows = (missing / self.rate_per_window.max(1)).max(1);
        Duration::from_millis((windows * self.window) as u64)
    }
}

impl RateLimiter {
    /// `rate` in bytes per second, `window` in milliseconds.
    pub fn new(rate: i64, window: i64) -> Self {
        let mut bucket = Bucket {
            capacity: rate,
            tokens: 0,
            rate,
            rate_per_window: 0,
            window,
            last: Instant::now(),
        };
        bucket.compute_rate_per_window();
        Self { bucket: Mutex::new(bucket) }
    }

    pub fn rate(&self) -> i64 {
        self.lock().rate
    }

    /// Waiters currently sleeping will see the new rate on their next
    /// refill.
    pub fn set_rate(&self, rate: i64) {
        let mut bucket = self.lock();
        if bucket.rate == rate {
            return;
        }
        bucket.capacity = rate;
        bucket.rate = rate;
        bucket.compute_rate_per_window();
    }

    /// Wait until `n` tokens are available and take them.
    pub async fn acquire_blocking(&self, n: i64) -> i64 {
        loop {
            let wait = {
                let mut bucket = self.lock();
                if bucket.capacity <= 0 || n < 1 {
                    return n;
                }
                match bucket.take(n) {
                    Ok(()) => return n,
                    Err(missing) => bucket.wait_for(missing),
                }
            };
            sleep(wait).await;
        }
    }

    /// Take `n` tokens if they are available right now, otherwise return
    /// `-1`.
    pub fn acquire_non_blocking(&self, n: i64) -> i64 {
        let mut bucket = self.lock();
        if bucket.capacity <= 0 || n < 1 {
            return n;
        }
        match bucket.take(n) {
            Ok(()) => n,
            Err(_) => -1,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        // a poisoned bucket is still a valid bucket
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Round a rate up to the next thousand, replacing non positive rates with
/// the default local limit.
pub fn trans_rate(rate: i64) -> i64 {
    let rate = if rate <= 0 { DEFAULT_LOCAL_LIMIT as i64 } else { rate };
    (rate / 1000 + 1) * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_adjusts_for_low_rates() {
        let limiter = RateLimiter::new(100, 2);
        let bucket = limiter.lock();
        assert_eq!(bucket.rate_per_window, 1);
        assert_eq!(bucket.window, 10);
        drop(bucket);

        let limiter = RateLimiter::new(1_000_000, 5000);
        let bucket = limiter.lock();
        assert_eq!(bucket.window, 1000);
        assert_eq!(bucket.rate_per_window, 1_000_000);
    }

    #[test]
    fn disabled_limiter_never_blocks() {
        let limiter = RateLimiter::new(0, 2);
        assert_eq!(limiter.acquire_non_blocking(1 << 30), 1 << 30);

        let limiter = RateLimiter::new(-5, 2);
        assert_eq!(limiter.acquire_non_blocking(10), 10);
    }

    #[test]
    fn non_blocking_fails_on_empty_bucket() {
        let limiter = RateLimiter::new(1000, 2);
        // nothing was refilled yet
        assert_eq!(limiter.acquire_non_blocking(500), -1);
        assert_eq!(limiter.acquire_non_blocking(0), 0);
    }

    #[tokio::test]
    async fn blocking_converges_to_rate() {
        let limiter = RateLimiter::new(10_000, 2);
        let start = Instant::now();

        for _ in 0..5 {
            limiter.acquire_blocking(1000).await;
        }

        // 5000 bytes at 10KB/s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");
    }

    #[tokio::test]
    async fn set_rate() {
        let limiter = RateLimiter::new(1000, 2);
        limiter.set_rate(1_000_000);
        assert_eq!(limiter.rate(), 1_000_000);

        let start = Instant::now();
        limiter.acquire_blocking(100_000).await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn trans() {
        assert_eq!(trans_rate(0), (DEFAULT_LOCAL_LIMIT as i64 / 1000 + 1) * 1000);
        assert_eq!(trans_rate(1), 1000);
        assert_eq!(trans_rate(2500), 3000);
        assert_eq!(trans_rate(3000), 4000);
    }
}
