use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Process-wide request pacing: at most one grant per `1 / rate` seconds.
#[derive(Debug)]
pub struct RateLimiter {
    interval_nanos: AtomicU64,
    last_request: Mutex<Option<Instant>>,
}

fn interval_for(requests_per_second: f64) -> u64 {
    if requests_per_second > 0.0 && requests_per_second.is_finite() {
        Duration::from_secs_f64(1.0 / requests_per_second).as_nanos() as u64
    } else {
        0
    }
}

impl RateLimiter {
    /// A non-positive rate disables pacing.
    pub fn new(requests_per_second: f64) -> Self {
        Self {
            interval_nanos: AtomicU64::new(interval_for(requests_per_second)),
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::Relaxed))
    }

    /// Wait until the minimum spacing since the previous grant has elapsed.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        let interval = self.min_interval();
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Applies to acquisitions that have not yet taken the lock.
    pub fn update_rate(&self, requests_per_second: f64) {
        self.interval_nanos
            .store(interval_for(requests_per_second), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn sequential_acquires_are_spaced() {
        let limiter = RateLimiter::new(20.0);
        let start = std::time::Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // (N - 1) / R = 4 / 20
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn first_acquire_is_immediate() {
        let limiter = RateLimiter::new(1.0);
        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_pacing() {
        let limiter = Arc::new(RateLimiter::new(10.0));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.acquire().await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn update_rate_changes_interval() {
        let limiter = RateLimiter::new(10.0);
        assert_eq!(limiter.min_interval(), Duration::from_millis(100));
        limiter.update_rate(2.0);
        assert_eq!(limiter.min_interval(), Duration::from_millis(500));
        limiter.update_rate(0.0);
        assert_eq!(limiter.min_interval(), Duration::ZERO);
    }
}
