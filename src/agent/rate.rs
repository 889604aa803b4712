use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

/// Token bucket refilled at `rate` tokens per second up to a reservoir of
/// `rate`. Refill ticks that find a full reservoir are dropped, so no
/// credit accumulates. A rate of zero disables limiting entirely.
#[derive(Clone)]
pub struct RateLimiter {
    permits: Option<Arc<Semaphore>>,
}

impl RateLimiter {
    pub fn new(rate: u32) -> Self {
        if rate == 0 {
            return Self { permits: None };
        }

        let capacity = rate as usize;
        let permits = Arc::new(Semaphore::new(0));
        let refill = permits.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(1) / rate;
            loop {
                tokio::time::sleep(period).await;
                if refill.available_permits() < capacity {
                    refill.add_permits(1);
                }
            }
        });

        Self {
            permits: Some(permits),
        }
    }

    pub fn disabled() -> Self {
        Self { permits: None }
    }

    /// Blocks until a token is available; a no-op when disabled.
    pub async fn acquire(&self) {
        if let Some(permits) = &self.permits {
            match permits.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    // Semaphore closed only happens on teardown.
                }
            }
        }
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.permits
            .as_ref()
            .map_or(usize::MAX, |permits| permits.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tokens_arrive_at_the_configured_rate() {
        let limiter = RateLimiter::new(10);
        // 100ms per token; three acquires need ~300ms of virtual time.
        let started = tokio::time::Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn reservoir_does_not_accumulate_beyond_capacity() {
        let limiter = RateLimiter::new(5);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(limiter.available() <= 5);
    }

    #[tokio::test]
    async fn zero_rate_never_blocks() {
        let limiter = RateLimiter::new(0);
        tokio::time::timeout(Duration::from_millis(50), async {
            for _ in 0..1000 {
                limiter.acquire().await;
            }
        })
        .await
        .expect("disabled limiter must not block");
    }
}
