use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::AdapterSettings;
use crate::errors::AppResult;

const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Enforces a minimum spacing between requests, plus optional random jitter.
pub struct Pacer {
    interval: Duration,
    jitter: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
    rng: Arc<Mutex<StdRng>>,
}

impl Pacer {
    pub fn new(interval: Duration, jitter: Duration, rng: Arc<Mutex<StdRng>>) -> Self {
        Self {
            interval,
            jitter,
            last_tick: AsyncMutex::new(None),
            rng,
        }
    }

    pub fn from_settings(settings: &AdapterSettings, rng: Arc<Mutex<StdRng>>) -> Self {
        Self::new(settings.request_delay, settings.delay_jitter, rng)
    }

    fn next_interval(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let jitter_ms = self.rng.lock().gen_range(0..=self.jitter.as_millis() as u64);
        self.interval + Duration::from_millis(jitter_ms)
    }

    /// Sleeps until the configured interval has passed since the previous
    /// call. The first call never waits.
    pub async fn wait(&self) {
        let interval = self.next_interval();
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                let pause = interval - elapsed;
                debug!(pause_ms = pause.as_millis() as u64, "pacing before next request");
                sleep(pause).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Bounded retries with exponential backoff and jitter.
#[derive(Clone)]
pub struct Backoff {
    max_attempts: u32,
    base: Duration,
    rng: Arc<Mutex<StdRng>>,
}

impl Backoff {
    pub fn new(retry_count: u32, base: Duration, rng: Arc<Mutex<StdRng>>) -> Self {
        Self {
            max_attempts: retry_count + 1,
            base,
            rng,
        }
    }

    pub fn from_settings(settings: &AdapterSettings, rng: Arc<Mutex<StdRng>>) -> Self {
        Self::new(
            settings.retry_count,
            Duration::from_millis(BASE_BACKOFF_MS),
            rng,
        )
    }

    /// Runs `operation` until it succeeds or the attempts are spent; the last
    /// error is returned.
    pub async fn retry<T, F, Fut>(&self, label: &str, mut operation: F) -> AppResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        error = %err,
                        attempt,
                        request = label,
                        "request failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(MAX_BACKOFF_EXPONENT);
        let base = self.base * (1 << exponent);
        let jitter_ceiling = self.base.as_millis() as u64;
        if jitter_ceiling == 0 {
            return base;
        }
        let jitter_ms = self.rng.lock().gen_range(0..jitter_ceiling);
        base + Duration::from_millis(jitter_ms)
    }
}

pub fn seeded_rng(seed: Option<u64>) -> Arc<Mutex<StdRng>> {
    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    Arc::new(Mutex::new(rng))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::errors::AppError;

    #[tokio::test]
    async fn retries_until_success() {
        let backoff = Backoff::new(3, Duration::ZERO, seeded_rng(Some(7)));
        let calls = AtomicU32::new(0);
        let value = backoff
            .retry("flaky", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AppError::Config("transient".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let backoff = Backoff::new(1, Duration::ZERO, seeded_rng(Some(7)));
        let calls = AtomicU32::new(0);
        let result: AppResult<()> = backoff
            .retry("down", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::Config("still down".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        let backoff = Backoff::new(5, Duration::from_millis(100), seeded_rng(Some(1)));
        let first = backoff.delay(1);
        let third = backoff.delay(3);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_calls() {
        let pacer = Pacer::new(Duration::from_secs(2), Duration::ZERO, seeded_rng(Some(3)));
        let start = Instant::now();
        pacer.wait().await;
        assert!(start.elapsed() < Duration::from_millis(10));
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
