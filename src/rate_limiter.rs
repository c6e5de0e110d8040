//! Sliding-window rate limiter (C9, spec §4.9).

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{PampaError, Result};

const WINDOW: Duration = Duration::from_secs(60);
const RETRY_SCHEDULE_SECS: &[u64] = &[1, 2, 5, 10];

/// `None` cap means unlimited: every call dispatches immediately and retries
/// are still honored for whatever downstream failure classification is passed in.
pub struct RateLimiter {
    rpm: Option<u32>,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(rpm: Option<u32>) -> Self {
        Self { rpm, timestamps: Mutex::new(VecDeque::new()) }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Blocks (async) until under the configured RPM, then records the
    /// dispatch timestamp. FIFO within a single limiter: callers queue behind
    /// the mutex in arrival order since each waiter re-checks after sleeping.
    async fn wait_for_slot(&self) {
        let Some(cap) = self.rpm else { return };
        loop {
            let sleep_for = {
                let mut ts = self.timestamps.lock().unwrap();
                let now = Instant::now();
                while let Some(&front) = ts.front() {
                    if now.duration_since(front) > WINDOW {
                        ts.pop_front();
                    } else {
                        break;
                    }
                }
                if ts.len() < cap as usize {
                    ts.push_back(now);
                    None
                } else {
                    let oldest = *ts.front().unwrap();
                    Some(WINDOW - now.duration_since(oldest))
                }
            };
            match sleep_for {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Runs `op`, retrying on a rate-limit classified failure with the fixed
    /// backoff schedule `[1s, 2s, 5s, 10s]`. `is_rate_limited` classifies the
    /// error variant of `op`'s result (HTTP 429, "rate limit" / "too many
    /// requests" message matches, etc.) — provided by the caller since the
    /// error type is provider-specific.
    pub async fn execute<F, Fut, T, E>(&self, operation: &str, mut op: F, is_rate_limited: impl Fn(&E) -> bool) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            self.wait_for_slot().await;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if is_rate_limited(&e) && (attempt as usize) < RETRY_SCHEDULE_SECS.len() => {
                    let delay = RETRY_SCHEDULE_SECS[attempt as usize];
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                Err(e) if is_rate_limited(&e) => {
                    return Err(PampaError::RateLimitExhausted {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                    });
                }
                Err(e) => {
                    return Err(PampaError::SearchError { reason: e.to_string() });
                }
            }
        }
    }
}

/// Matches the spec's 429-classification rule: HTTP 429 or a message
/// containing "rate limit" / "too many requests" (case-insensitive).
pub fn looks_rate_limited(message: &str, status: Option<u16>) -> bool {
    if status == Some(429) {
        return true;
    }
    let lower = message.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("too many requests")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn unlimited_dispatches_immediately() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        let result: Result<i32> = limiter
            .execute("test", || async { Ok::<i32, String>(42) }, |_| false)
            .await;
        assert_eq!(result.unwrap(), 42);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn retries_rate_limited_then_succeeds() {
        let limiter = RateLimiter::unlimited();
        let calls = AtomicU32::new(0);
        let result: Result<&str> = limiter
            .execute(
                "embed",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 1 {
                            Err("429 rate limit exceeded".to_string())
                        } else {
                            Ok("ok")
                        }
                    }
                },
                |e: &String| looks_rate_limited(e, None),
            )
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_rate_limit_error_fails_immediately() {
        let limiter = RateLimiter::unlimited();
        let calls = AtomicU32::new(0);
        let result: Result<i32> = limiter
            .execute(
                "embed",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<i32, String>("bad request".to_string()) }
                },
                |e: &String| looks_rate_limited(e, None),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classifies_429_and_message_variants() {
        assert!(looks_rate_limited("whatever", Some(429)));
        assert!(looks_rate_limited("Rate Limit exceeded", None));
        assert!(looks_rate_limited("Too Many Requests", None));
        assert!(!looks_rate_limited("not found", Some(404)));
    }
}
