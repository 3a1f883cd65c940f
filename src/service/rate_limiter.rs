//! Per-origin rate limiting and retry handling.
//!
//! One `DomainRateLimiter` exists per origin (URL host), created lazily on
//! first use and cached in a process-wide map. The limiter owns both the
//! politeness gate (spacing + concurrency) and the bounded-backoff retry
//! loop so every fetch goes through a single choke point.

use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};
use url::Url;

use crate::domain::config::{RateLimitConfig, RetryConfig};
use crate::domain::models::FetchResult;
use crate::service::fetcher::FetchError;

/// HTTP statuses worth retrying; everything else is terminal.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];

/// Unified rate limiter and retry handler for a single origin.
pub struct DomainRateLimiter {
    delay: Duration,
    max_retries: u32,
    backoff_factor: f64,
    semaphore: Semaphore,
    last_request: Mutex<Option<Instant>>,
}

impl DomainRateLimiter {
    pub fn new(rate: &RateLimitConfig, retry: &RetryConfig) -> Self {
        Self {
            delay: Duration::from_secs_f64(rate.delay_seconds.max(0.0)),
            max_retries: retry.max_retries,
            backoff_factor: retry.backoff_factor,
            semaphore: Semaphore::new(rate.max_concurrent.max(1) as usize),
            last_request: Mutex::new(None),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Wait until the minimum spacing since the last request has elapsed.
    /// The lock is only held to read the timestamp; sleeping happens
    /// outside it.
    async fn wait_for_spacing(&self) {
        loop {
            let wait = {
                let guard = self.last_request.lock().await;
                match *guard {
                    Some(last) => {
                        let elapsed = last.elapsed();
                        if elapsed >= self.delay {
                            None
                        } else {
                            Some(self.delay - elapsed)
                        }
                    }
                    None => None,
                }
            };
            match wait {
                Some(wait) => {
                    log::debug!("Rate limiting: waiting {:.2}s", wait.as_secs_f64());
                    sleep(wait).await;
                }
                None => return,
            }
        }
    }

    /// Execute a request with the politeness gate and retry policy.
    ///
    /// Each attempt acquires a concurrency permit, then the spacing wait;
    /// `last_request` is updated when the attempt returns, successful or
    /// not. Attempt `k >= 1` backs off `backoff_factor^k` seconds before
    /// re-acquiring the gate. Exhaustion with a retryable status returns
    /// the final response normally; exhaustion with a transport error
    /// propagates the final error.
    pub async fn execute<F, Fut>(
        &self,
        url: &str,
        site_name: &str,
        request: F,
    ) -> Result<FetchResult, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<FetchResult, FetchError>>,
    {
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.backoff_factor.powi(attempt as i32);
                log::warn!(
                    "Retry attempt {}/{} for {} (site: {}) after {:.2}s backoff",
                    attempt,
                    self.max_retries,
                    url,
                    site_name,
                    backoff
                );
                sleep(Duration::from_secs_f64(backoff)).await;
            }

            let permit = self
                .semaphore
                .acquire()
                .await
                .expect("limiter semaphore is never closed");
            self.wait_for_spacing().await;

            let outcome = request().await;

            *self.last_request.lock().await = Some(Instant::now());
            drop(permit);

            match outcome {
                Ok(result) => {
                    if RETRYABLE_STATUS_CODES.contains(&result.status_code) {
                        if attempt < self.max_retries {
                            log::warn!(
                                "Retryable status {} for {} (site: {}). Attempt {}/{}",
                                result.status_code,
                                url,
                                site_name,
                                attempt + 1,
                                self.max_retries
                            );
                            continue;
                        }
                        log::error!(
                            "Exhausted retries for {} (site: {}). Final status: {}, retries attempted: {}, timestamp: {}",
                            url,
                            site_name,
                            result.status_code,
                            attempt,
                            Utc::now().to_rfc3339()
                        );
                        return Ok(result);
                    }
                    if attempt > 0 {
                        log::info!("Recovered on attempt {} for {} (site: {})", attempt, url, site_name);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if attempt < self.max_retries {
                        log::warn!(
                            "Retryable error for {} (site: {}): {}. Attempt {}/{}",
                            url,
                            site_name,
                            err,
                            attempt + 1,
                            self.max_retries
                        );
                        continue;
                    }
                    log::error!(
                        "Exhausted retries for {} (site: {}). Final error: {}, retries attempted: {}, timestamp: {}",
                        url,
                        site_name,
                        err,
                        attempt,
                        Utc::now().to_rfc3339()
                    );
                    return Err(err);
                }
            }
        }
        unreachable!("retry loop returns on its final attempt")
    }
}

/// Process-wide origin -> limiter map, initialized lazily and torn down on
/// shutdown.
fn limiters() -> &'static DashMap<String, Arc<DomainRateLimiter>> {
    static LIMITERS: OnceLock<DashMap<String, Arc<DomainRateLimiter>>> = OnceLock::new();
    LIMITERS.get_or_init(DashMap::new)
}

/// The host (and explicit port, if any) of a URL keys rate limiting; a
/// sentinel is used when the URL has no host.
pub fn origin_of(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return "default".to_string();
    };
    let Some(host) = parsed.host_str() else {
        return "default".to_string();
    };
    match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Get or create the limiter for a URL's origin. The first config seen for
/// an origin fixes its limits.
pub fn limiter_for_url(
    url: &str,
    rate: &RateLimitConfig,
    retry: &RetryConfig,
) -> Arc<DomainRateLimiter> {
    limiters()
        .entry(origin_of(url))
        .or_insert_with(|| Arc::new(DomainRateLimiter::new(rate, retry)))
        .clone()
}

/// Drop all cached limiters. Called on shutdown and between tests.
pub fn reset_limiters() {
    limiters().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn fetch_ok(status: u16) -> FetchResult {
        FetchResult {
            url: "http://h/".into(),
            status_code: status,
            body: String::new(),
            headers: BTreeMap::new(),
            elapsed: Duration::from_millis(1),
        }
    }

    fn limiter(delay: f64, concurrent: u32, retries: u32, backoff: f64) -> DomainRateLimiter {
        DomainRateLimiter::new(
            &RateLimitConfig {
                delay_seconds: delay,
                max_concurrent: concurrent,
            },
            &RetryConfig {
                max_retries: retries,
                backoff_factor: backoff,
            },
        )
    }

    #[tokio::test]
    async fn spacing_between_request_starts() {
        let limiter = limiter(0.1, 1, 0, 2.0);
        let starts = Arc::new(std::sync::Mutex::new(Vec::new()));

        for _ in 0..3 {
            let starts = starts.clone();
            limiter
                .execute("http://h/", "t", move || {
                    let starts = starts.clone();
                    async move {
                        starts.lock().unwrap().push(Instant::now());
                        Ok(fetch_ok(200))
                    }
                })
                .await
                .unwrap();
        }

        let starts = starts.lock().unwrap();
        for pair in starts.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= Duration::from_millis(95), "gap was {gap:?}");
        }
    }

    #[tokio::test]
    async fn concurrency_is_capped_per_origin() {
        let limiter = Arc::new(limiter(0.001, 2, 0, 2.0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                limiter
                    .execute("http://h/", "t", move || {
                        let in_flight = in_flight.clone();
                        let peak = peak.clone();
                        async move {
                            let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(current, Ordering::SeqCst);
                            sleep(Duration::from_millis(30)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(fetch_ok(200))
                        }
                    })
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn recovers_after_retryable_statuses() {
        let limiter = limiter(0.001, 1, 2, 0.01);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result = limiter
            .execute("http://h/", "t", move || {
                let calls = calls_in.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Ok(fetch_ok(if n < 2 { 503 } else { 200 }))
                }
            })
            .await
            .unwrap();

        assert_eq!(result.status_code, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_retryable_response() {
        let limiter = limiter(0.001, 1, 2, 0.01);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result = limiter
            .execute("http://h/", "t", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(fetch_ok(503))
                }
            })
            .await
            .unwrap();

        // Exactly max_retries + 1 attempts; the final response surfaces.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.status_code, 503);
    }

    #[tokio::test]
    async fn transport_exhaustion_propagates_the_error() {
        let limiter = limiter(0.001, 1, 1, 0.01);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let err = limiter
            .execute("http://h/", "t", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<FetchResult, _>(FetchError::transport("http://h/", "connection refused"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn terminal_status_is_not_retried() {
        let limiter = limiter(0.001, 1, 3, 0.01);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result = limiter
            .execute("http://h/", "t", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(fetch_ok(404))
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.status_code, 404);
    }

    #[tokio::test]
    async fn backoff_delays_grow_with_attempts() {
        let limiter = limiter(0.001, 1, 1, 0.2);
        let start = Instant::now();
        let _ = limiter
            .execute("http://h/", "t", || async { Ok(fetch_ok(503)) })
            .await
            .unwrap();
        // One retry with backoff_factor^1 = 0.2s.
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[test]
    fn origin_extraction() {
        assert_eq!(origin_of("http://example.com/a/b"), "example.com");
        assert_eq!(origin_of("https://sub.example.com:8080/x"), "sub.example.com:8080");
        assert_eq!(origin_of("not a url"), "default");
    }

    #[tokio::test]
    async fn limiters_are_shared_per_origin() {
        reset_limiters();
        let rate = RateLimitConfig { delay_seconds: 1.0, max_concurrent: 1 };
        let retry = RetryConfig { max_retries: 0, backoff_factor: 2.0 };
        let a = limiter_for_url("http://one.test/a", &rate, &retry);
        let b = limiter_for_url("http://one.test/b", &rate, &retry);
        let c = limiter_for_url("http://two.test/", &rate, &retry);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        reset_limiters();
    }
}
