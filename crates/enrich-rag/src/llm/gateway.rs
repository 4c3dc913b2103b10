//! Rate-limited call gateway.
//!
//! Token bucket: at most N calls per rolling window, refilled linearly at one
//! token every `window / N`. Rate-limit responses are retried with
//! exponential backoff; every other error propagates immediately.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};

use super::{ClassificationService, Completion, CompletionRequest};
use crate::config::GatewayConfig;
use crate::error::GatewayError;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Bounded exponential backoff for rate-limit responses.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Call counters shared by every component that talks to the service.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    calls: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub retries: u64,
    pub errors: u64,
}

impl MetricsSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Counter growth between an earlier snapshot and this one.
    pub fn since(&self, earlier: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            calls: self.calls.saturating_sub(earlier.calls),
            prompt_tokens: self.prompt_tokens.saturating_sub(earlier.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_sub(earlier.completion_tokens),
            retries: self.retries.saturating_sub(earlier.retries),
            errors: self.errors.saturating_sub(earlier.errors),
        }
    }
}

impl GatewayMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn record_usage(&self, completion: &Completion) {
        self.prompt_tokens
            .fetch_add(completion.prompt_tokens as u64, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(completion.completion_tokens as u64, Ordering::Relaxed);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// The one shared gate in front of the classification service.
pub struct CallGateway {
    service: Arc<dyn ClassificationService>,
    limiter: DirectLimiter,
    refill_interval: Duration,
    retry: RetryPolicy,
    metrics: Arc<GatewayMetrics>,
    max_tokens: usize,
}

impl CallGateway {
    /// Gateway allowing `requests_per_minute` calls per rolling 60 s window.
    pub fn new(
        service: Arc<dyn ClassificationService>,
        requests_per_minute: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self::with_window(service, requests_per_minute, Duration::from_secs(60), retry)
    }

    /// Gateway allowing `max_requests` calls per rolling `window`.
    pub fn with_window(
        service: Arc<dyn ClassificationService>,
        max_requests: u32,
        window: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let burst = NonZeroU32::new(max_requests).unwrap_or(NonZeroU32::MIN);
        let refill_interval = (window / burst.get()).max(Duration::from_nanos(1));
        let quota = Quota::with_period(refill_interval)
            .unwrap_or_else(|| Quota::per_minute(burst))
            .allow_burst(burst);

        tracing::info!(
            service = %service.name(),
            max_requests = burst.get(),
            window_ms = window.as_millis() as u64,
            refill_ms = refill_interval.as_millis() as u64,
            "Call gateway initialised"
        );

        Self {
            service,
            limiter: RateLimiter::direct(quota),
            refill_interval,
            retry,
            metrics: Arc::new(GatewayMetrics::default()),
            max_tokens: 300,
        }
    }

    pub fn from_config(service: Arc<dyn ClassificationService>, config: &GatewayConfig) -> Self {
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
        };
        let mut gateway = Self::new(service, config.requests_per_minute, retry);
        gateway.max_tokens = config.max_tokens;
        gateway
    }

    /// Share an existing metrics sink instead of the gateway's own.
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        self.metrics.clone()
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Default completion budget for classification prompts.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Wait until the token bucket grants a slot.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Rate-limited call with backoff on rate-limit responses.
    pub async fn call(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        let mut attempt: u32 = 0;
        loop {
            self.acquire().await;
            self.metrics.record_call();

            match self.service.complete(request).await {
                Ok(completion) => {
                    self.metrics.record_usage(&completion);
                    return Ok(completion);
                }
                Err(e) if e.is_rate_limit() => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        self.metrics.record_error();
                        tracing::error!(
                            service = %self.service.name(),
                            attempts = attempt,
                            "Rate limit retries exhausted"
                        );
                        return Err(GatewayError::RetriesExhausted { attempts: attempt });
                    }
                    self.metrics.record_retry();
                    let backoff = self.retry.delay_for(attempt);
                    let delay = e.retry_after().map_or(backoff, |hint| hint.max(backoff));
                    tracing::warn!(
                        service = %self.service.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        retry_after_ms = e.retry_after().map(|d| d.as_millis() as u64),
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.record_error();
                    tracing::warn!(service = %self.service.name(), error = %e, "Classification call failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedService {
        responses: Mutex<VecDeque<Result<Completion, GatewayError>>>,
        calls: AtomicU64,
    }

    impl ScriptedService {
        fn new(responses: Vec<Result<Completion, GatewayError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ClassificationService for ScriptedService {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Malformed("script exhausted".into())))
        }
    }

    fn ok(text: &str) -> Result<Completion, GatewayError> {
        Ok(Completion {
            text: text.to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
        })
    }

    fn limited() -> Result<Completion, GatewayError> {
        Err(GatewayError::RateLimited { retry_after_ms: 0 })
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_rate_limit_then_succeeds() {
        let service = Arc::new(ScriptedService::new(vec![limited(), limited(), ok("done")]));
        let gateway = CallGateway::new(service.clone(), 1000, RetryPolicy::default());

        let completion = gateway.call(&CompletionRequest::new("x", 10)).await.unwrap();
        assert_eq!(completion.text, "done");

        let metrics = gateway.metrics().snapshot();
        assert_eq!(metrics.calls, 3);
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.errors, 0);
        assert_eq!(metrics.total_tokens(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_is_hard_failure() {
        let service = Arc::new(ScriptedService::new(vec![limited(), limited(), limited()]));
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
        };
        let gateway = CallGateway::new(service.clone(), 1000, policy);

        let err = gateway.call(&CompletionRequest::new("x", 10)).await.unwrap_err();
        assert!(matches!(err, GatewayError::RetriesExhausted { attempts: 3 }));
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
        assert_eq!(gateway.metrics().snapshot().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_extends_backoff() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(GatewayError::RateLimited { retry_after_ms: 5_000 }),
            ok("done"),
        ]));
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        let gateway = CallGateway::new(service.clone(), 1000, policy);

        let start = tokio::time::Instant::now();
        gateway.call(&CompletionRequest::new("x", 10)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(5_000), "{:?}", start.elapsed());
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_retry_after_keeps_backoff() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(GatewayError::RateLimited { retry_after_ms: 10 }),
            ok("done"),
        ]));
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(400),
        };
        let gateway = CallGateway::new(service, 1000, policy);

        let start = tokio::time::Instant::now();
        gateway.call(&CompletionRequest::new("x", 10)).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1_000), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let service = Arc::new(ScriptedService::new(vec![
            Err(GatewayError::Network("connection reset".into())),
            ok("unreachable"),
        ]));
        let gateway = CallGateway::new(service.clone(), 1000, RetryPolicy::default());

        let err = gateway.call(&CompletionRequest::new("x", 10)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.metrics().snapshot().retries, 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill_after_burst() {
        let service = Arc::new(ScriptedService::new(Vec::new()));
        let gateway = CallGateway::with_window(
            service,
            3,
            Duration::from_millis(600),
            RetryPolicy::default(),
        );
        assert_eq!(gateway.refill_interval(), Duration::from_millis(200));

        let start = std::time::Instant::now();
        for _ in 0..3 {
            gateway.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(150));

        gateway.acquire().await;
        assert!(
            start.elapsed() >= Duration::from_millis(150),
            "fourth acquire resolved after {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn test_snapshot_delta() {
        let earlier = MetricsSnapshot {
            calls: 2,
            prompt_tokens: 20,
            ..Default::default()
        };
        let later = MetricsSnapshot {
            calls: 5,
            prompt_tokens: 50,
            completion_tokens: 7,
            ..Default::default()
        };
        let delta = later.since(&earlier);
        assert_eq!(delta.calls, 3);
        assert_eq!(delta.total_tokens(), 37);
    }
}
