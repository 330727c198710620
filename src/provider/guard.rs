// =============================================================================
// Provider Guard — token bucket, TTL cache, circuit breaker, dedupe
// =============================================================================
//
// One guard instance per upstream provider. Call ordering is fixed:
//
//   breaker admission -> token bucket -> TTL cache -> in-flight dedupe ->
//   HTTP call -> breaker window update -> cache write -> return
//
// Breaker states:
//   CLOSED    — forward requests; rolling window of the last
//               `window_requests` outcomes. Window full AND failure rate
//               above `failure_threshold` => OPEN.
//   OPEN      — reject immediately with BREAKER_OPEN. Nothing is served
//               while open, not even stale cache. After
//               `probe_interval_seconds` => HALF_OPEN.
//   HALF_OPEN — exactly one probe request. Success => CLOSED (window
//               cleared); failure => OPEN with the probe timer reset.
//
// Retries: exponential backoff (factor 2, ±20% jitter, `max_retries` cap).
// 4xx other than 429 is never retried and does not count against the
// breaker; 429/5xx/network failures are retried and counted.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ProviderGuardConfig;
use crate::error::{ErrorKind, ScanError};

// =============================================================================
// Upstream call outcome
// =============================================================================

/// Error surface a provider call reports back to the guard. The guard's
/// retry and breaker policies key off these variants.
#[derive(Debug, Clone)]
pub enum FetchError {
    /// HTTP status error with the upstream body (truncated by the caller).
    Status { code: u16, body: String },
    /// Connect/read failure before a status line was seen.
    Network(String),
    Timeout,
}

impl FetchError {
    /// 429 and 5xx are retryable; other 4xx are terminal.
    fn retryable(&self) -> bool {
        match self {
            Self::Status { code, .. } => *code == 429 || *code >= 500,
            Self::Network(_) | Self::Timeout => true,
        }
    }

    /// Whether this outcome counts as a failure in the breaker window.
    /// Client errors other than 429 mean the provider is healthy.
    fn counts_as_failure(&self) -> bool {
        match self {
            Self::Status { code, .. } => *code == 429 || *code >= 500,
            Self::Network(_) | Self::Timeout => true,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status { code, body } => write!(f, "upstream returned {code}: {body}"),
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::Timeout => write!(f, "request timed out"),
        }
    }
}

/// Successful guarded response.
#[derive(Debug, Clone)]
pub struct GuardedResponse {
    pub value: serde_json::Value,
    pub cache_hit: bool,
}

// =============================================================================
// Internal state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

struct Breaker {
    state: BreakerState,
    /// Rolling outcome window; `true` entries are failures.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    /// When the in-flight probe was admitted; a probe abandoned past the
    /// probe interval (cancelled task) releases the slot.
    probe_started: Option<Instant>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Monotonic per-guard counters, read lock-free by the KPI tracker.
#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    breaker_trips: AtomicU64,
}

/// Immutable snapshot of the guard's counters and breaker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardSnapshot {
    pub provider: String,
    pub breaker: BreakerState,
    pub requests: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub breaker_trips: u64,
}

// =============================================================================
// ProviderGuard
// =============================================================================

/// Per-provider admission control. Wrapped in an `Arc` and shared by the
/// warm tier and the ops guards.
pub struct ProviderGuard {
    name: String,
    config: ProviderGuardConfig,
    bucket: Mutex<TokenBucket>,
    breaker: Mutex<Breaker>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    /// Single-waiter dedupe: concurrent calls for the same key share one
    /// upstream request through a per-key async mutex.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    counters: Counters,
}

impl ProviderGuard {
    pub fn new(name: impl Into<String>, config: ProviderGuardConfig) -> Arc<Self> {
        let name = name.into();
        debug!(provider = %name, ttl_s = config.ttl_seconds, "provider guard initialised");
        // Starts full so a cold start can burst.
        let initial_tokens = config.burst_limit as f64;
        Arc::new(Self {
            name,
            config,
            bucket: Mutex::new(TokenBucket {
                tokens: initial_tokens,
                last_refill: Instant::now(),
            }),
            breaker: Mutex::new(Breaker {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
                probe_started: None,
            }),
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.refresh_breaker();
        self.breaker.lock().state
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        GuardSnapshot {
            provider: self.name.clone(),
            breaker: self.breaker_state(),
            requests: self.counters.requests.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            breaker_trips: self.counters.breaker_trips.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // Main entry point
    // -------------------------------------------------------------------------

    /// Run `call` through the guard for cache key `key`.
    ///
    /// `call` must be repeatable: the retry loop invokes it once per attempt.
    pub async fn fetch<F, Fut>(&self, key: &str, call: F) -> Result<GuardedResponse, ScanError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, FetchError>>,
    {
        // --- 1. Breaker admission -------------------------------------------
        let probe = self.admit()?;

        // --- 2. Token bucket ------------------------------------------------
        self.acquire_token().await;

        // --- 3. TTL cache ---------------------------------------------------
        if let Some(value) = self.cache_lookup(key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            if probe {
                // Admission reserved the probe slot but no upstream call
                // happened; release it without a verdict.
                {
                    let mut b = self.breaker.lock();
                    b.probe_in_flight = false;
                    b.probe_started = None;
                }
            }
            return Ok(GuardedResponse {
                value,
                cache_hit: true,
            });
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        // --- 4. In-flight dedupe -------------------------------------------
        let key_lock = {
            let mut map = self.inflight.lock();
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _dedupe = key_lock.lock().await;

        // The winner of the race may have populated the cache while we
        // waited on the key lock.
        if let Some(value) = self.cache_lookup(key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            if probe {
                {
                    let mut b = self.breaker.lock();
                    b.probe_in_flight = false;
                    b.probe_started = None;
                }
            }
            return Ok(GuardedResponse {
                value,
                cache_hit: true,
            });
        }

        // --- 5. HTTP call with retries -------------------------------------
        let result = self.call_with_retries(&call, probe).await;

        match result {
            Ok(value) => {
                // --- 6. Cache write ----------------------------------------
                self.cache_store(key, value.clone());
                Ok(GuardedResponse {
                    value,
                    cache_hit: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Drop expired entries; called opportunistically by the warm tier.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.cache.write().retain(|_, e| e.expires_at > now);
    }

    // -------------------------------------------------------------------------
    // Breaker
    // -------------------------------------------------------------------------

    /// Move OPEN -> HALF_OPEN once the probe interval has elapsed, and
    /// reclaim a probe slot whose task went away without reporting.
    fn refresh_breaker(&self) {
        let probe_interval = Duration::from_secs(self.config.probe_interval_seconds);
        let mut b = self.breaker.lock();

        if b.state == BreakerState::Open {
            let elapsed = b
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if elapsed >= probe_interval {
                b.state = BreakerState::HalfOpen;
                b.probe_in_flight = false;
                b.probe_started = None;
                debug!(provider = %self.name, "breaker HALF_OPEN — probe window open");
            }
        } else if b.state == BreakerState::HalfOpen && b.probe_in_flight {
            let abandoned = b
                .probe_started
                .is_some_and(|t| t.elapsed() >= probe_interval.max(Duration::from_secs(1)));
            if abandoned {
                b.probe_in_flight = false;
                b.probe_started = None;
                warn!(provider = %self.name, "half-open probe abandoned — slot released");
            }
        }
    }

    /// Admission check. Returns `true` when this request is the half-open
    /// probe.
    fn admit(&self) -> Result<bool, ScanError> {
        self.refresh_breaker();
        let mut b = self.breaker.lock();
        match b.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => Err(ScanError::new(
                ErrorKind::Breaker,
                format!("BREAKER_OPEN: provider '{}' is refusing calls", self.name),
            )
            .with_offender(self.name.clone())),
            BreakerState::HalfOpen => {
                if b.probe_in_flight {
                    Err(ScanError::new(
                        ErrorKind::Breaker,
                        format!("BREAKER_OPEN: provider '{}' probe already in flight", self.name),
                    )
                    .with_offender(self.name.clone()))
                } else {
                    b.probe_in_flight = true;
                    b.probe_started = Some(Instant::now());
                    Ok(true)
                }
            }
        }
    }

    /// Record one upstream outcome and run the state transitions.
    fn record_outcome(&self, failure: bool, probe: bool) {
        let mut b = self.breaker.lock();

        if probe {
            b.probe_in_flight = false;
            b.probe_started = None;
            if failure {
                b.state = BreakerState::Open;
                b.opened_at = Some(Instant::now());
                self.counters.breaker_trips.fetch_add(1, Ordering::Relaxed);
                warn!(provider = %self.name, "half-open probe failed — breaker OPEN again");
            } else {
                b.state = BreakerState::Closed;
                b.window.clear();
                debug!(provider = %self.name, "half-open probe succeeded — breaker CLOSED");
            }
            return;
        }

        b.window.push_back(failure);
        while b.window.len() > self.config.window_requests {
            b.window.pop_front();
        }

        if b.state == BreakerState::Closed && b.window.len() >= self.config.window_requests {
            let failures = b.window.iter().filter(|&&f| f).count();
            let rate = failures as f64 / b.window.len() as f64;
            if rate > self.config.failure_threshold {
                b.state = BreakerState::Open;
                b.opened_at = Some(Instant::now());
                self.counters.breaker_trips.fetch_add(1, Ordering::Relaxed);
                warn!(
                    provider = %self.name,
                    failure_rate = format!("{rate:.2}"),
                    threshold = self.config.failure_threshold,
                    "failure rate over threshold — breaker OPEN"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Token bucket
    // -------------------------------------------------------------------------

    /// Wait until a token is available, then consume it. Refill happens in
    /// wall time at `sustained_rate` tokens/second up to `burst_limit`.
    async fn acquire_token(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.config.sustained_rate)
                    .min(self.config.burst_limit as f64);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(
                        deficit / self.config.sustained_rate.max(1e-9),
                    ))
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Tokens currently available (refilled to now). Used by tests and the
    /// health surface.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.sustained_rate)
            .min(self.config.burst_limit as f64);
        bucket.last_refill = now;
        bucket.tokens
    }

    // -------------------------------------------------------------------------
    // TTL cache
    // -------------------------------------------------------------------------

    fn cache_lookup(&self, key: &str) -> Option<serde_json::Value> {
        let cache = self.cache.read();
        cache
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    fn cache_store(&self, key: &str, value: serde_json::Value) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + Duration::from_secs(self.config.ttl_seconds),
        };
        self.cache.write().insert(key.to_string(), entry);
    }

    // -------------------------------------------------------------------------
    // Retry loop
    // -------------------------------------------------------------------------

    async fn call_with_retries<F, Fut>(
        &self,
        call: &F,
        probe: bool,
    ) -> Result<serde_json::Value, ScanError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, FetchError>>,
    {
        // A half-open probe gets exactly one attempt.
        let max_attempts = if probe { 1 } else { self.config.max_retries + 1 };
        let mut last_err: Option<FetchError> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let base = self.config.backoff_base_ms as f64 * 2f64.powi(attempt as i32 - 1);
                let jitter = rand::thread_rng().gen_range(0.8..1.2);
                tokio::time::sleep(Duration::from_millis((base * jitter) as u64)).await;
            }

            self.counters.requests.fetch_add(1, Ordering::Relaxed);

            match call().await {
                Ok(value) => {
                    self.record_outcome(false, probe);
                    return Ok(value);
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.record_outcome(e.counts_as_failure(), probe);
                    debug!(
                        provider = %self.name,
                        attempt,
                        error = %e,
                        retryable = e.retryable(),
                        "upstream call failed"
                    );
                    let retryable = e.retryable();
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                    // Re-check admission between attempts: the window may
                    // have just tripped the breaker.
                    if self.breaker.lock().state != BreakerState::Closed && !probe {
                        break;
                    }
                }
            }
        }

        let err = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(ScanError::new(
            ErrorKind::Transient,
            format!("provider '{}' call failed: {err}", self.name),
        )
        .with_offender(self.name.clone()))
    }
}

impl std::fmt::Debug for ProviderGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderGuard")
            .field("name", &self.name)
            .field("breaker", &self.breaker.lock().state)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn test_config() -> ProviderGuardConfig {
        ProviderGuardConfig {
            ttl_seconds: 60,
            burst_limit: 100,
            sustained_rate: 1000.0,
            max_retries: 0,
            backoff_base_ms: 1,
            failure_threshold: 0.5,
            window_requests: 4,
            probe_interval_seconds: 3600,
            timeout_seconds: 5,
        }
    }

    fn json_ok() -> serde_json::Value {
        serde_json::json!({"ok": true})
    }

    #[tokio::test]
    async fn cache_hit_skips_upstream() {
        let guard = ProviderGuard::new("test", test_config());
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let resp = guard
                .fetch("k", move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json_ok())
                    }
                })
                .await
                .unwrap();
            assert_eq!(resp.value, json_ok());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1, "only the first call goes upstream");
        let snap = guard.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_misses, 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_window_full_of_failures() {
        let guard = ProviderGuard::new("test", test_config());
        let calls = Arc::new(AtomicU32::new(0));

        // window_requests = 4, threshold 0.5 — four failures trip it.
        for i in 0..4 {
            let calls = calls.clone();
            let key = format!("k{i}");
            let _ = guard
                .fetch(&key, move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<serde_json::Value, _>(FetchError::Status {
                            code: 500,
                            body: "boom".to_string(),
                        })
                    }
                })
                .await;
        }

        assert_eq!(guard.breaker_state(), BreakerState::Open);
        let upstream_before = calls.load(Ordering::SeqCst);

        // Further calls are rejected without touching upstream.
        for i in 0..10 {
            let calls = calls.clone();
            let key = format!("x{i}");
            let err = guard
                .fetch(&key, move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json_ok())
                    }
                })
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Breaker);
            assert!(err.message.contains("BREAKER_OPEN"));
        }

        assert_eq!(
            calls.load(Ordering::SeqCst),
            upstream_before,
            "no upstream calls while OPEN"
        );
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_breaker() {
        let mut config = test_config();
        config.probe_interval_seconds = 0; // probe window opens immediately
        let guard = ProviderGuard::new("test", config);

        for i in 0..4 {
            let key = format!("k{i}");
            let _ = guard
                .fetch(&key, || async {
                    Err::<serde_json::Value, _>(FetchError::Timeout)
                })
                .await;
        }

        // probe_interval elapsed (0s) — next call is the single probe.
        let resp = guard
            .fetch("probe", || async { Ok(json_ok()) })
            .await
            .unwrap();
        assert!(!resp.cache_hit);
        assert_eq!(guard.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let mut config = test_config();
        config.probe_interval_seconds = 0;
        let guard = ProviderGuard::new("test", config);

        for i in 0..4 {
            let key = format!("k{i}");
            let _ = guard
                .fetch(&key, || async {
                    Err::<serde_json::Value, _>(FetchError::Timeout)
                })
                .await;
        }

        let err = guard
            .fetch("probe", || async {
                Err::<serde_json::Value, _>(FetchError::Timeout)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);

        // Probe interval of zero means the breaker is immediately probeable
        // again, so observable state is HALF_OPEN rather than OPEN.
        let state = guard.breaker_state();
        assert_ne!(state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn client_errors_do_not_trip_breaker() {
        let guard = ProviderGuard::new("test", test_config());

        for i in 0..8 {
            let key = format!("k{i}");
            let _ = guard
                .fetch(&key, || async {
                    Err::<serde_json::Value, _>(FetchError::Status {
                        code: 404,
                        body: "not found".to_string(),
                    })
                })
                .await;
        }

        assert_eq!(guard.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn retries_on_retryable_errors() {
        let mut config = test_config();
        config.max_retries = 2;
        // Generous window so retries alone never trip the breaker here.
        config.window_requests = 100;
        let guard = ProviderGuard::new("test", config);
        let calls = Arc::new(AtomicU32::new(0));

        let c2 = calls.clone();
        let resp = guard
            .fetch("k", move || {
                let calls = c2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(FetchError::Status {
                            code: 503,
                            body: "unavailable".to_string(),
                        })
                    } else {
                        Ok(json_ok())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(resp.value, json_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_retry_on_4xx() {
        let mut config = test_config();
        config.max_retries = 3;
        let guard = ProviderGuard::new("test", config);
        let calls = Arc::new(AtomicU32::new(0));

        let c2 = calls.clone();
        let err = guard
            .fetch("k", move || {
                let calls = c2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<serde_json::Value, _>(FetchError::Status {
                        code: 400,
                        body: "bad request".to_string(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "4xx must not be retried");
    }

    #[tokio::test]
    async fn token_bucket_caps_burst() {
        let mut config = test_config();
        config.burst_limit = 3;
        config.sustained_rate = 1000.0;
        let guard = ProviderGuard::new("test", config);

        // Fill to burst.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(guard.available_tokens() <= 3.0 + f64::EPSILON);
    }

    #[tokio::test]
    async fn concurrent_same_key_shares_one_upstream_call() {
        let guard = ProviderGuard::new("test", test_config());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .fetch("shared", move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(json_ok())
                        }
                    })
                    .await
            }));
        }

        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "dedupe shares one upstream call");
    }
}
