// =============================================================================
// Warm Tier — REST-backed cache behind the provider guard
// =============================================================================
//
// Entries are keyed by (symbol, payload kind) within a venue and carry an
// expiry derived from the provider's TTL. A read either serves a non-expired
// entry (`cache_hit = true`) or calls upstream through the provider guard
// and stores the fresh entry (`cache_hit = false`).
//
// The tier is available when the guard's breaker is not OPEN: a cached
// entry can be served or a refetch can at least be attempted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::data::{Envelope, Payload, PayloadKind, Tier};
use crate::error::{ErrorKind, ScanError};
use crate::provider::guard::{BreakerState, ProviderGuard};
use crate::provider::kraken::{self, KrakenClient};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WarmKey {
    symbol: String,
    kind: PayloadKind,
}

struct WarmEntry {
    payload: Payload,
    /// Payload timestamp (bar close / book update), not the fetch time.
    timestamp: DateTime<Utc>,
    expires_at: Instant,
}

/// REST-backed cache for one venue.
pub struct WarmTier {
    venue: String,
    client: KrakenClient,
    guard: Arc<ProviderGuard>,
    cache: RwLock<HashMap<WarmKey, WarmEntry>>,
    ttl: Duration,
}

impl WarmTier {
    pub fn new(
        venue: impl Into<String>,
        client: KrakenClient,
        guard: Arc<ProviderGuard>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            venue: venue.into(),
            client,
            guard,
            cache: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_seconds),
        }
    }

    /// The tier can serve or refetch as long as the breaker is not OPEN.
    pub fn is_available(&self) -> bool {
        self.guard.breaker_state() != BreakerState::Open
    }

    pub fn guard(&self) -> &Arc<ProviderGuard> {
        &self.guard
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Order-book top via REST Depth.
    pub async fn get_order_book(&self, symbol: &str) -> Result<Envelope, ScanError> {
        if let Some(env) = self.cached(symbol, PayloadKind::OrderBook) {
            return Ok(env);
        }

        let retrieved_at = Utc::now();
        let resp = self
            .guard
            .fetch(&self.request_key(symbol, PayloadKind::OrderBook), || {
                let client = self.client.clone();
                let symbol = symbol.to_string();
                async move { client.depth(&symbol, 100).await }
            })
            .await?;

        let book = kraken::parse_book_top(&resp.value, retrieved_at).map_err(|e| {
            ScanError::new(
                ErrorKind::DataQuality,
                format!("failed to parse depth for {symbol}: {e}"),
            )
            .with_offender(symbol.to_string())
        })?;

        let timestamp = book.last_update;
        let payload = Payload::OrderBook(book);
        self.store(symbol, PayloadKind::OrderBook, payload.clone(), timestamp);

        Ok(self.envelope(symbol, timestamp, payload, resp.cache_hit))
    }

    /// Latest hourly bar plus trailing 24h USD volume via REST OHLC.
    pub async fn get_price(&self, symbol: &str) -> Result<Envelope, ScanError> {
        if let Some(env) = self.cached(symbol, PayloadKind::Price) {
            return Ok(env);
        }

        let resp = self
            .guard
            .fetch(&self.request_key(symbol, PayloadKind::Price), || {
                let client = self.client.clone();
                let symbol = symbol.to_string();
                async move { client.ohlc(&symbol, 60).await }
            })
            .await?;

        let bars = kraken::parse_ohlc_bars(&resp.value).map_err(|e| {
            ScanError::new(
                ErrorKind::DataQuality,
                format!("failed to parse OHLC for {symbol}: {e}"),
            )
            .with_offender(symbol.to_string())
        })?;

        let bar = bars.last().cloned().ok_or_else(|| {
            ScanError::new(
                ErrorKind::DataQuality,
                format!("empty OHLC response for {symbol}"),
            )
            .with_offender(symbol.to_string())
        })?;

        // Trailing 24 hourly bars approximate the 24h USD volume.
        let volume_24h_usd: f64 = bars
            .iter()
            .rev()
            .take(24)
            .map(|b| b.volume * b.close)
            .sum();

        let timestamp = bar.timestamp;
        let payload = Payload::Price {
            bar,
            volume_24h_usd,
        };
        self.store(symbol, PayloadKind::Price, payload.clone(), timestamp);

        Ok(self.envelope(symbol, timestamp, payload, resp.cache_hit))
    }

    /// Historical hourly bars filtered to `[start, end]`.
    pub async fn get_historical(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Envelope, ScanError> {
        if let Some(env) = self.cached(symbol, PayloadKind::Historical) {
            if let Payload::Historical(bars) = env.payload {
                let filtered: Vec<_> = bars
                    .into_iter()
                    .filter(|b| b.timestamp >= start && b.timestamp <= end)
                    .collect();
                let timestamp = filtered.last().map(|b| b.timestamp).unwrap_or(end);
                return Ok(self.envelope(symbol, timestamp, Payload::Historical(filtered), true));
            }
        }

        let resp = self
            .guard
            .fetch(&self.request_key(symbol, PayloadKind::Historical), || {
                let client = self.client.clone();
                let symbol = symbol.to_string();
                async move { client.ohlc(&symbol, 60).await }
            })
            .await?;

        let bars = kraken::parse_ohlc_bars(&resp.value).map_err(|e| {
            ScanError::new(
                ErrorKind::DataQuality,
                format!("failed to parse OHLC for {symbol}: {e}"),
            )
            .with_offender(symbol.to_string())
        })?;

        let filtered: Vec<_> = bars
            .into_iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .collect();

        let timestamp = filtered.last().map(|b| b.timestamp).unwrap_or(end);

        Ok(self.envelope(
            symbol,
            timestamp,
            Payload::Historical(filtered),
            resp.cache_hit,
        ))
    }

    // -------------------------------------------------------------------------
    // Cache plumbing
    // -------------------------------------------------------------------------

    fn request_key(&self, symbol: &str, kind: PayloadKind) -> String {
        format!("{}:{symbol}:{kind}", self.venue)
    }

    fn cached(&self, symbol: &str, kind: PayloadKind) -> Option<Envelope> {
        // Nothing is served while the breaker is OPEN, not even stale.
        if self.guard.breaker_state() == BreakerState::Open {
            return None;
        }

        let key = WarmKey {
            symbol: symbol.to_string(),
            kind,
        };
        let cache = self.cache.read();
        let entry = cache.get(&key).filter(|e| e.expires_at > Instant::now())?;

        debug!(symbol, kind = %kind, "warm cache hit");
        Some(self.envelope(symbol, entry.timestamp, entry.payload.clone(), true))
    }

    fn store(&self, symbol: &str, kind: PayloadKind, payload: Payload, timestamp: DateTime<Utc>) {
        let key = WarmKey {
            symbol: symbol.to_string(),
            kind,
        };
        self.cache.write().insert(
            key,
            WarmEntry {
                payload,
                timestamp,
                expires_at: Instant::now() + self.ttl,
            },
        );
        self.guard.evict_expired();
    }

    fn envelope(
        &self,
        symbol: &str,
        timestamp: DateTime<Utc>,
        payload: Payload,
        cache_hit: bool,
    ) -> Envelope {
        Envelope::new(
            symbol,
            &self.venue,
            timestamp,
            Tier::Warm,
            payload,
            format!("{}_rest", self.venue.to_lowercase()),
            cache_hit,
        )
    }

    /// Test/selftest hook: seed a cache entry without an upstream call.
    pub fn seed(&self, symbol: &str, payload: Payload, timestamp: DateTime<Utc>) {
        self.store(symbol, payload.kind(), payload, timestamp);
    }
}

impl std::fmt::Debug for WarmTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmTier")
            .field("venue", &self.venue)
            .field("entries", &self.cache.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderGuardConfig;
    use crate::data::{BookTop, Ohlc};
    use crate::provider::guard::FetchError;

    fn test_tier() -> WarmTier {
        let guard = ProviderGuard::new("kraken", ProviderGuardConfig::default());
        // Unroutable base URL: any real fetch attempt fails fast.
        let client = KrakenClient::new(1).with_base_url("http://127.0.0.1:1");
        WarmTier::new("KRAKEN", client, guard, 30)
    }

    fn sample_book() -> Payload {
        Payload::OrderBook(BookTop {
            best_bid: 99.0,
            best_ask: 101.0,
            bid_depth_usd: 200_000.0,
            ask_depth_usd: 180_000.0,
            last_update: Utc::now(),
        })
    }

    #[tokio::test]
    async fn seeded_entry_serves_as_cache_hit() {
        let tier = test_tier();
        let ts = Utc::now();
        tier.seed("BTCUSD", sample_book(), ts);

        let env = tier.get_order_book("BTCUSD").await.unwrap();
        assert_eq!(env.source_tier, Tier::Warm);
        assert!(env.provenance.cache_hit);
        assert_eq!(env.timestamp, ts);
    }

    #[tokio::test]
    async fn miss_with_unreachable_upstream_is_transient() {
        let tier = test_tier();
        let err = tier.get_order_book("BTCUSD").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
    }

    #[tokio::test]
    async fn unavailable_when_breaker_open() {
        let guard = ProviderGuard::new(
            "kraken",
            ProviderGuardConfig {
                window_requests: 2,
                failure_threshold: 0.5,
                max_retries: 0,
                probe_interval_seconds: 3600,
                ..ProviderGuardConfig::default()
            },
        );

        // Trip the breaker with direct guard calls; no HTTP involved.
        for i in 0..2 {
            let key = format!("k{i}");
            let _ = guard
                .fetch(&key, || async {
                    Err::<serde_json::Value, _>(FetchError::Timeout)
                })
                .await;
        }
        assert_eq!(guard.breaker_state(), BreakerState::Open);

        let client = KrakenClient::new(1).with_base_url("http://127.0.0.1:1");
        let tier = WarmTier::new("KRAKEN", client, guard, 30);
        assert!(!tier.is_available());

        // Even a seeded entry is not served while OPEN at the facade level;
        // the tier itself reports unavailable and a direct read would be
        // rejected by the guard before any upstream call.
        let err = tier.get_order_book("ETHUSD").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Breaker);
    }

    #[tokio::test]
    async fn price_payload_from_seed() {
        let tier = test_tier();
        let bar = Ohlc {
            timestamp: Utc::now(),
            open: 100.0,
            high: 102.0,
            low: 99.0,
            close: 101.0,
            volume: 10.0,
        };
        tier.seed(
            "ETHUSD",
            Payload::Price {
                bar: bar.clone(),
                volume_24h_usd: 1e6,
            },
            bar.timestamp,
        );

        let env = tier.get_price("ETHUSD").await.unwrap();
        match env.payload {
            Payload::Price { bar: got, .. } => assert_eq!(got, bar),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
