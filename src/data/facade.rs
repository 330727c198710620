// =============================================================================
// Data Facade — uniform access across Hot / Warm / Cold tiers
// =============================================================================
//
// The facade owns the tier clients and is the only component that touches
// them. Per request the tier order is fixed: Hot if connected and
// subscribed, else Warm if the provider guard admits calls, else Cold if
// local files cover the request. A tier is skipped only on an availability
// failure; every tier actually tried is appended to the envelope's
// fallback_chain (in hot -> warm -> cold order), and `source_tier` always
// equals the last element.
//
// The facade recomputes freshness on every hand-off and emits metric
// events (tier_hit / tier_miss / fallback_used / checksum_mismatch) into
// the KPI tracker. On total failure the error names every tier tried and
// why.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::data::cold::ColdTier;
use crate::data::hot::HotTier;
use crate::data::warm::WarmTier;
use crate::data::{Envelope, PayloadKind, Tier};
use crate::error::{ErrorKind, ScanError};
use crate::ops::kpi::{FacadeEvent, KpiTracker};

pub struct DataFacade {
    venue: String,
    hot: Arc<HotTier>,
    warm: WarmTier,
    cold: ColdTier,
    kpi: Arc<KpiTracker>,
    /// Emergency switch: when false, hot and warm are skipped entirely.
    live_data: AtomicBool,
}

impl DataFacade {
    pub fn new(
        venue: impl Into<String>,
        hot: Arc<HotTier>,
        warm: WarmTier,
        cold: ColdTier,
        kpi: Arc<KpiTracker>,
    ) -> Self {
        Self {
            venue: venue.into(),
            hot,
            warm,
            cold,
            kpi,
            live_data: AtomicBool::new(true),
        }
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    pub fn set_live_data(&self, enabled: bool) {
        self.live_data.store(enabled, Ordering::Relaxed);
    }

    pub fn hot(&self) -> &Arc<HotTier> {
        &self.hot
    }

    pub fn warm(&self) -> &WarmTier {
        &self.warm
    }

    pub fn cold(&self) -> &ColdTier {
        &self.cold
    }

    // -------------------------------------------------------------------------
    // Public reads
    // -------------------------------------------------------------------------

    /// Venue-native order-book top. Cold files carry no book, so the chain
    /// for this payload ends at warm.
    pub async fn get_order_book(&self, symbol: &str) -> Result<Envelope, ScanError> {
        let mut attempt = FallbackAttempt::new(symbol, PayloadKind::OrderBook);

        if self.hot_admissible(symbol, &mut attempt) {
            match self.hot.get_order_book(symbol) {
                Ok(env) => return Ok(attempt.finish(env, &self.kpi)),
                Err(e) => attempt.record_miss(Tier::Hot, e, &self.kpi),
            }
        }

        if self.warm_admissible(&mut attempt) {
            match self.warm.get_order_book(symbol).await {
                Ok(env) => return Ok(attempt.finish(env, &self.kpi)),
                Err(e) => attempt.record_miss(Tier::Warm, e, &self.kpi),
            }
        }

        Err(attempt.total_failure())
    }

    /// Latest price bar with 24h volume.
    pub async fn get_price_data(&self, symbol: &str) -> Result<Envelope, ScanError> {
        let mut attempt = FallbackAttempt::new(symbol, PayloadKind::Price);

        if self.hot_admissible(symbol, &mut attempt) {
            match self.hot.get_price(symbol) {
                Ok(env) => return Ok(attempt.finish(env, &self.kpi)),
                Err(e) => attempt.record_miss(Tier::Hot, e, &self.kpi),
            }
        }

        if self.warm_admissible(&mut attempt) {
            match self.warm.get_price(symbol).await {
                Ok(env) => return Ok(attempt.finish(env, &self.kpi)),
                Err(e) => attempt.record_miss(Tier::Warm, e, &self.kpi),
            }
        }

        if self.cold_admissible_any(symbol, &mut attempt) {
            match self.cold.latest_price(symbol) {
                Ok(env) => return Ok(attempt.finish(env, &self.kpi)),
                Err(e) => attempt.record_miss(Tier::Cold, e, &self.kpi),
            }
        }

        Err(attempt.total_failure())
    }

    /// Historical bars over `[start, end]`. The hot tier keeps no history,
    /// so the chain starts at warm.
    pub async fn get_historical_slice(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Envelope, ScanError> {
        let mut attempt = FallbackAttempt::new(symbol, PayloadKind::Historical);
        attempt.record_skip(Tier::Hot, "hot tier keeps no history");

        if self.warm_admissible(&mut attempt) {
            match self.warm.get_historical(symbol, start, end).await {
                Ok(env) => return Ok(attempt.finish(env, &self.kpi)),
                Err(e) => attempt.record_miss(Tier::Warm, e, &self.kpi),
            }
        }

        if self.cold_admissible_range(symbol, start, end, &mut attempt) {
            match self.cold.get_historical(symbol, start, end) {
                Ok(env) => return Ok(attempt.finish(env, &self.kpi)),
                Err(e) => attempt.record_miss(Tier::Cold, e, &self.kpi),
            }
        }

        Err(attempt.total_failure())
    }

    // -------------------------------------------------------------------------
    // Admission checks (availability failures skip a tier silently apart
    // from the recorded skip reason)
    // -------------------------------------------------------------------------

    fn hot_admissible(&self, symbol: &str, attempt: &mut FallbackAttempt) -> bool {
        if !self.live_data.load(Ordering::Relaxed) {
            attempt.record_skip(Tier::Hot, "live data disabled");
            return false;
        }
        if !self.hot.is_available(symbol) {
            attempt.record_skip(Tier::Hot, "not connected or no fresh subscription tick");
            return false;
        }
        true
    }

    fn warm_admissible(&self, attempt: &mut FallbackAttempt) -> bool {
        if !self.live_data.load(Ordering::Relaxed) {
            attempt.record_skip(Tier::Warm, "live data disabled");
            return false;
        }
        // A breaker refusal is a *tried* tier, not a skip: the guard
        // rejects before any upstream call and the refusal lands in the
        // fallback chain.
        true
    }

    fn cold_admissible_any(&self, symbol: &str, attempt: &mut FallbackAttempt) -> bool {
        if !self.cold.is_available(symbol) {
            attempt.record_skip(Tier::Cold, "no local files for symbol");
            return false;
        }
        true
    }

    fn cold_admissible_range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attempt: &mut FallbackAttempt,
    ) -> bool {
        if !self.cold.covers(symbol, start, end) {
            attempt.record_skip(Tier::Cold, "local files do not cover range");
            return false;
        }
        true
    }
}

impl std::fmt::Debug for DataFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFacade")
            .field("venue", &self.venue)
            .field("hot_connected", &self.hot.is_connected())
            .finish()
    }
}

// =============================================================================
// Per-request fallback bookkeeping
// =============================================================================

struct FallbackAttempt {
    symbol: String,
    kind: PayloadKind,
    /// Tiers actually tried, in order.
    tried: Vec<Tier>,
    /// Why each tier was skipped or failed, in evaluation order.
    reasons: Vec<(Tier, String)>,
    saw_breaker: bool,
    saw_data_quality: bool,
}

impl FallbackAttempt {
    fn new(symbol: &str, kind: PayloadKind) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind,
            tried: Vec::new(),
            reasons: Vec::new(),
            saw_breaker: false,
            saw_data_quality: false,
        }
    }

    fn record_skip(&mut self, tier: Tier, reason: &str) {
        self.reasons.push((tier, format!("skipped: {reason}")));
    }

    fn record_miss(&mut self, tier: Tier, err: ScanError, kpi: &KpiTracker) {
        kpi.record(FacadeEvent::TierMiss(tier));
        kpi.record(FacadeEvent::FallbackUsed);
        match err.kind {
            ErrorKind::Breaker => self.saw_breaker = true,
            ErrorKind::DataQuality => self.saw_data_quality = true,
            _ => {}
        }
        debug!(
            symbol = %self.symbol,
            kind = %self.kind,
            tier = %tier,
            error = %err,
            "tier failed — falling through"
        );
        self.tried.push(tier);
        self.reasons.push((tier, err.message));
    }

    /// Stamp the winning envelope: chain, freshness, checksum audit.
    fn finish(mut self, mut env: Envelope, kpi: &KpiTracker) -> Envelope {
        let tier = env.source_tier;
        self.tried.push(tier);
        kpi.record(FacadeEvent::TierHit(tier));

        env.provenance.fallback_chain = self.tried.clone();
        env.touch();

        if !env.checksum_ok() {
            // The payload was mutated between construction and hand-off.
            // Surface the mismatch for the ops dashboard; the envelope is
            // still returned because the facade owns the only legal
            // mutations (tier, provenance, freshness).
            kpi.record(FacadeEvent::ChecksumMismatch);
            warn!(symbol = %self.symbol, tier = %tier, "payload checksum mismatch");
        }

        env
    }

    fn total_failure(self) -> ScanError {
        let detail = self
            .reasons
            .iter()
            .map(|(tier, why)| format!("{tier}: {why}"))
            .collect::<Vec<_>>()
            .join("; ");

        let kind = if self.saw_data_quality {
            ErrorKind::DataQuality
        } else if self.saw_breaker {
            ErrorKind::Breaker
        } else {
            ErrorKind::Transient
        };

        ScanError::new(
            kind,
            format!(
                "all tiers failed for {} {} [{detail}]",
                self.symbol, self.kind
            ),
        )
        .with_offender(self.symbol)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderGuardConfig;
    use crate::data::cold::ColdRecord;
    use crate::data::hot::HotTick;
    use crate::data::{BookTop, Ohlc, Payload};
    use crate::provider::guard::{BreakerState, FetchError, ProviderGuard};
    use crate::provider::kraken::KrakenClient;
    use chrono::NaiveDate;
    use std::time::Duration as StdDuration;

    fn kpi() -> Arc<KpiTracker> {
        KpiTracker::new(StdDuration::from_secs(3600), StdDuration::from_secs(0))
    }

    fn offline_guard() -> Arc<ProviderGuard> {
        ProviderGuard::new(
            "kraken",
            ProviderGuardConfig {
                max_retries: 0,
                window_requests: 2,
                failure_threshold: 0.5,
                probe_interval_seconds: 3600,
                ..ProviderGuardConfig::default()
            },
        )
    }

    fn facade_with(
        guard: Arc<ProviderGuard>,
        cold_dir: &std::path::Path,
        kpi: Arc<KpiTracker>,
    ) -> DataFacade {
        let hot = HotTier::new("KRAKEN", 5_000);
        let client = KrakenClient::new(1).with_base_url("http://127.0.0.1:1");
        let warm = WarmTier::new("KRAKEN", client, guard, 30);
        let cold = ColdTier::new(cold_dir, "KRAKEN");
        DataFacade::new("KRAKEN", hot, warm, cold, kpi)
    }

    fn fresh_tick() -> HotTick {
        HotTick {
            last: 100.0,
            open_24h: 98.0,
            high_24h: 103.0,
            low_24h: 97.0,
            volume_24h_usd: 5e6,
            best_bid: 99.9,
            best_ask: 100.1,
            bid_qty: 2.0,
            ask_qty: 2.0,
            timestamp: Utc::now(),
        }
    }

    fn cold_record(ts_s: &str, close: f64) -> ColdRecord {
        ColdRecord {
            bar: Ohlc {
                timestamp: DateTime::parse_from_rfc3339(ts_s).unwrap().with_timezone(&Utc),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 10.0,
            },
            venue: "KRAKEN".to_string(),
            tier: "cold".to_string(),
            provenance: "backfill".to_string(),
        }
    }

    #[tokio::test]
    async fn hot_hit_has_single_link_chain() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade_with(offline_guard(), dir.path(), kpi());
        facade.hot().set_connected(true);
        facade.hot().record_tick("BTCUSD", fresh_tick());

        let env = facade.get_order_book("BTCUSD").await.unwrap();
        assert_eq!(env.source_tier, Tier::Hot);
        assert_eq!(env.provenance.fallback_chain, vec![Tier::Hot]);
    }

    #[tokio::test]
    async fn hot_down_falls_to_warm_cache() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade_with(offline_guard(), dir.path(), kpi());
        // Hot disconnected; warm seeded.
        facade.warm().seed(
            "BTCUSD",
            Payload::OrderBook(BookTop {
                best_bid: 99.0,
                best_ask: 101.0,
                bid_depth_usd: 2e5,
                ask_depth_usd: 2e5,
                last_update: Utc::now(),
            }),
            Utc::now(),
        );

        let env = facade.get_order_book("BTCUSD").await.unwrap();
        assert_eq!(env.source_tier, Tier::Warm);
        // Hot was skipped (availability), not tried: chain holds warm only.
        assert_eq!(env.provenance.fallback_chain, vec![Tier::Warm]);
        assert!(env.provenance.cache_hit);
    }

    #[tokio::test]
    async fn breaker_open_falls_to_cold_without_upstream_calls() {
        let dir = tempfile::tempdir().unwrap();
        let guard = offline_guard();

        // Trip the breaker directly (window of 2, both failures).
        for i in 0..2 {
            let key = format!("k{i}");
            let _ = guard
                .fetch(&key, || async {
                    Err::<serde_json::Value, _>(FetchError::Timeout)
                })
                .await;
        }
        assert_eq!(guard.breaker_state(), BreakerState::Open);
        let upstream_before = guard.snapshot().requests;

        let k = kpi();
        let facade = facade_with(guard.clone(), dir.path(), k);
        facade
            .cold()
            .write_day(
                NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                "BTCUSD.csv",
                &[cold_record("2025-06-01T10:00:00Z", 100.0)],
            )
            .unwrap();

        for _ in 0..10 {
            let env = facade.get_price_data("BTCUSD").await.unwrap();
            assert_eq!(env.source_tier, Tier::Cold);
            // Hot is skipped (not connected); warm is tried and refused by
            // the open breaker; cold serves.
            assert_eq!(env.provenance.fallback_chain, vec![Tier::Warm, Tier::Cold]);
        }

        assert_eq!(
            guard.snapshot().requests,
            upstream_before,
            "no upstream calls while the breaker is OPEN"
        );
    }

    #[tokio::test]
    async fn warm_failure_then_cold_builds_two_link_chain() {
        let dir = tempfile::tempdir().unwrap();
        // Breaker closed; the warm fetch itself fails (unroutable REST).
        let guard = offline_guard();
        let facade = facade_with(guard, dir.path(), kpi());
        facade
            .cold()
            .write_day(
                NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                "BTCUSD.csv",
                &[cold_record("2025-06-01T10:00:00Z", 100.0)],
            )
            .unwrap();

        let env = facade.get_price_data("BTCUSD").await.unwrap();
        assert_eq!(env.source_tier, Tier::Cold);
        assert_eq!(env.provenance.fallback_chain, vec![Tier::Warm, Tier::Cold]);
        // source_tier equals the last chain element.
        assert_eq!(env.source_tier, *env.provenance.fallback_chain.last().unwrap());
    }

    #[tokio::test]
    async fn total_failure_names_every_tier() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade_with(offline_guard(), dir.path(), kpi());

        let err = facade.get_price_data("BTCUSD").await.unwrap_err();
        assert!(err.message.contains("hot"));
        assert!(err.message.contains("warm"));
        assert!(err.message.contains("cold"));
        assert_eq!(err.offender.as_deref(), Some("BTCUSD"));
    }

    #[tokio::test]
    async fn historical_skips_hot() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade_with(offline_guard(), dir.path(), kpi());
        facade
            .cold()
            .write_day(
                NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                "ETHUSD.csv",
                &[
                    cold_record("2025-06-01T10:00:00Z", 100.0),
                    cold_record("2025-06-01T11:00:00Z", 101.0),
                ],
            )
            .unwrap();

        let start = DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339("2025-06-01T23:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let env = facade.get_historical_slice("ETHUSD", start, end).await.unwrap();
        assert_eq!(env.source_tier, Tier::Cold);
        assert!(!env.provenance.fallback_chain.contains(&Tier::Hot));
        match env.payload {
            Payload::Historical(bars) => assert_eq!(bars.len(), 2),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disable_live_data_goes_straight_to_cold() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade_with(offline_guard(), dir.path(), kpi());
        facade.hot().set_connected(true);
        facade.hot().record_tick("BTCUSD", fresh_tick());
        facade.set_live_data(false);

        facade
            .cold()
            .write_day(
                NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                "BTCUSD.csv",
                &[cold_record("2025-06-01T10:00:00Z", 100.0)],
            )
            .unwrap();

        let env = facade.get_price_data("BTCUSD").await.unwrap();
        assert_eq!(env.source_tier, Tier::Cold);
        assert_eq!(env.provenance.fallback_chain, vec![Tier::Cold]);
    }

    #[tokio::test]
    async fn kpi_sees_tier_events() {
        let dir = tempfile::tempdir().unwrap();
        let k = kpi();
        let facade = facade_with(offline_guard(), dir.path(), k.clone());
        facade.hot().set_connected(true);
        facade.hot().record_tick("BTCUSD", fresh_tick());

        facade.get_order_book("BTCUSD").await.unwrap();
        let rollup = k.rollup();
        assert_eq!(rollup.tier_hits.get("hot"), Some(&1));
    }
}
