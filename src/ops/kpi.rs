// =============================================================================
// KPI Tracker — rolling operational counters with a cached rollup
// =============================================================================
//
// Every component that touches a provider or a tier reports events here.
// Counters live in a rolling window; readers get immutable snapshot copies.
// The aggregated rollup is recomputed at most once per `cache_ttl`
// (~30 seconds) because several guards read it on every tick.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::data::Tier;
use crate::provider::guard::{BreakerState, GuardSnapshot, ProviderGuard};

/// Facade-level metric events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeEvent {
    TierHit(Tier),
    TierMiss(Tier),
    FallbackUsed,
    ChecksumMismatch,
}

/// One venue-health observation fed by the hot tier / facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueHealthSample {
    pub venue: String,
    pub uptime_percent: f64,
    pub p99_latency_ms: f64,
    pub depth_usd: f64,
    pub spread_bps: f64,
    pub observed_at: DateTime<Utc>,
}

/// Aggregated counters over the rolling window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KpiRollup {
    pub requests: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub breaker_trips: u64,
    pub tier_hits: HashMap<String, u64>,
    pub tier_misses: HashMap<String, u64>,
    pub fallbacks_used: u64,
    pub checksum_mismatches: u64,
    pub open_breakers: Vec<String>,
    pub venues: Vec<VenueHealthSample>,
}

#[derive(Debug, Clone, Copy)]
enum Event {
    TierHit(Tier),
    TierMiss(Tier),
    Fallback,
    ChecksumMismatch,
}

/// Rolling KPI window shared across the engine. Constructed once by the
/// composition root; tests build their own instances.
pub struct KpiTracker {
    window: Duration,
    cache_ttl: Duration,
    events: Mutex<VecDeque<(Instant, Event)>>,
    guards: RwLock<Vec<Arc<ProviderGuard>>>,
    venue_health: RwLock<HashMap<String, VenueHealthSample>>,
    cached: Mutex<Option<(Instant, KpiRollup)>>,
}

impl KpiTracker {
    pub fn new(window: Duration, cache_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            window,
            cache_ttl,
            events: Mutex::new(VecDeque::new()),
            guards: RwLock::new(Vec::new()),
            venue_health: RwLock::new(HashMap::new()),
            cached: Mutex::new(None),
        })
    }

    /// Standard production windows: 1h of events, 30s rollup cache.
    pub fn standard() -> Arc<Self> {
        Self::new(Duration::from_secs(3600), Duration::from_secs(30))
    }

    /// Register a provider guard whose counters roll into the KPI surface.
    pub fn register_guard(&self, guard: Arc<ProviderGuard>) {
        self.guards.write().push(guard);
    }

    pub fn record(&self, event: FacadeEvent) {
        let mapped = match event {
            FacadeEvent::TierHit(t) => Event::TierHit(t),
            FacadeEvent::TierMiss(t) => Event::TierMiss(t),
            FacadeEvent::FallbackUsed => Event::Fallback,
            FacadeEvent::ChecksumMismatch => Event::ChecksumMismatch,
        };
        let mut events = self.events.lock();
        events.push_back((Instant::now(), mapped));
        Self::trim(&mut events, self.window);
    }

    pub fn record_venue_health(&self, sample: VenueHealthSample) {
        self.venue_health
            .write()
            .insert(sample.venue.clone(), sample);
    }

    fn trim(events: &mut VecDeque<(Instant, Event)>, window: Duration) {
        let cutoff = Instant::now() - window;
        while events.front().is_some_and(|(t, _)| *t < cutoff) {
            events.pop_front();
        }
    }

    /// Provider guard snapshots (uncached; cheap atomic reads).
    pub fn guard_snapshots(&self) -> Vec<GuardSnapshot> {
        self.guards.read().iter().map(|g| g.snapshot()).collect()
    }

    /// Aggregate rollup. Served from cache within `cache_ttl`.
    pub fn rollup(&self) -> KpiRollup {
        {
            let cached = self.cached.lock();
            if let Some((at, rollup)) = cached.as_ref() {
                if at.elapsed() < self.cache_ttl {
                    return rollup.clone();
                }
            }
        }

        let rollup = self.compute_rollup();
        *self.cached.lock() = Some((Instant::now(), rollup.clone()));
        rollup
    }

    fn compute_rollup(&self) -> KpiRollup {
        let mut rollup = KpiRollup::default();

        {
            let mut events = self.events.lock();
            Self::trim(&mut events, self.window);
            for (_, event) in events.iter() {
                match event {
                    Event::TierHit(t) => {
                        *rollup.tier_hits.entry(t.to_string()).or_insert(0) += 1;
                    }
                    Event::TierMiss(t) => {
                        *rollup.tier_misses.entry(t.to_string()).or_insert(0) += 1;
                    }
                    Event::Fallback => rollup.fallbacks_used += 1,
                    Event::ChecksumMismatch => rollup.checksum_mismatches += 1,
                }
            }
        }

        for snap in self.guard_snapshots() {
            rollup.requests += snap.requests;
            rollup.errors += snap.errors;
            rollup.cache_hits += snap.cache_hits;
            rollup.cache_misses += snap.cache_misses;
            rollup.breaker_trips += snap.breaker_trips;
            if snap.breaker != BreakerState::Closed {
                rollup.open_breakers.push(snap.provider);
            }
        }

        rollup.venues = self.venue_health.read().values().cloned().collect();
        rollup
    }
}

impl std::fmt::Debug for KpiTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KpiTracker")
            .field("events", &self.events.lock().len())
            .field("guards", &self.guards.read().len())
            .finish()
    }
}
