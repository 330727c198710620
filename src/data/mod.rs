// =============================================================================
// Market-data transport types — Envelope, tiers, provenance
// =============================================================================
//
// The Envelope is the unit of market-data transport between the facade and
// the scan pipeline. It is created on fetch, mutated only by the facade
// (tier, provenance, freshness), consumed by the pipeline, then dropped.
//
// Invariants:
//   - timestamp <= now at read time
//   - freshness_ms is recomputed on every hand-off
//   - tier downgrades only go hot -> warm -> cold within one request
//   - fallback_chain is append-only within a request

pub mod cold;
pub mod facade;
pub mod hot;
pub mod warm;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// =============================================================================
// Tiers
// =============================================================================

/// Data-source tier, ordered hot > warm > cold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hot => write!(f, "hot"),
            Self::Warm => write!(f, "warm"),
            Self::Cold => write!(f, "cold"),
        }
    }
}

/// Payload type requested through the facade; part of cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Price,
    OrderBook,
    Historical,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Price => write!(f, "price"),
            Self::OrderBook => write!(f, "order_book"),
            Self::Historical => write!(f, "historical"),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Top-of-book snapshot with depth aggregated within 2% of mid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookTop {
    pub best_bid: f64,
    pub best_ask: f64,
    /// USD notional resting within 2% of mid on the bid side.
    pub bid_depth_usd: f64,
    /// USD notional resting within 2% of mid on the ask side.
    pub ask_depth_usd: f64,
    pub last_update: DateTime<Utc>,
}

impl BookTop {
    pub fn mid(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }

    /// Spread in basis points relative to mid. Zero when the book is empty.
    pub fn spread_bps(&self) -> f64 {
        let mid = self.mid();
        if mid > 0.0 {
            ((self.best_ask - self.best_bid) / mid) * 10_000.0
        } else {
            0.0
        }
    }

    /// Total two-sided depth within 2% of mid, in USD.
    pub fn depth_usd(&self) -> f64 {
        self.bid_depth_usd + self.ask_depth_usd
    }
}

/// The tier-independent payload carried by an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Latest bar plus 24h aggregates for the factor pipeline.
    Price {
        bar: Ohlc,
        volume_24h_usd: f64,
    },
    OrderBook(BookTop),
    /// Historical bars, oldest first.
    Historical(Vec<Ohlc>),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Price { .. } => PayloadKind::Price,
            Self::OrderBook(_) => PayloadKind::OrderBook,
            Self::Historical(_) => PayloadKind::Historical,
        }
    }
}

// =============================================================================
// Provenance + Envelope
// =============================================================================

/// Where an envelope's payload actually came from, for audit and replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub original_source: String,
    pub retrieved_at: DateTime<Utc>,
    /// Confidence in the payload, degraded by tier: hot 1.0, warm 0.9,
    /// cold 0.8.
    pub confidence_score: f64,
    pub cache_hit: bool,
    /// Tiers tried in order within this request. Append-only.
    pub fallback_chain: Vec<Tier>,
}

/// The unit of market-data transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub symbol: String,
    pub venue: String,
    pub timestamp: DateTime<Utc>,
    pub source_tier: Tier,
    pub payload: Payload,
    pub freshness_ms: i64,
    /// sha256 hex over the canonical JSON of the semantic payload.
    pub checksum: String,
    pub provenance: Provenance,
}

impl Envelope {
    /// Build an envelope for a freshly fetched payload. Freshness and
    /// checksum are computed here; the facade appends the fallback chain.
    pub fn new(
        symbol: impl Into<String>,
        venue: impl Into<String>,
        timestamp: DateTime<Utc>,
        tier: Tier,
        payload: Payload,
        source: impl Into<String>,
        cache_hit: bool,
    ) -> Self {
        let now = Utc::now();
        let checksum = payload_checksum(&payload);
        let confidence = match tier {
            Tier::Hot => 1.0,
            Tier::Warm => 0.9,
            Tier::Cold => 0.8,
        };

        Self {
            symbol: symbol.into(),
            venue: venue.into(),
            timestamp,
            source_tier: tier,
            payload,
            freshness_ms: (now - timestamp).num_milliseconds().max(0),
            checksum,
            provenance: Provenance {
                original_source: source.into(),
                retrieved_at: now,
                confidence_score: confidence,
                cache_hit,
                fallback_chain: Vec::new(),
            },
        }
    }

    /// Recompute `freshness_ms` against the wall clock. Mandatory on every
    /// hand-off between components.
    pub fn touch(&mut self) {
        self.freshness_ms = (Utc::now() - self.timestamp).num_milliseconds().max(0);
    }

    /// Verify the stored checksum still matches the payload.
    pub fn checksum_ok(&self) -> bool {
        payload_checksum(&self.payload) == self.checksum
    }
}

/// sha256 hex digest over the payload's canonical JSON. serde_json emits
/// map keys sorted, so the digest is stable for identical semantic content.
pub fn payload_checksum(payload: &Payload) -> String {
    let json = serde_json::to_string(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}
