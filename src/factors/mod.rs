// =============================================================================
// Factor Pipeline — per-symbol factor sets and the per-tick cross-section
// =============================================================================
//
// A FactorSet is derived per symbol per scan and never persisted. The
// cross-section arena holds the tick's FactorSets in a dense buffer indexed
// by position; the symbol -> index mapping is local to the tick so the
// orthogonalization pass can run column-wise without hashing per element.

pub mod momentum;
pub mod orthogonal;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::config::{
    FACTOR_MOMENTUM, FACTOR_QUALITY, FACTOR_SOCIAL, FACTOR_TECHNICAL, FACTOR_VOLUME,
};

/// Exogenous sentiment source. When none is injected the social factor is a
/// documented neutral 0.0.
pub trait SocialProvider: Send + Sync {
    /// Sentiment score for a symbol, roughly in [-10, +10]. `None` when the
    /// provider has no reading.
    fn social_score(&self, symbol: &str) -> Option<f64>;
}

/// Inputs the gates need later in the scan; carried alongside the factors
/// so they are computed exactly once per symbol per tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactorMetadata {
    /// 24h return in percent.
    pub return_24h: f64,
    /// 4h-timeframe RSI.
    pub rsi_4h: f64,
    /// Momentum acceleration: d(4h return)/dt over the last two 4h spans.
    pub acceleration: f64,
    /// 24h volume over the trailing-week hourly average, as a multiple.
    pub volume_ratio_24h: f64,
    /// ATR over the 1h bars.
    pub atr_1h: f64,
    /// Trend strength (ADX) over the 1h bars, when enough history exists.
    pub adx: Option<f64>,
    /// Trend persistence (Hurst), when enough history exists.
    pub hurst: Option<f64>,
}

/// The factor vector for one symbol at one scan instant.
///
/// `momentum_core` is protected: the orthogonalization pass emits it
/// unchanged. `social` is clamped to the configured hard cap after
/// orthogonalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorSet {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub momentum_core: f64,
    pub technical: f64,
    pub volume: f64,
    pub quality: f64,
    pub social: f64,
    pub metadata: FactorMetadata,
}

impl FactorSet {
    /// A set is invalid if any required field is NaN.
    pub fn is_valid(&self) -> bool {
        self.momentum_core.is_finite()
            && self.technical.is_finite()
            && self.volume.is_finite()
            && self.quality.is_finite()
            && self.social.is_finite()
    }

    /// Factor value by canonical name; unknown names get 0.
    pub fn get(&self, factor: &str) -> f64 {
        match factor {
            FACTOR_MOMENTUM => self.momentum_core,
            FACTOR_TECHNICAL => self.technical,
            FACTOR_VOLUME => self.volume,
            FACTOR_QUALITY => self.quality,
            FACTOR_SOCIAL => self.social,
            _ => 0.0,
        }
    }

    fn set(&mut self, factor: &str, value: f64) {
        match factor {
            FACTOR_MOMENTUM => self.momentum_core = value,
            FACTOR_TECHNICAL => self.technical = value,
            FACTOR_VOLUME => self.volume = value,
            FACTOR_QUALITY => self.quality = value,
            FACTOR_SOCIAL => self.social = value,
            _ => {}
        }
    }
}

/// Dense per-tick buffer of factor sets. Index positions are stable for the
/// lifetime of the tick.
#[derive(Debug, Default)]
pub struct CrossSection {
    sets: Vec<FactorSet>,
}

impl CrossSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a set, dropping invalid (NaN-bearing) ones. Returns the index
    /// when accepted.
    pub fn push(&mut self, set: FactorSet) -> Option<usize> {
        if !set.is_valid() {
            return None;
        }
        self.sets.push(set);
        Some(self.sets.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn sets(&self) -> &[FactorSet] {
        &self.sets
    }

    pub fn sets_mut(&mut self) -> &mut [FactorSet] {
        &mut self.sets
    }

    pub fn into_sets(self) -> Vec<FactorSet> {
        self.sets
    }

    /// One factor as a dense column over the cross-section.
    pub fn column(&self, factor: &str) -> Vec<f64> {
        self.sets.iter().map(|s| s.get(factor)).collect()
    }

    /// Overwrite one factor column from a dense vector.
    pub fn set_column(&mut self, factor: &str, values: &[f64]) {
        debug_assert_eq!(values.len(), self.sets.len());
        for (set, &value) in self.sets.iter_mut().zip(values) {
            set.set(factor, value);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn set(symbol: &str, momentum: f64) -> FactorSet {
        FactorSet {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            momentum_core: momentum,
            technical: 1.0,
            volume: 2.0,
            quality: 3.0,
            social: 0.5,
            metadata: FactorMetadata::default(),
        }
    }

    #[test]
    fn nan_set_is_invalid_and_dropped() {
        let mut xs = CrossSection::new();
        let mut bad = set("BTCUSD", 5.0);
        bad.technical = f64::NAN;
        assert!(!bad.is_valid());
        assert!(xs.push(bad).is_none());
        assert!(xs.is_empty());
    }

    #[test]
    fn columns_roundtrip() {
        let mut xs = CrossSection::new();
        xs.push(set("BTCUSD", 5.0)).unwrap();
        xs.push(set("ETHUSD", 3.0)).unwrap();

        assert_eq!(xs.column(FACTOR_MOMENTUM), vec![5.0, 3.0]);

        xs.set_column(FACTOR_TECHNICAL, &[7.0, 8.0]);
        assert_eq!(xs.column(FACTOR_TECHNICAL), vec![7.0, 8.0]);
        assert_eq!(xs.sets()[1].technical, 8.0);
    }

    #[test]
    fn get_unknown_factor_is_zero() {
        let s = set("BTCUSD", 5.0);
        assert_eq!(s.get("nonsense"), 0.0);
    }
}
