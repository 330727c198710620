// =============================================================================
// Regime Detector — calm / normal / volatile with hysteretic transitions
// =============================================================================
//
// Classifies the market from three universe-wide measures:
//
//   1. Rolling 7-day realized volatility (annualized, percent).
//   2. Breadth thrust: advance/decline ratio blended with the up/down
//      volume ratio and the new-highs/new-lows balance.
//   3. Fraction of the universe trading above its 20-period MA.
//
// Rules (evaluated top to bottom; first match wins):
//
//   VOLATILE — realized vol >= 85%, or a breadth thrust >= 1.8 on top of
//              elevated vol (>= 65%)
//   CALM     — realized vol <= 45% AND breadth thrust <= 1.2
//   NORMAL   — everything else
//
// The chosen regime selects the scoring weight vector. Transitions are
// hysteretic: a change must be observed on two consecutive classifications
// before the published state flips, so a single noisy tick never swaps the
// weight vector. The state is swapped atomically; readers see either the
// old or the new vector, never a partial one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::Ohlc;

/// Volatility floor for the VOLATILE classification (annualized percent).
const VOL_HIGH: f64 = 85.0;
/// Volatility level above which a breadth thrust escalates to VOLATILE.
const VOL_ELEVATED: f64 = 65.0;
/// Volatility ceiling for the CALM classification.
const VOL_LOW: f64 = 45.0;
/// Breadth thrust ceiling for CALM / floor for thrust-driven VOLATILE.
const THRUST_QUIET: f64 = 1.2;
const THRUST_SPIKE: f64 = 1.8;

// =============================================================================
// Types
// =============================================================================

/// Discrete market state selecting a weight vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRegime {
    Calm,
    Normal,
    Volatile,
}

impl MarketRegime {
    /// The key into the configured weight-vector map.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calm => "calm",
            Self::Normal => "normal",
            Self::Volatile => "volatile",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Universe-wide measures feeding one classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeInputs {
    /// Annualized 7-day realized volatility, percent.
    pub realized_vol_7d: f64,
    /// Breadth thrust (1.0 is balanced; higher means broad participation).
    pub breadth_thrust: f64,
    /// Fraction of the universe above its 20-period MA, in [0, 1].
    pub pct_above_ma: f64,
}

impl RegimeInputs {
    /// Derive the inputs from per-symbol hourly histories (oldest first).
    pub fn from_universe(histories: &[&[Ohlc]]) -> Option<Self> {
        const WEEK_HOURS: usize = 168;

        let mut vol_sum = 0.0;
        let mut vol_count = 0usize;
        let mut advancers = 0usize;
        let mut decliners = 0usize;
        let mut up_volume = 0.0;
        let mut down_volume = 0.0;
        let mut new_highs = 0usize;
        let mut new_lows = 0usize;
        let mut above_ma = 0usize;
        let mut ma_count = 0usize;

        for bars in histories {
            if bars.len() < 21 {
                continue;
            }

            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            let last = *closes.last()?;

            // Realized vol from hourly log returns over the trailing week.
            let window = closes.len().min(WEEK_HOURS);
            let slice = &closes[closes.len() - window..];
            let returns: Vec<f64> = slice
                .windows(2)
                .filter(|w| w[0] > 0.0)
                .map(|w| (w[1] / w[0]).ln())
                .collect();
            if returns.len() >= 24 {
                let mean = returns.iter().sum::<f64>() / returns.len() as f64;
                let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                    / returns.len() as f64;
                // Hourly sigma annualized.
                vol_sum += var.sqrt() * (24.0 * 365.0f64).sqrt() * 100.0;
                vol_count += 1;
            }

            // Advance/decline + volume split over the last 24 bars.
            let day = &bars[bars.len() - bars.len().min(24)..];
            let (first, last_bar) = (day.first()?, day.last()?);
            if last_bar.close >= first.close {
                advancers += 1;
                up_volume += day.iter().map(|b| b.volume * b.close).sum::<f64>();
            } else {
                decliners += 1;
                down_volume += day.iter().map(|b| b.volume * b.close).sum::<f64>();
            }

            // New highs/lows against the trailing week.
            let week = &closes[closes.len() - window..];
            let week_high = week.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let week_low = week.iter().cloned().fold(f64::INFINITY, f64::min);
            if last >= week_high {
                new_highs += 1;
            }
            if last <= week_low {
                new_lows += 1;
            }

            // 20-period MA.
            let ma20 = closes[closes.len() - 20..].iter().sum::<f64>() / 20.0;
            if last > ma20 {
                above_ma += 1;
            }
            ma_count += 1;
        }

        if vol_count == 0 || ma_count == 0 {
            return None;
        }

        let ad_ratio = (advancers as f64 + 1.0) / (decliners as f64 + 1.0);
        let volume_ratio = (up_volume + 1.0) / (down_volume + 1.0);
        let hl_ratio = (new_highs as f64 + 1.0) / (new_lows as f64 + 1.0);
        let breadth_thrust = (ad_ratio * volume_ratio * hl_ratio).powf(1.0 / 3.0);

        Some(Self {
            realized_vol_7d: vol_sum / vol_count as f64,
            breadth_thrust,
            pct_above_ma: above_ma as f64 / ma_count as f64,
        })
    }
}

/// Published regime state. Swapped atomically after the hysteresis check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: MarketRegime,
    pub confidence: f64,
    pub inputs: RegimeInputs,
    /// When the current regime was first published.
    pub since: DateTime<Utc>,
}

// =============================================================================
// Classification
// =============================================================================

/// Classify one observation. Pure; hysteresis lives in the detector.
fn classify(inputs: &RegimeInputs) -> (MarketRegime, f64) {
    let vol = inputs.realized_vol_7d;
    let thrust = inputs.breadth_thrust;

    if vol >= VOL_HIGH {
        return (MarketRegime::Volatile, remap(vol, VOL_HIGH, 150.0, 0.65, 1.0));
    }

    if thrust >= THRUST_SPIKE && vol >= VOL_ELEVATED {
        let thrust_conf = remap(thrust, THRUST_SPIKE, 3.0, 0.55, 1.0);
        let vol_conf = remap(vol, VOL_ELEVATED, VOL_HIGH, 0.55, 1.0);
        return (MarketRegime::Volatile, (thrust_conf + vol_conf) / 2.0);
    }

    if vol <= VOL_LOW && thrust <= THRUST_QUIET {
        let vol_conf = remap(vol, VOL_LOW, 15.0, 0.55, 1.0);
        let thrust_conf = remap(thrust, THRUST_QUIET, 0.8, 0.55, 1.0);
        return (MarketRegime::Calm, (vol_conf + thrust_conf) / 2.0);
    }

    // NORMAL: confidence peaks mid-band, fades toward either boundary.
    let mid = (VOL_LOW + VOL_HIGH) / 2.0;
    let confidence = remap((vol - mid).abs(), (VOL_HIGH - VOL_LOW) / 2.0, 0.0, 0.40, 0.90);
    (MarketRegime::Normal, confidence)
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`,
/// clamped to the output range. Works with inverted input ranges.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    out_lo + t.clamp(0.0, 1.0) * (out_hi - out_lo)
}

// =============================================================================
// RegimeDetector
// =============================================================================

/// Thread-safe detector with two-tick hysteresis.
pub struct RegimeDetector {
    state: RwLock<RegimeState>,
    /// A pending regime change and how many consecutive times it has been
    /// observed.
    pending: RwLock<Option<(MarketRegime, u32)>>,
}

/// Consecutive observations required before a regime change is published.
const CONFIRMATIONS_REQUIRED: u32 = 2;

impl RegimeDetector {
    /// Start in NORMAL with neutral inputs.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(RegimeState {
                regime: MarketRegime::Normal,
                confidence: 0.5,
                inputs: RegimeInputs {
                    realized_vol_7d: 60.0,
                    breadth_thrust: 1.0,
                    pct_above_ma: 0.5,
                },
                since: Utc::now(),
            }),
            pending: RwLock::new(None),
        })
    }

    /// Feed one observation. Returns the published state after hysteresis.
    pub fn update(&self, inputs: RegimeInputs) -> RegimeState {
        let (candidate, confidence) = classify(&inputs);
        let current = self.state.read().regime;

        if candidate == current {
            *self.pending.write() = None;
            let mut state = self.state.write();
            state.confidence = confidence;
            state.inputs = inputs;
            return state.clone();
        }

        // Candidate differs: count consecutive observations.
        let confirmations = {
            let mut pending = self.pending.write();
            match pending.as_mut() {
                Some((regime, count)) if *regime == candidate => {
                    *count += 1;
                    *count
                }
                _ => {
                    *pending = Some((candidate, 1));
                    1
                }
            }
        };

        if confirmations >= CONFIRMATIONS_REQUIRED {
            *self.pending.write() = None;
            let new_state = RegimeState {
                regime: candidate,
                confidence,
                inputs,
                since: Utc::now(),
            };
            info!(
                from = %current,
                to = %candidate,
                confidence = format!("{confidence:.2}"),
                "regime change published"
            );
            *self.state.write() = new_state.clone();
            new_state
        } else {
            debug!(
                current = %current,
                candidate = %candidate,
                confirmations,
                required = CONFIRMATIONS_REQUIRED,
                "regime change pending hysteresis"
            );
            self.state.read().clone()
        }
    }

    /// Latest published state without reclassifying.
    pub fn current(&self) -> RegimeState {
        self.state.read().clone()
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self {
            state: RwLock::new(RegimeState {
                regime: MarketRegime::Normal,
                confidence: 0.5,
                inputs: RegimeInputs {
                    realized_vol_7d: 60.0,
                    breadth_thrust: 1.0,
                    pct_above_ma: 0.5,
                },
                since: Utc::now(),
            }),
            pending: RwLock::new(None),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(vol: f64, thrust: f64) -> RegimeInputs {
        RegimeInputs {
            realized_vol_7d: vol,
            breadth_thrust: thrust,
            pct_above_ma: 0.5,
        }
    }

    #[test]
    fn classify_volatile_on_high_vol() {
        let (regime, conf) = classify(&inputs(120.0, 1.0));
        assert_eq!(regime, MarketRegime::Volatile);
        assert!(conf > 0.65);
    }

    #[test]
    fn classify_volatile_on_thrust_spike() {
        let (regime, _) = classify(&inputs(70.0, 2.2));
        assert_eq!(regime, MarketRegime::Volatile);
    }

    #[test]
    fn classify_calm_needs_low_vol_and_quiet_breadth() {
        let (regime, _) = classify(&inputs(30.0, 1.0));
        assert_eq!(regime, MarketRegime::Calm);

        // Low vol but noisy breadth is NORMAL, not calm.
        let (regime, _) = classify(&inputs(30.0, 1.6));
        assert_eq!(regime, MarketRegime::Normal);
    }

    #[test]
    fn classify_normal_between_bands() {
        let (regime, _) = classify(&inputs(60.0, 1.3));
        assert_eq!(regime, MarketRegime::Normal);
    }

    #[test]
    fn hysteresis_requires_two_consecutive_observations() {
        let detector = RegimeDetector::new();
        assert_eq!(detector.current().regime, MarketRegime::Normal);

        // One volatile observation is not enough.
        let state = detector.update(inputs(120.0, 1.0));
        assert_eq!(state.regime, MarketRegime::Normal);

        // Second consecutive observation flips the state.
        let state = detector.update(inputs(120.0, 1.0));
        assert_eq!(state.regime, MarketRegime::Volatile);
    }

    #[test]
    fn interrupted_streak_resets_hysteresis() {
        let detector = RegimeDetector::new();

        detector.update(inputs(120.0, 1.0)); // volatile (pending 1)
        detector.update(inputs(60.0, 1.3)); // back to normal, streak broken
        let state = detector.update(inputs(120.0, 1.0)); // volatile (pending 1 again)
        assert_eq!(state.regime, MarketRegime::Normal);

        let state = detector.update(inputs(120.0, 1.0));
        assert_eq!(state.regime, MarketRegime::Volatile);
    }

    #[test]
    fn same_regime_updates_confidence_without_pending() {
        let detector = RegimeDetector::new();
        let first = detector.update(inputs(60.0, 1.3));
        let second = detector.update(inputs(50.0, 1.3));
        assert_eq!(first.regime, MarketRegime::Normal);
        assert_eq!(second.regime, MarketRegime::Normal);
        assert!(second.inputs.realized_vol_7d < first.inputs.realized_vol_7d);
    }

    #[test]
    fn regime_keys_match_config_weight_map() {
        let cfg = crate::config::ScanConfig::default();
        for regime in [MarketRegime::Calm, MarketRegime::Normal, MarketRegime::Volatile] {
            assert!(
                cfg.weights.regimes.contains_key(regime.as_str()),
                "missing weight vector for {regime}"
            );
        }
    }

    #[test]
    fn inputs_from_universe_trending_market() {
        use chrono::Duration;
        let start = Utc::now() - Duration::hours(200);
        let mk = |drift: f64| -> Vec<Ohlc> {
            (0..200)
                .map(|i| {
                    let close = 100.0 + i as f64 * drift + ((i * 7) % 13) as f64 * 0.2;
                    Ohlc {
                        timestamp: start + Duration::hours(i as i64),
                        open: close,
                        high: close + 0.5,
                        low: close - 0.5,
                        close,
                        volume: 1_000.0,
                    }
                })
                .collect()
        };

        let a = mk(0.5);
        let b = mk(0.4);
        let slices: Vec<&[Ohlc]> = vec![&a, &b];
        let inputs = RegimeInputs::from_universe(&slices).unwrap();

        assert!(inputs.pct_above_ma > 0.9, "trending market sits above MA");
        assert!(inputs.breadth_thrust > 1.0, "all advancers");
        assert!(inputs.realized_vol_7d > 0.0);
    }

    #[test]
    fn inputs_from_universe_insufficient_history() {
        let a: Vec<Ohlc> = Vec::new();
        let slices: Vec<&[Ohlc]> = vec![&a];
        assert!(RegimeInputs::from_universe(&slices).is_none());
    }
}
