// =============================================================================
// Microstructure gate — venue-native spread / depth / VADR
// =============================================================================
//
// All three measures come from venue-native data (the facade's order-book
// envelope and the symbol's own bar history); aggregator feeds are
// forbidden here. Reason codes: SPREAD_TOO_WIDE, INSUFFICIENT_DEPTH,
// LOW_VADR.

use crate::config::EntryLimits;
use crate::data::Ohlc;
use crate::gates::GateEvidence;
use crate::indicators::atr::atr;

/// Venue-native microstructure measurements for one symbol.
#[derive(Debug, Clone)]
pub struct MicroInputs {
    pub spread_bps: f64,
    /// Two-sided USD depth within 2% of mid.
    pub depth_usd: f64,
    pub vadr: f64,
}

/// Volume-adjusted daily range: the 24h range in hourly-ATR units (a day
/// spans ~sqrt(24) hourly ranges under a random walk, so the baseline is
/// ~1.0), scaled by the 24h volume multiple.
///
/// Returns `None` without enough history for the ATR.
pub fn vadr(bars_1h: &[Ohlc], volume_ratio_24h: f64) -> Option<f64> {
    let atr_1h = atr(bars_1h, 14)?;
    if atr_1h <= 0.0 {
        return None;
    }

    let day = &bars_1h[bars_1h.len() - bars_1h.len().min(24)..];
    let high = day.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
    let low = day.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);

    let range_in_atr = (high - low) / (atr_1h * (24.0f64).sqrt());
    Some(range_in_atr * volume_ratio_24h.max(0.0))
}

/// Evaluate the three microstructure checks in order.
pub fn evaluate(inputs: &MicroInputs, limits: &EntryLimits) -> Vec<GateEvidence> {
    let spread = if inputs.spread_bps <= limits.max_spread_bps {
        GateEvidence::pass("spread", inputs.spread_bps, limits.max_spread_bps)
    } else {
        GateEvidence::fail(
            "spread",
            inputs.spread_bps,
            limits.max_spread_bps,
            "SPREAD_TOO_WIDE",
        )
    };

    let depth = if inputs.depth_usd >= limits.min_depth_usd {
        GateEvidence::pass("depth", inputs.depth_usd, limits.min_depth_usd)
    } else {
        GateEvidence::fail(
            "depth",
            inputs.depth_usd,
            limits.min_depth_usd,
            "INSUFFICIENT_DEPTH",
        )
    };

    let vadr_check = if inputs.vadr >= limits.min_vadr {
        GateEvidence::pass("vadr", inputs.vadr, limits.min_vadr)
    } else {
        GateEvidence::fail("vadr", inputs.vadr, limits.min_vadr, "LOW_VADR")
    };

    vec![spread, depth, vadr_check]
}
