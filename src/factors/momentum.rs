// =============================================================================
// Raw factor computation — momentum timeframes + technical/volume/quality
// =============================================================================
//
// Momentum is a weighted blend of returns at four timeframes:
//
//   1h: 20%   4h: 35%   12h: 30%   24h: 15%
//
// The remaining raw factors:
//   technical — RSI(14) residual, centered at 50 and scaled to roughly ±10
//   volume    — log-normalized 24h volume multiple vs the trailing week
//   quality   — liquidity composite from venue-native depth and spread
//   social    — injected sentiment, neutral 0.0 without a provider

use chrono::Utc;
use tracing::trace;

use crate::data::{BookTop, Ohlc};
use crate::factors::{FactorMetadata, FactorSet, SocialProvider};
use crate::indicators::{adx::adx, atr::atr, hurst::hurst_exponent, rsi::rsi};

/// Momentum timeframe weights, in hours.
const MOMENTUM_WEIGHTS: [(usize, f64); 4] = [(1, 0.20), (4, 0.35), (12, 0.30), (24, 0.15)];

/// Minimum hourly bars to compute the full momentum blend.
pub const MIN_BARS: usize = 25;

/// Percentage return over the trailing `hours` bars, if enough history.
fn trailing_return(closes: &[f64], hours: usize) -> Option<f64> {
    if closes.len() <= hours {
        return None;
    }
    let now = *closes.last()?;
    let then = closes[closes.len() - 1 - hours];
    (then > 0.0).then(|| (now / then - 1.0) * 100.0)
}

/// Build the raw (pre-orthogonalization) factor set for one symbol.
///
/// `bars_1h` is the hourly history (oldest first), `book` the venue-native
/// top-of-book, `volume_24h_usd` the trailing 24h USD volume. Returns
/// `None` when there is not enough history for the momentum blend.
pub fn compute_factors(
    symbol: &str,
    bars_1h: &[Ohlc],
    book: &BookTop,
    volume_24h_usd: f64,
    social: Option<&dyn SocialProvider>,
) -> Option<FactorSet> {
    if bars_1h.len() < MIN_BARS {
        trace!(symbol, bars = bars_1h.len(), "insufficient history for factors");
        return None;
    }

    let closes: Vec<f64> = bars_1h.iter().map(|b| b.close).collect();

    // --- Momentum blend ------------------------------------------------------
    let mut momentum_core = 0.0;
    for (hours, weight) in MOMENTUM_WEIGHTS {
        momentum_core += weight * trailing_return(&closes, hours)?;
    }

    // --- Technical: RSI residual --------------------------------------------
    let rsi_1h = rsi(&closes, 14)?;
    let technical = (rsi_1h - 50.0) / 5.0;

    // --- Volume: log-normalized 24h multiple ---------------------------------
    let window = bars_1h.len().min(168); // trailing week of hourly bars
    let avg_hourly: f64 =
        bars_1h[bars_1h.len() - window..].iter().map(|b| b.volume).sum::<f64>() / window as f64;
    let last_close = closes.last().copied().unwrap_or(0.0);
    let avg_24h_usd = avg_hourly * 24.0 * last_close;
    let volume_ratio_24h = if avg_24h_usd > 0.0 {
        volume_24h_usd / avg_24h_usd
    } else {
        0.0
    };
    let volume = volume_ratio_24h.ln_1p() * 5.0;

    // --- Quality: venue-native liquidity composite ---------------------------
    let depth_score = (book.depth_usd() / 1_000_000.0).min(1.0) * 5.0;
    let spread_score = ((50.0 - book.spread_bps()).max(0.0) / 50.0) * 5.0;
    let quality = depth_score + spread_score;

    // --- Social: injected or documented neutral ------------------------------
    let social_value = social
        .and_then(|p| p.social_score(symbol))
        .unwrap_or(0.0);

    // --- Gate inputs ---------------------------------------------------------
    let r4_now = trailing_return(&closes, 4).unwrap_or(0.0);
    let r4_prev = if closes.len() >= 9 {
        trailing_return(&closes[..closes.len() - 4], 4).unwrap_or(0.0)
    } else {
        0.0
    };

    // 4h RSI from hourly closes sampled every 4th bar.
    let closes_4h: Vec<f64> = closes
        .iter()
        .rev()
        .step_by(4)
        .copied()
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let rsi_4h = rsi(&closes_4h, 14).or_else(|| rsi(&closes_4h, 6)).unwrap_or(50.0);

    let metadata = FactorMetadata {
        return_24h: trailing_return(&closes, 24).unwrap_or(0.0),
        rsi_4h,
        acceleration: r4_now - r4_prev,
        volume_ratio_24h,
        atr_1h: atr(bars_1h, 14).unwrap_or(0.0),
        adx: adx(bars_1h, 14),
        hurst: hurst_exponent(&closes),
    };

    let set = FactorSet {
        symbol: symbol.to_string(),
        timestamp: bars_1h.last().map(|b| b.timestamp).unwrap_or_else(Utc::now),
        momentum_core,
        technical,
        volume,
        quality,
        social: social_value,
        metadata,
    };

    set.is_valid().then_some(set)
}
