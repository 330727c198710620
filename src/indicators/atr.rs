// =============================================================================
// Average True Range — Wilder's smoothing
// =============================================================================
//
// True Range per bar: TR = max(H - L, |H - prevClose|, |L - prevClose|).
// ATR seeds with the SMA of the first `period` TR values, then applies
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period

use crate::data::Ohlc;

/// Latest ATR for `bars` (oldest first) with the given `period`.
///
/// Returns `None` when `period == 0`, when fewer than `period + 1` bars are
/// supplied (each TR needs a previous close), or on non-finite input.
pub fn atr(bars: &[Ohlc], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut true_ranges = Vec::with_capacity(bars.len() - 1);
    for pair in bars.windows(2) {
        let prev_close = pair[0].close;
        let bar = &pair[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        true_ranges.push(tr);
    }

    let period_f = period as f64;
    let mut value: f64 = true_ranges[..period].iter().sum::<f64>() / period_f;
    for &tr in &true_ranges[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
    }

    value.is_finite().then_some(value)
}

/// ATR as a percentage of the latest close; comparable across assets with
/// different price scales.
pub fn atr_pct(bars: &[Ohlc], period: usize) -> Option<f64> {
    let value = atr(bars, period)?;
    let close = bars.last()?.close;
    (close > 0.0).then(|| (value / close) * 100.0)
}
