// =============================================================================
// Relative Strength Index — Wilder's smoothing
// =============================================================================
//
// RSI = 100 - 100 / (1 + RS), where RS is the ratio of Wilder-smoothed
// average gain to average loss. The averages are seeded with the SMA of the
// first `period` deltas, then updated as
//
//   avg = (prev_avg * (period - 1) + current) / period
//
// RSI > 70 reads overbought, RSI < 30 oversold.

/// Latest RSI value for `closes` with the given `period`.
///
/// Returns `None` when `period == 0`, when fewer than `period + 1` closes
/// are supplied, or when the computation goes non-finite.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let period_f = period as f64;
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    // Seed with the SMA of the first `period` deltas.
    for w in closes[..=period].windows(2) {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    avg_gain /= period_f;
    avg_loss /= period_f;

    // Wilder's smoothing over the remainder.
    for w in closes[period..].windows(2) {
        let delta = w[1] - w[0];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    value.is_finite().then_some(value)
}
