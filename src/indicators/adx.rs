// =============================================================================
// Average Directional Index — trend strength regardless of direction
// =============================================================================
//
// Pipeline: +DM / -DM and TR per bar, Wilder-smoothed over `period`, then
//   +DI = smoothed(+DM) / smoothed(TR) * 100
//   -DI = smoothed(-DM) / smoothed(TR) * 100
//   DX  = |+DI - -DI| / (+DI + -DI) * 100
//   ADX = Wilder-smoothed average of DX.
//
// ADX > 25 reads trending, ADX < 20 ranging.

use crate::data::Ohlc;

/// Latest ADX for `bars` (oldest first).
///
/// Returns `None` when `period == 0`, when fewer than `2 * period + 1` bars
/// are supplied (one period to seed the DM/TR smoothing and another to seed
/// the DX average), or when an intermediate value goes non-finite.
pub fn adx(bars: &[Ohlc], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let transitions = bars.len() - 1;
    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr = Vec::with_capacity(transitions);

    for pair in bars.windows(2) {
        let (prev, bar) = (&pair[0], &pair[1]);

        tr.push(
            (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs()),
        );

        let up = bar.high - prev.high;
        let down = prev.low - bar.low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let period_f = period as f64;
    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr[..period].iter().sum();

    let mut dx_values = vec![dx(smooth_plus, smooth_minus, smooth_tr)?];
    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr[i];
        dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut value: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &d in &dx_values[period..] {
        value = (value * (period_f - 1.0) + d) / period_f;
    }

    value.is_finite().then_some(value)
}

fn dx(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr <= 0.0 {
        return Some(0.0);
    }
    let plus_di = smooth_plus / smooth_tr * 100.0;
    let minus_di = smooth_minus / smooth_tr * 100.0;
    let sum = plus_di + minus_di;
    let value = if sum > 0.0 {
        (plus_di - minus_di).abs() / sum * 100.0
    } else {
        0.0
    };
    value.is_finite().then_some(value)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(high: f64, low: f64, close: f64) -> Ohlc {
        Ohlc {
            timestamp: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn insufficient_data_returns_none() {
        let bars = vec![bar(101.0, 99.0, 100.0); 20];
        assert!(adx(&bars, 14).is_none()); // needs 29
        assert!(adx(&bars, 0).is_none());
    }

    #[test]
    fn strong_uptrend_reads_high() {
        let bars: Vec<Ohlc> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                bar(base + 1.0, base - 1.0, base)
            })
            .collect();
        let value = adx(&bars, 14).unwrap();
        assert!(value > 25.0, "steady trend should read trending, got {value}");
    }

    #[test]
    fn flat_series_reads_low() {
        let bars: Vec<Ohlc> = (0..40).map(|_| bar(100.5, 99.5, 100.0)).collect();
        let value = adx(&bars, 14).unwrap();
        assert!(value < 20.0, "flat series should read ranging, got {value}");
    }

    #[test]
    fn value_in_range() {
        let bars: Vec<Ohlc> = (0..60)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 5.0;
                bar(base + 1.0, base - 1.0, base)
            })
            .collect();
        let value = adx(&bars, 14).unwrap();
        assert!((0.0..=100.0).contains(&value));
    }
}
