// =============================================================================
// Hurst Exponent — rescaled range (R/S) analysis
// =============================================================================
//
// H > 0.55 reads persistent (momentum carries), H ~ 0.50 random walk,
// H < 0.45 mean-reverting. Computed by averaging the R/S statistic over
// non-overlapping chunks at several window sizes, then regressing
// log(R/S) on log(n); the slope is H, clamped to [0, 1].

/// Minimum number of closes for a meaningful estimate.
const MIN_CLOSES: usize = 64;

/// Chunk sizes for the multi-scale R/S sweep.
const WINDOWS: [usize; 4] = [8, 16, 32, 64];

/// Hurst exponent of a price series.
///
/// Returns `None` for fewer than 64 closes, for degenerate (flat) series,
/// or when the log-log regression collapses.
pub fn hurst_exponent(closes: &[f64]) -> Option<f64> {
    if closes.len() < MIN_CLOSES {
        return None;
    }

    let mut points = Vec::with_capacity(WINDOWS.len());

    for &window in &WINDOWS {
        let chunks = closes.len() / window;
        if chunks == 0 {
            continue;
        }

        let mut rs_sum = 0.0;
        let mut valid = 0usize;
        for c in 0..chunks {
            if let Some(rs) = rescaled_range(&closes[c * window..(c + 1) * window]) {
                rs_sum += rs;
                valid += 1;
            }
        }
        if valid == 0 {
            continue;
        }

        points.push(((window as f64).ln(), (rs_sum / valid as f64).ln()));
    }

    if points.len() < 2 {
        return None;
    }

    // OLS slope of log(R/S) on log(n).
    let n = points.len() as f64;
    let x_mean = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let y_mean = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in &points {
        num += (x - x_mean) * (y - y_mean);
        den += (x - x_mean) * (x - x_mean);
    }

    if den.abs() < f64::EPSILON {
        return None;
    }

    let slope = num / den;
    slope.is_finite().then(|| slope.clamp(0.0, 1.0))
}

/// R/S statistic for one chunk: range of cumulative mean deviations over
/// the population standard deviation. `None` for flat chunks.
fn rescaled_range(chunk: &[f64]) -> Option<f64> {
    let n = chunk.len() as f64;
    let mean = chunk.iter().sum::<f64>() / n;

    let variance = chunk.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev < f64::EPSILON {
        return None;
    }

    let mut running = 0.0;
    let mut max_dev = f64::NEG_INFINITY;
    let mut min_dev = f64::INFINITY;
    for &value in chunk {
        running += value - mean;
        max_dev = max_dev.max(running);
        min_dev = min_dev.min(running);
    }

    Some((max_dev - min_dev) / std_dev)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_returns_none() {
        let closes: Vec<f64> = (0..50).map(|i| i as f64).collect();
        assert!(hurst_exponent(&closes).is_none());
    }

    #[test]
    fn flat_series_returns_none() {
        let closes = vec![100.0; 128];
        assert!(hurst_exponent(&closes).is_none());
    }

    #[test]
    fn trending_series_is_persistent() {
        let closes: Vec<f64> = (0..128).map(|i| 100.0 + i as f64).collect();
        let h = hurst_exponent(&closes).unwrap();
        assert!(h > 0.55, "monotone trend should be persistent, got {h}");
    }

    #[test]
    fn oscillating_series_is_anti_persistent() {
        // Tight alternation around a level reverts every bar.
        let closes: Vec<f64> = (0..128)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let h = hurst_exponent(&closes).unwrap();
        assert!(h < 0.45, "alternating series should mean-revert, got {h}");
    }

    #[test]
    fn result_is_clamped() {
        let closes: Vec<f64> = (0..256).map(|i| (i as f64).powi(2)).collect();
        let h = hurst_exponent(&closes).unwrap();
        assert!((0.0..=1.0).contains(&h));
    }
}
