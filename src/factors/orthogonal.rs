// =============================================================================
// Gram–Schmidt orthogonalization with a protected factor
// =============================================================================
//
// Runs over the tick's cross-section in the configured order. The first
// factor in the sequence is protected and passes through unchanged; every
// later factor is replaced by its component orthogonal to all previously
// emitted columns:
//
//   residual_i = v_i - Σ_j<i (<v_i, u_j> / <u_j, u_j>) * u_j
//
// Protection is positional (the ordered sequence with one distinguished
// member), not a type property. The social hard cap is applied AFTER the
// pass, outside the projection math, so the residual stays linear in the
// raw factor.

use tracing::debug;

use crate::config::FACTOR_SOCIAL;
use crate::factors::CrossSection;

/// Residualize every non-protected factor against the factors emitted
/// before it, then clamp social to `[-social_cap, +social_cap]`.
///
/// `sequence` must start with the protected factor (validated at startup
/// by the config layer). A cross-section with fewer than two symbols is
/// left untouched apart from the social clamp: a single observation spans
/// every direction, and residualizing it would zero all signals.
pub fn orthogonalize(xs: &mut CrossSection, sequence: &[String], social_cap: f64) {
    if sequence.is_empty() {
        return;
    }

    if xs.len() >= 2 {
        // Emitted columns, in order: protected first, then residuals.
        let mut emitted: Vec<Vec<f64>> = vec![xs.column(&sequence[0])];

        for factor in &sequence[1..] {
            let mut column = xs.column(factor);

            for basis in &emitted {
                let dot = dot(&column, basis);
                let norm = dot_self(basis);
                if norm < f64::EPSILON {
                    continue;
                }
                let coeff = dot / norm;
                for (v, u) in column.iter_mut().zip(basis) {
                    *v -= coeff * u;
                }
            }

            xs.set_column(factor, &column);
            emitted.push(column);
        }

        debug!(
            symbols = xs.len(),
            factors = sequence.len(),
            "cross-section orthogonalized"
        );
    }

    // Social hard cap, applied after the projection pass.
    let capped: Vec<f64> = xs
        .column(FACTOR_SOCIAL)
        .into_iter()
        .map(|v| v.clamp(-social_cap, social_cap))
        .collect();
    xs.set_column(FACTOR_SOCIAL, &capped);
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn dot_self(a: &[f64]) -> f64 {
    a.iter().map(|x| x * x).sum()
}
