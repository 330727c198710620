// =============================================================================
// Portfolio Pruner — greedy accept under correlation/sector/beta/exposure caps
// =============================================================================
//
// Gate-passed candidates are visited in score order (ties: symbol) and
// accepted only while every constraint still holds:
//
//   (a) pairwise correlation with every accepted symbol <= cap
//   (b) sector position count below the sector's cap
//   (c) Σ|β_btc| within the beta budget
//   (d) single-position and total-exposure caps
//
// The first violated constraint becomes the rejection reason, so every
// rejection is explainable. The pass is greedy and deterministic: identical
// inputs and correlation provider produce identical accepted sets. O(N·K)
// in the accepted-set size K.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PortfolioConfig;

/// Pairwise correlation source, injected so tests and backtests control it.
/// Implementations must be symmetric with self-correlation 1.0.
pub trait CorrelationProvider: Send + Sync {
    fn correlation(&self, a: &str, b: &str) -> f64;
}

/// Static correlation matrix backed by a map; missing pairs read 0.
#[derive(Debug, Default)]
pub struct StaticCorrelations {
    pairs: HashMap<(String, String), f64>,
}

impl StaticCorrelations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, a: &str, b: &str, value: f64) {
        let key = Self::key(a, b);
        self.pairs.insert(key, value);
    }

    fn key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }
}

impl CorrelationProvider for StaticCorrelations {
    fn correlation(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        self.pairs.get(&Self::key(a, b)).copied().unwrap_or(0.0)
    }
}

/// Correlations computed from per-symbol return series collected during the
/// tick. Also derives beta-to-BTC for the pruner.
#[derive(Debug, Default)]
pub struct ReturnsCorrelations {
    returns: HashMap<String, Vec<f64>>,
}

impl ReturnsCorrelations {
    /// Build from close-price histories (oldest first). Series shorter than
    /// two closes are ignored.
    pub fn from_closes(histories: &HashMap<String, Vec<f64>>) -> Self {
        let mut returns = HashMap::new();
        for (symbol, closes) in histories {
            if closes.len() < 2 {
                continue;
            }
            let series: Vec<f64> = closes
                .windows(2)
                .filter(|w| w[0] > 0.0)
                .map(|w| (w[1] / w[0]).ln())
                .collect();
            if !series.is_empty() {
                returns.insert(symbol.clone(), series);
            }
        }
        Self { returns }
    }

    fn stats(series: &[f64]) -> (f64, f64) {
        let n = series.len() as f64;
        let mean = series.iter().sum::<f64>() / n;
        let var = series.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt())
    }

    /// β of `symbol` against `benchmark` from the overlapping return tails.
    /// 0.0 when either series is missing or degenerate.
    pub fn beta(&self, symbol: &str, benchmark: &str) -> f64 {
        let (Some(a), Some(b)) = (self.returns.get(symbol), self.returns.get(benchmark)) else {
            return 0.0;
        };
        let n = a.len().min(b.len());
        if n < 8 {
            return 0.0;
        }
        let a = &a[a.len() - n..];
        let b = &b[b.len() - n..];

        let (_, sigma_b) = Self::stats(b);
        if sigma_b < f64::EPSILON {
            return 0.0;
        }
        self.correlation_slices(a, b) * Self::stats(a).1 / sigma_b
    }

    fn correlation_slices(&self, a: &[f64], b: &[f64]) -> f64 {
        let (mean_a, sigma_a) = Self::stats(a);
        let (mean_b, sigma_b) = Self::stats(b);
        if sigma_a < f64::EPSILON || sigma_b < f64::EPSILON {
            return 0.0;
        }
        let n = a.len() as f64;
        let cov = a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - mean_a) * (y - mean_b))
            .sum::<f64>()
            / n;
        (cov / (sigma_a * sigma_b)).clamp(-1.0, 1.0)
    }
}

impl CorrelationProvider for ReturnsCorrelations {
    fn correlation(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let (Some(ra), Some(rb)) = (self.returns.get(a), self.returns.get(b)) else {
            return 0.0;
        };
        let n = ra.len().min(rb.len());
        if n < 8 {
            return 0.0;
        }
        self.correlation_slices(&ra[ra.len() - n..], &rb[rb.len() - n..])
    }
}

/// One gate-passed candidate entering the pruner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrunerCandidate {
    pub symbol: String,
    pub score: f64,
    pub beta_btc: f64,
    pub sector: String,
    pub adv_usd: f64,
    /// Requested position size in exposure units (percent).
    pub position_size_pct: f64,
}

/// Aggregate counts for the decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneSummary {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Rejections grouped by constraint name.
    pub by_constraint: HashMap<String, usize>,
}

/// The pruner's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioDecision {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub rejection_reasons: HashMap<String, String>,
    pub summary: PruneSummary,
}

/// Run the greedy pass.
pub fn prune(
    candidates: &[PrunerCandidate],
    config: &PortfolioConfig,
    correlations: &dyn CorrelationProvider,
) -> PortfolioDecision {
    let mut ordered: Vec<&PrunerCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    let mut accepted: Vec<&PrunerCandidate> = Vec::new();
    let mut rejected = Vec::new();
    let mut rejection_reasons = HashMap::new();
    let mut by_constraint: HashMap<String, usize> = HashMap::new();

    let mut sector_counts: HashMap<&str, usize> = HashMap::new();
    let mut beta_sum = 0.0;
    let mut total_exposure = 0.0;

    for candidate in ordered {
        let verdict = check(
            candidate,
            &accepted,
            &sector_counts,
            beta_sum,
            total_exposure,
            config,
            correlations,
        );

        match verdict {
            Ok(()) => {
                *sector_counts.entry(candidate.sector.as_str()).or_insert(0) += 1;
                beta_sum += candidate.beta_btc.abs();
                total_exposure += candidate.position_size_pct;
                accepted.push(candidate);
            }
            Err(reason) => {
                let constraint = reason
                    .split(':')
                    .next()
                    .unwrap_or("unknown")
                    .to_string();
                *by_constraint.entry(constraint).or_insert(0) += 1;
                rejection_reasons.insert(candidate.symbol.clone(), reason);
                rejected.push(candidate.symbol.clone());
            }
        }
    }

    let decision = PortfolioDecision {
        accepted: accepted.iter().map(|c| c.symbol.clone()).collect(),
        rejected,
        summary: PruneSummary {
            total: candidates.len(),
            accepted: accepted.len(),
            rejected: rejection_reasons.len(),
            by_constraint,
        },
        rejection_reasons,
    };

    debug!(
        total = decision.summary.total,
        accepted = decision.summary.accepted,
        rejected = decision.summary.rejected,
        "portfolio pruned"
    );

    decision
}

/// Constraint checks, in the documented order. The first violation is the
/// rejection reason.
fn check(
    candidate: &PrunerCandidate,
    accepted: &[&PrunerCandidate],
    sector_counts: &HashMap<&str, usize>,
    beta_sum: f64,
    total_exposure: f64,
    config: &PortfolioConfig,
    correlations: &dyn CorrelationProvider,
) -> Result<(), String> {
    // (a) pairwise correlation against every accepted symbol.
    for other in accepted {
        let corr = correlations.correlation(&candidate.symbol, &other.symbol);
        if corr > config.correlation_cap {
            return Err(format!(
                "correlation_cap:{}={:.2}>{:.2}",
                other.symbol, corr, config.correlation_cap
            ));
        }
    }

    // (b) sector cap.
    if let Some(&cap) = config.sector_caps.get(&candidate.sector) {
        let count = sector_counts.get(candidate.sector.as_str()).copied().unwrap_or(0);
        if count >= cap {
            return Err(format!(
                "sector_cap:{}={count}>={cap}",
                candidate.sector
            ));
        }
    }

    // (c) beta budget.
    let new_beta = beta_sum + candidate.beta_btc.abs();
    if new_beta > config.beta_budget {
        return Err(format!(
            "beta_budget:{:.2}+{:.2}>{:.2}",
            beta_sum,
            candidate.beta_btc.abs(),
            config.beta_budget
        ));
    }

    // (d) position and exposure caps.
    if candidate.position_size_pct > config.max_single_position_pct {
        return Err(format!(
            "position_size:{:.1}>{:.1}",
            candidate.position_size_pct, config.max_single_position_pct
        ));
    }
    let new_exposure = total_exposure + candidate.position_size_pct;
    if new_exposure > config.max_total_exposure_pct {
        return Err(format!(
            "exposure_cap:{total_exposure:.1}+{:.1}>{:.1}",
            candidate.position_size_pct, config.max_total_exposure_pct
        ));
    }

    Ok(())
}
