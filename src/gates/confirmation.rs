// =============================================================================
// 2-of-3 Confirmation gate — funding / whale / supply-squeeze
// =============================================================================
//
// Three independent confirmation legs, counted independently but ranked by
// strict precedence weights:
//
//   funding divergence   precedence 3.0   z-score >= threshold (default 2σ)
//   whale composite      precedence 2.0   composite >= 0.70
//   supply-squeeze proxy precedence 1.0   4-component score >= 0.60
//
// The supply proxy's components (each worth 0.25):
//   reserve depletion   Δreserves_7d <= -5%
//   large withdrawals   withdrawals_24h >= $50M
//   staking inflow      staking_24h >= $10M
//   derivatives OI      ΔOI >= +15%
//
// Volume boost: in the configured regimes (default: volatile only), a 24h
// volume ratio at or above the confirmation threshold (default 2.5×)
// lowers the required count from 2 to 1 and records `volume_boost = true`.
// The precedence score is the sum of the passed legs' weights and ranks
// otherwise-tied candidates.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfirmationConfig;
use crate::gates::GateEvidence;

pub const PRECEDENCE_FUNDING: f64 = 3.0;
pub const PRECEDENCE_WHALE: f64 = 2.0;
pub const PRECEDENCE_SUPPLY: f64 = 1.0;

/// Raw inputs to the supply-squeeze proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupplyInputs {
    /// Exchange reserve change over 7 days, percent (negative = depletion).
    pub reserve_change_7d_pct: f64,
    pub withdrawals_24h_usd: f64,
    pub staking_inflow_24h_usd: f64,
    /// Derivatives open-interest change over 24h, percent.
    pub oi_change_24h_pct: f64,
}

/// Inputs to the full confirmation gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmationInputs {
    /// Funding-rate divergence as a z-score against its trailing window.
    pub funding_z: f64,
    /// Pre-aggregated whale activity composite in [0, 1].
    pub whale_composite: f64,
    pub supply: SupplyInputs,
    pub volume_ratio_24h: f64,
}

/// Per-component breakdown of the supply-squeeze proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyBreakdown {
    pub components: Vec<GateEvidence>,
    pub component_count: usize,
    pub score: f64,
}

/// Result of the 2-of-3 gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationResult {
    pub passed: bool,
    pub confirmation_count: usize,
    pub required_count: usize,
    pub passed_gates: Vec<String>,
    pub failed_gates: Vec<String>,
    pub precedence_score: f64,
    pub supply_breakdown: SupplyBreakdown,
    pub volume_boost: bool,
    /// Microstructure evidence snapshot carried for the audit trail.
    pub micro_report: Vec<GateEvidence>,
}

/// Funding divergence as a z-score: how far the current funding rate sits
/// from its trailing-window mean, in standard deviations. `None` for
/// windows under 8 samples or degenerate (zero-variance) history.
pub fn funding_zscore(history: &[f64], current: f64) -> Option<f64> {
    if history.len() < 8 {
        return None;
    }
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let var = history.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let sigma = var.sqrt();
    if sigma < f64::EPSILON {
        return None;
    }
    let z = (current - mean) / sigma;
    z.is_finite().then_some(z)
}

/// Score the supply-squeeze proxy: each satisfied component adds 0.25.
fn supply_proxy(inputs: &SupplyInputs) -> SupplyBreakdown {
    let checks = [
        (
            "reserve_depletion",
            inputs.reserve_change_7d_pct,
            -5.0,
            inputs.reserve_change_7d_pct <= -5.0,
        ),
        (
            "large_withdrawals",
            inputs.withdrawals_24h_usd,
            50_000_000.0,
            inputs.withdrawals_24h_usd >= 50_000_000.0,
        ),
        (
            "staking_inflow",
            inputs.staking_inflow_24h_usd,
            10_000_000.0,
            inputs.staking_inflow_24h_usd >= 10_000_000.0,
        ),
        (
            "oi_change",
            inputs.oi_change_24h_pct,
            15.0,
            inputs.oi_change_24h_pct >= 15.0,
        ),
    ];

    let mut components = Vec::with_capacity(4);
    let mut count = 0usize;
    for (name, measured, threshold, ok) in checks {
        if ok {
            count += 1;
            components.push(GateEvidence::pass(name, measured, threshold));
        } else {
            components.push(GateEvidence::fail(
                name,
                measured,
                threshold,
                format!("{}_NOT_MET", name.to_uppercase()),
            ));
        }
    }

    SupplyBreakdown {
        components,
        component_count: count,
        score: count as f64 * 0.25,
    }
}

/// Evaluate the 2-of-3 gate for `regime` (the label is matched against the
/// configured volume-boost regimes).
pub fn evaluate(
    inputs: &ConfirmationInputs,
    config: &ConfirmationConfig,
    regime: &str,
    micro_report: &[GateEvidence],
) -> ConfirmationResult {
    let supply_breakdown = supply_proxy(&inputs.supply);

    let legs = [
        (
            "funding_divergence",
            inputs.funding_z >= config.funding_divergence_threshold,
            PRECEDENCE_FUNDING,
        ),
        (
            "whale_composite",
            inputs.whale_composite >= config.whale_composite_threshold,
            PRECEDENCE_WHALE,
        ),
        (
            "supply_squeeze",
            supply_breakdown.score >= config.supply_squeeze_threshold,
            PRECEDENCE_SUPPLY,
        ),
    ];

    let mut passed_gates = Vec::new();
    let mut failed_gates = Vec::new();
    let mut precedence_score = 0.0;
    for (name, ok, weight) in legs {
        if ok {
            passed_gates.push(name.to_string());
            precedence_score += weight;
        } else {
            failed_gates.push(name.to_string());
        }
    }

    let boost_eligible = config
        .volume_boost_regimes
        .iter()
        .any(|r| r == regime);
    let volume_boost =
        boost_eligible && inputs.volume_ratio_24h >= config.volume_confirmation_threshold;
    let required_count = if volume_boost { 1 } else { 2 };

    let confirmation_count = passed_gates.len();
    let passed = confirmation_count >= required_count;

    debug!(
        regime,
        confirmation_count,
        required_count,
        volume_boost,
        precedence_score,
        "confirmation gate evaluated"
    );

    ConfirmationResult {
        passed,
        confirmation_count,
        required_count,
        passed_gates,
        failed_gates,
        precedence_score,
        supply_breakdown,
        volume_boost,
        micro_report: micro_report.to_vec(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(funding_z: f64, whale: f64) -> ConfirmationInputs {
        ConfirmationInputs {
            funding_z,
            whale_composite: whale,
            supply: SupplyInputs::default(),
            volume_ratio_24h: 1.0,
        }
    }

    #[test]
    fn two_of_three_passes() {
        let result = evaluate(
            &inputs(2.5, 0.80),
            &ConfirmationConfig::default(),
            "normal",
            &[],
        );
        assert!(result.passed);
        assert_eq!(result.confirmation_count, 2);
        assert_eq!(result.required_count, 2);
        assert!(!result.volume_boost);
        assert_eq!(result.passed_gates, vec!["funding_divergence", "whale_composite"]);
        // 3.0 + 2.0.
        assert!((result.precedence_score - 5.0).abs() < 1e-9);
    }

    #[test]
    fn one_of_three_fails_without_boost() {
        let result = evaluate(
            &inputs(2.5, 0.10),
            &ConfirmationConfig::default(),
            "normal",
            &[],
        );
        assert!(!result.passed);
        assert_eq!(result.confirmation_count, 1);
        assert_eq!(result.failed_gates, vec!["whale_composite", "supply_squeeze"]);
    }

    #[test]
    fn volume_boost_lowers_required_count() {
        // Funding z 3.2, whale 0.80 pass; supply proxy 0.40-ish fails; the
        // 3.0x volume ratio in a boosted regime drops required to 1.
        let mut i = inputs(3.2, 0.80);
        i.supply = SupplyInputs {
            reserve_change_7d_pct: -6.0, // one component: score 0.25
            withdrawals_24h_usd: 0.0,
            staking_inflow_24h_usd: 0.0,
            oi_change_24h_pct: 0.0,
        };
        i.volume_ratio_24h = 3.0;

        let result = evaluate(&i, &ConfirmationConfig::default(), "volatile", &[]);
        assert!(result.passed);
        assert_eq!(result.confirmation_count, 2);
        assert_eq!(result.required_count, 1);
        assert!(result.volume_boost);
    }

    #[test]
    fn boost_requires_configured_regime() {
        let mut i = inputs(3.2, 0.10);
        i.volume_ratio_24h = 3.0;

        // "normal" is not in the default boost set: required stays 2.
        let result = evaluate(&i, &ConfirmationConfig::default(), "normal", &[]);
        assert_eq!(result.required_count, 2);
        assert!(!result.volume_boost);
        assert!(!result.passed);

        // "volatile" is, and the detector actually emits it.
        let result = evaluate(&i, &ConfirmationConfig::default(), "volatile", &[]);
        assert_eq!(result.required_count, 1);
        assert!(result.passed);
    }

    #[test]
    fn boost_regimes_are_operator_extensible() {
        let mut i = inputs(3.2, 0.10);
        i.volume_ratio_24h = 3.0;

        let config = ConfirmationConfig {
            volume_boost_regimes: vec!["volatile".to_string(), "normal".to_string()],
            ..ConfirmationConfig::default()
        };
        let result = evaluate(&i, &config, "normal", &[]);
        assert_eq!(result.required_count, 1);
        assert!(result.volume_boost);
    }

    #[test]
    fn supply_proxy_component_arithmetic() {
        let supply = SupplyInputs {
            reserve_change_7d_pct: -7.0,
            withdrawals_24h_usd: 60_000_000.0,
            staking_inflow_24h_usd: 12_000_000.0,
            oi_change_24h_pct: 20.0,
        };
        let breakdown = supply_proxy(&supply);
        assert_eq!(breakdown.component_count, 4);
        assert!((breakdown.score - 1.0).abs() < 1e-9);

        let partial = SupplyInputs {
            reserve_change_7d_pct: -7.0,
            withdrawals_24h_usd: 60_000_000.0,
            staking_inflow_24h_usd: 0.0,
            oi_change_24h_pct: 0.0,
        };
        let breakdown = supply_proxy(&partial);
        assert_eq!(breakdown.component_count, 2);
        assert!((breakdown.score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn supply_leg_passes_at_three_components() {
        let mut i = inputs(0.0, 0.0);
        i.supply = SupplyInputs {
            reserve_change_7d_pct: -7.0,
            withdrawals_24h_usd: 60_000_000.0,
            staking_inflow_24h_usd: 12_000_000.0,
            oi_change_24h_pct: 0.0,
        };

        let result = evaluate(&i, &ConfirmationConfig::default(), "normal", &[]);
        // 0.75 >= 0.60: the supply leg confirms, but alone it is 1 of 2.
        assert_eq!(result.passed_gates, vec!["supply_squeeze"]);
        assert!((result.precedence_score - 1.0).abs() < 1e-9);
        assert!(!result.passed);
    }

    #[test]
    fn funding_zscore_measures_divergence() {
        let history: Vec<f64> = (0..30).map(|i| 0.01 + (i % 3) as f64 * 0.001).collect();
        let z = funding_zscore(&history, 0.02).unwrap();
        assert!(z > 2.0, "strong divergence expected, got {z}");

        let neutral = funding_zscore(&history, 0.011).unwrap();
        assert!(neutral.abs() < 1.0);
    }

    #[test]
    fn funding_zscore_degenerate_history() {
        assert!(funding_zscore(&[0.01; 4], 0.02).is_none());
        assert!(funding_zscore(&[0.01; 30], 0.02).is_none());
    }

    #[test]
    fn count_matches_passed_gates_len() {
        for (z, whale) in [(3.0, 0.9), (3.0, 0.1), (0.0, 0.1)] {
            let result = evaluate(&inputs(z, whale), &ConfirmationConfig::default(), "normal", &[]);
            assert_eq!(result.confirmation_count, result.passed_gates.len());
        }
    }
}
