// =============================================================================
// Entry Gate Cascade
// =============================================================================
//
// A candidate must pass every gate. Evaluation order is fixed:
//
//   1. microstructure   (hard — short-circuits the cascade)
//   2. freshness        (hard — short-circuits)
//   3. late-fill        (hard — short-circuits)
//   4. fatigue          (soft — recorded, evaluation continues)
//   5. 2-of-3 confirmation (soft — recorded)
//
// Hard failures are fatal for this symbol this tick; soft failures are
// reported but never retried. When the cascade is not short-circuited the
// result carries evidence for every gate so a decision can be audited
// after the fact. Failure reason codes accumulate in evaluation order.

pub mod confirmation;
pub mod fatigue;
pub mod microstructure;
pub mod timing;

use serde::{Deserialize, Serialize};

use crate::config::{ConfirmationConfig, EntryLimits, GuardThresholds};
pub use confirmation::{ConfirmationInputs, ConfirmationResult, SupplyInputs};
pub use microstructure::MicroInputs;
pub use timing::TimingInputs;

/// Evidence for one gate check: what was measured against what threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateEvidence {
    pub ok: bool,
    pub name: String,
    pub measured_value: f64,
    pub threshold: f64,
    /// Present only on failure.
    pub reason_code: Option<String>,
}

impl GateEvidence {
    pub fn pass(name: impl Into<String>, measured: f64, threshold: f64) -> Self {
        Self {
            ok: true,
            name: name.into(),
            measured_value: measured,
            threshold,
            reason_code: None,
        }
    }

    pub fn fail(
        name: impl Into<String>,
        measured: f64,
        threshold: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            ok: false,
            name: name.into(),
            measured_value: measured,
            threshold,
            reason_code: Some(reason.into()),
        }
    }
}

/// Everything the cascade needs for one symbol.
#[derive(Debug, Clone)]
pub struct GateInputs {
    pub micro: MicroInputs,
    pub timing: TimingInputs,
    /// 24h return in percent (fatigue).
    pub return_24h: f64,
    /// 4h RSI (fatigue).
    pub rsi_4h: f64,
    /// Momentum acceleration; fatigue only trips when it is <= 0.
    pub acceleration: f64,
    pub confirmation: ConfirmationInputs,
}

/// Aggregated result of the full cascade for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllGateResults {
    pub microstructure: Vec<GateEvidence>,
    pub freshness: Vec<GateEvidence>,
    pub late_fill: Option<GateEvidence>,
    pub fatigue: Option<GateEvidence>,
    pub confirmation: Option<ConfirmationResult>,
    pub all_pass: bool,
    /// Reason codes in evaluation order.
    pub failure_reasons: Vec<String>,
    /// True when a hard gate stopped the cascade early.
    pub short_circuited: bool,
}

impl AllGateResults {
    fn collect_failures(evidence: &[GateEvidence], reasons: &mut Vec<String>) {
        for e in evidence {
            if let Some(code) = &e.reason_code {
                reasons.push(code.clone());
            }
        }
    }
}

/// Run the cascade in its fixed order.
pub fn evaluate(
    inputs: &GateInputs,
    limits: &EntryLimits,
    guards: &GuardThresholds,
    confirmation_cfg: &ConfirmationConfig,
    regime: &str,
) -> AllGateResults {
    let mut failure_reasons = Vec::new();

    // --- 1. Microstructure (hard) -------------------------------------------
    let micro = microstructure::evaluate(&inputs.micro, limits);
    let micro_ok = micro.iter().all(|e| e.ok);
    AllGateResults::collect_failures(&micro, &mut failure_reasons);
    if !micro_ok {
        return AllGateResults {
            microstructure: micro,
            freshness: Vec::new(),
            late_fill: None,
            fatigue: None,
            confirmation: None,
            all_pass: false,
            failure_reasons,
            short_circuited: true,
        };
    }

    // --- 2. Freshness (hard) -------------------------------------------------
    let freshness = timing::evaluate_freshness(&inputs.timing, guards);
    let freshness_ok = freshness.iter().all(|e| e.ok);
    AllGateResults::collect_failures(&freshness, &mut failure_reasons);
    if !freshness_ok {
        return AllGateResults {
            microstructure: micro,
            freshness,
            late_fill: None,
            fatigue: None,
            confirmation: None,
            all_pass: false,
            failure_reasons,
            short_circuited: true,
        };
    }

    // --- 3. Late-fill (hard) -------------------------------------------------
    let late_fill = timing::evaluate_late_fill(&inputs.timing, guards);
    if !late_fill.ok {
        if let Some(code) = &late_fill.reason_code {
            failure_reasons.push(code.clone());
        }
        return AllGateResults {
            microstructure: micro,
            freshness,
            late_fill: Some(late_fill),
            fatigue: None,
            confirmation: None,
            all_pass: false,
            failure_reasons,
            short_circuited: true,
        };
    }

    // --- 4. Fatigue (soft) ---------------------------------------------------
    let fatigue = fatigue::evaluate(
        inputs.return_24h,
        inputs.rsi_4h,
        inputs.acceleration,
        guards,
    );
    if let Some(code) = &fatigue.reason_code {
        failure_reasons.push(code.clone());
    }

    // --- 5. 2-of-3 confirmation (soft) --------------------------------------
    let confirmation =
        confirmation::evaluate(&inputs.confirmation, confirmation_cfg, regime, &micro);
    if !confirmation.passed {
        failure_reasons.push("CONFIRMATION_FAILED".to_string());
    }

    let all_pass = fatigue.ok && confirmation.passed;

    AllGateResults {
        microstructure: micro,
        freshness,
        late_fill: Some(late_fill),
        fatigue: Some(fatigue),
        confirmation: Some(confirmation),
        all_pass,
        failure_reasons,
        short_circuited: false,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn passing_inputs() -> GateInputs {
        let now = Utc::now();
        GateInputs {
            micro: MicroInputs {
                spread_bps: 10.0,
                depth_usd: 500_000.0,
                vadr: 2.5,
            },
            timing: TimingInputs {
                current_price: 100.5,
                base_price: 100.0,
                atr: 2.0,
                bars_age: 1,
                fill_time: now,
                bar_close_time: now - Duration::seconds(5),
            },
            return_24h: 4.0,
            rsi_4h: 55.0,
            acceleration: 0.5,
            confirmation: ConfirmationInputs {
                funding_z: 3.0,
                whale_composite: 0.85,
                supply: SupplyInputs {
                    reserve_change_7d_pct: -1.0,
                    withdrawals_24h_usd: 1e6,
                    staking_inflow_24h_usd: 0.0,
                    oi_change_24h_pct: 2.0,
                },
                volume_ratio_24h: 1.0,
            },
        }
    }

    fn cfgs() -> (EntryLimits, GuardThresholds, ConfirmationConfig) {
        (
            EntryLimits::default(),
            GuardThresholds::default(),
            ConfirmationConfig::default(),
        )
    }

    #[test]
    fn clean_candidate_passes_all_gates() {
        let (limits, guards, confirm) = cfgs();
        let result = evaluate(&passing_inputs(), &limits, &guards, &confirm, "normal");

        assert!(result.all_pass);
        assert!(!result.short_circuited);
        assert!(result.failure_reasons.is_empty());
        assert_eq!(result.microstructure.len(), 3);
        assert!(result.confirmation.as_ref().unwrap().passed);
    }

    #[test]
    fn wide_spread_short_circuits() {
        let (limits, guards, confirm) = cfgs();
        let mut inputs = passing_inputs();
        inputs.micro.spread_bps = 120.0;

        let result = evaluate(&inputs, &limits, &guards, &confirm, "normal");

        assert!(!result.all_pass);
        assert!(result.short_circuited);
        assert_eq!(result.failure_reasons, vec!["SPREAD_TOO_WIDE"]);
        // Nothing past the hard failure was evaluated.
        assert!(result.freshness.is_empty());
        assert!(result.fatigue.is_none());
        assert!(result.confirmation.is_none());
    }

    #[test]
    fn soft_failures_do_not_short_circuit() {
        let (limits, guards, confirm) = cfgs();
        let mut inputs = passing_inputs();
        // Fatigued: hot 24h run, hot RSI, stalling acceleration.
        inputs.return_24h = 20.0;
        inputs.rsi_4h = 80.0;
        inputs.acceleration = -0.5;

        let result = evaluate(&inputs, &limits, &guards, &confirm, "normal");

        assert!(!result.all_pass);
        assert!(!result.short_circuited);
        assert!(result.failure_reasons.contains(&"FATIGUE_DETECTED".to_string()));
        // Confirmation was still evaluated for the audit trail.
        assert!(result.confirmation.is_some());
    }

    #[test]
    fn failure_reasons_preserve_evaluation_order() {
        let (limits, guards, confirm) = cfgs();
        let mut inputs = passing_inputs();
        inputs.return_24h = 20.0;
        inputs.rsi_4h = 80.0;
        inputs.acceleration = -0.5;
        // Confirmation also fails: nothing confirms.
        inputs.confirmation.funding_z = 0.0;
        inputs.confirmation.whale_composite = 0.0;
        inputs.confirmation.supply.reserve_change_7d_pct = 0.0;

        let result = evaluate(&inputs, &limits, &guards, &confirm, "normal");

        assert_eq!(
            result.failure_reasons,
            vec!["FATIGUE_DETECTED", "CONFIRMATION_FAILED"]
        );
    }
}
