// =============================================================================
// Fatigue gate — block chasing an extended move that is losing steam
// =============================================================================
//
// Blocks only when all three hold: the 24h return is already beyond the
// threshold, the 4h RSI is overheated, and acceleration is non-positive
// (the move has stopped getting faster). A strongly accelerating move is
// never fatigued. Reason code: FATIGUE_DETECTED.

use crate::config::GuardThresholds;
use crate::gates::GateEvidence;

pub fn evaluate(
    return_24h: f64,
    rsi_4h: f64,
    acceleration: f64,
    guards: &GuardThresholds,
) -> GateEvidence {
    let overextended = return_24h > guards.fatigue_return_24h;
    let overheated = rsi_4h > guards.fatigue_rsi_4h;
    let stalling = acceleration <= 0.0;

    if overextended && overheated && stalling {
        GateEvidence::fail(
            "fatigue",
            return_24h,
            guards.fatigue_return_24h,
            "FATIGUE_DETECTED",
        )
    } else {
        GateEvidence::pass("fatigue", return_24h, guards.fatigue_return_24h)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calm_candidate_passes() {
        let e = evaluate(5.0, 55.0, 0.2, &GuardThresholds::default());
        assert!(e.ok);
    }

    #[test]
    fn all_three_conditions_trip_the_gate() {
        let e = evaluate(15.0, 75.0, -0.1, &GuardThresholds::default());
        assert!(!e.ok);
        assert_eq!(e.reason_code.as_deref(), Some("FATIGUE_DETECTED"));
    }

    #[test]
    fn accelerating_move_is_not_fatigued() {
        // Extended and overheated, but still accelerating.
        let e = evaluate(15.0, 75.0, 0.5, &GuardThresholds::default());
        assert!(e.ok);
    }

    #[test]
    fn extended_but_cool_rsi_passes() {
        let e = evaluate(15.0, 60.0, -0.1, &GuardThresholds::default());
        assert!(e.ok);
    }

    #[test]
    fn boundary_is_exclusive() {
        let guards = GuardThresholds::default();
        // Exactly at the thresholds: not "greater than", so it passes.
        let e = evaluate(guards.fatigue_return_24h, guards.fatigue_rsi_4h, -0.1, &guards);
        assert!(e.ok);
    }
}
