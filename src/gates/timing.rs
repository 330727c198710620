// =============================================================================
// Timing gates — freshness and late-fill
// =============================================================================
//
// Freshness: the current price must sit within `atr_factor × ATR` of the
// signal bar's base price AND the bar must be recent (`bars_age` within
// the cap). Reason codes: PRICE_DEVIATION, STALE_DATA.
//
// Late-fill: the hypothetical fill must land within `max_delay_seconds` of
// the signal bar's close. Reason code: LATE_FILL.

use chrono::{DateTime, Utc};

use crate::config::GuardThresholds;
use crate::gates::GateEvidence;

/// Price/clock measurements for the timing gates.
#[derive(Debug, Clone)]
pub struct TimingInputs {
    pub current_price: f64,
    /// Close of the bar the signal was computed on.
    pub base_price: f64,
    pub atr: f64,
    /// How many bars old the signal bar is.
    pub bars_age: u32,
    pub fill_time: DateTime<Utc>,
    pub bar_close_time: DateTime<Utc>,
}

/// Freshness: price-deviation check then bar-age check.
pub fn evaluate_freshness(inputs: &TimingInputs, guards: &GuardThresholds) -> Vec<GateEvidence> {
    let deviation = (inputs.current_price - inputs.base_price).abs();
    let allowed = guards.freshness_atr_factor * inputs.atr;

    let price = if deviation <= allowed {
        GateEvidence::pass("price_deviation", deviation, allowed)
    } else {
        GateEvidence::fail("price_deviation", deviation, allowed, "PRICE_DEVIATION")
    };

    let age = if inputs.bars_age <= guards.freshness_max_bars_age {
        GateEvidence::pass(
            "bars_age",
            inputs.bars_age as f64,
            guards.freshness_max_bars_age as f64,
        )
    } else {
        GateEvidence::fail(
            "bars_age",
            inputs.bars_age as f64,
            guards.freshness_max_bars_age as f64,
            "STALE_DATA",
        )
    };

    vec![price, age]
}

/// Late-fill: seconds between bar close and fill.
pub fn evaluate_late_fill(inputs: &TimingInputs, guards: &GuardThresholds) -> GateEvidence {
    let delay_s = (inputs.fill_time - inputs.bar_close_time).num_seconds();
    let max = guards.late_fill_max_delay_seconds;

    if delay_s <= max {
        GateEvidence::pass("late_fill", delay_s as f64, max as f64)
    } else {
        GateEvidence::fail("late_fill", delay_s as f64, max as f64, "LATE_FILL")
    }
}
