// =============================================================================
// Market regime classification
// =============================================================================

pub mod detector;

pub use detector::{MarketRegime, RegimeDetector, RegimeInputs, RegimeState};
