// =============================================================================
// Technical Indicators
// =============================================================================
//
// Pure, side-effect-free indicator math over OHLCV bars. Every public
// function returns `Option<T>` so callers must handle insufficient-data and
// numerical-edge-case scenarios; nothing here panics on market data.

pub mod adx;
pub mod atr;
pub mod hurst;
pub mod rsi;
