// =============================================================================
// Operational guards and KPI rollups
// =============================================================================
//
// The guards gate each scan tick (budget, per-provider quota, correlation,
// venue health); the KPI tracker aggregates rolling counters that the
// guards and the health surface read as snapshot copies.

pub mod guards;
pub mod kpi;
