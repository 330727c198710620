// =============================================================================
// Provider layer — guarded upstream access
// =============================================================================
//
// Every REST provider sits behind a ProviderGuard: token bucket, TTL cache,
// circuit breaker, retry policy, and in-flight dedupe. The guard is the only
// path to an upstream HTTP call; nothing bypasses it.

pub mod guard;
pub mod kraken;
