// =============================================================================
// Scan-core error taxonomy
// =============================================================================
//
// Every failure in the scan core maps to exactly one kind. Symbol-local
// errors (transient, breaker, data-quality, gate-fail) are absorbed and
// recorded; config errors are fatal at startup; fatal-runtime errors abort
// the current tick while prior writes remain durable.

use serde::Serialize;

/// Discriminated failure kind. Cancellation is a separate channel and never
/// travels through this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provider timeout, 429, 5xx, WS disconnect, refetchable cache miss.
    Transient,
    /// Provider guard refused the call (breaker OPEN).
    Breaker,
    /// Symbol failed validation, data stale beyond threshold, checksum
    /// mismatch between tiers.
    DataQuality,
    /// An entry gate rejected the candidate. Never retried.
    GateFail,
    /// Missing or invalid configuration. Fatal at startup.
    Config,
    /// Filesystem write failure for ledger/PIT. Fatal to the tick.
    FatalRuntime,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Breaker => write!(f, "breaker"),
            Self::DataQuality => write!(f, "data-quality"),
            Self::GateFail => write!(f, "gate-fail"),
            Self::Config => write!(f, "config"),
            Self::FatalRuntime => write!(f, "fatal-runtime"),
        }
    }
}

/// Error carried across component boundaries inside the scan core.
///
/// `offender` names the first symbol or provider that triggered the failure
/// so the single-line exit summary can point at it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanError {
    pub kind: ErrorKind,
    pub message: String,
    pub offender: Option<String>,
}

impl ScanError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            offender: None,
        }
    }

    pub fn with_offender(mut self, offender: impl Into<String>) -> Self {
        self.offender = Some(offender.into());
        self
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn breaker(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Breaker, message)
    }

    pub fn data_quality(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataQuality, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalRuntime, message)
    }

    /// Single summary line for the non-zero exit path.
    pub fn summary_line(&self) -> String {
        match &self.offender {
            Some(who) => format!("{}: {} ({})", self.kind, self.message, who),
            None => format!("{}: {}", self.kind, self.message),
        }
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.summary_line())
    }
}

impl std::error::Error for ScanError {}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display() {
        assert_eq!(format!("{}", ErrorKind::Transient), "transient");
        assert_eq!(format!("{}", ErrorKind::DataQuality), "data-quality");
        assert_eq!(format!("{}", ErrorKind::FatalRuntime), "fatal-runtime");
    }

    #[test]
    fn summary_includes_offender() {
        let err = ScanError::transient("provider timeout").with_offender("kraken");
        assert_eq!(err.summary_line(), "transient: provider timeout (kraken)");
    }

    #[test]
    fn summary_without_offender() {
        let err = ScanError::config("weights do not sum to 1.0");
        assert_eq!(err.summary_line(), "config: weights do not sum to 1.0");
    }
}
