// =============================================================================
// Ledger & candidate artifacts — append-only JSONL outputs
// =============================================================================
//
// Two artifact streams per §outputs:
//
//   ledger.jsonl             one LedgerEntry per scan per symbol, append-only,
//                            tracking forward-return horizons (filled in later
//                            by the analysis job; null at scan time)
//   latest_candidates.jsonl  one Candidate per line, rewritten atomically per
//                            tick; every row passes the symbol validator and
//                            blocked rows land in audit/symbol_offenders.jsonl
//
// All writes are atomic (append on an open handle, or temp + rename for the
// full-file rewrite) so a crashed tick never leaves a torn artifact.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::factors::FactorSet;
use crate::gates::AllGateResults;
use crate::scoring::CompositeScore;
use crate::universe::{log_offender, validate_symbol};

/// Forward-return horizons tracked by the ledger.
pub const HORIZONS: [(&str, i64); 4] = [("6h", 6), ("12h", 12), ("24h", 24), ("48h", 48)];

/// Final verdict for one candidate this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Pass,
    Reject,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Reject => write!(f, "REJECT"),
        }
    }
}

/// Per-symbol view of the pruner's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioOutcome {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// The full per-symbol scan result written to `latest_candidates.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub score: CompositeScore,
    pub factors: FactorSet,
    pub gates: AllGateResults,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portfolio: Option<PortfolioOutcome>,
    pub decision: Decision,
    pub snapshot_saved: bool,
}

/// Append-only forward-return tracking row. `realized` and `pass` stay null
/// until the analysis job fills them after the horizon elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub scan_ts: DateTime<Utc>,
    pub symbol: String,
    pub composite: f64,
    pub gates_all_pass: bool,
    pub entry_price: f64,
    /// Horizon label -> the UTC instant at which the return realizes.
    pub horizons: BTreeMap<String, DateTime<Utc>>,
    /// Horizon label -> realized return in percent; null until filled.
    pub realized: BTreeMap<String, Option<f64>>,
    /// Horizon label -> whether the move validated the signal.
    pub pass: BTreeMap<String, Option<bool>>,
    /// "scanned" normally; "timeout" when the symbol task missed the tick
    /// deadline and was excluded from ranking.
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "scanned".to_string()
}

impl LedgerEntry {
    pub fn new(
        scan_ts: DateTime<Utc>,
        symbol: impl Into<String>,
        composite: f64,
        gates_all_pass: bool,
        entry_price: f64,
    ) -> Self {
        let mut horizons = BTreeMap::new();
        let mut realized = BTreeMap::new();
        let mut pass = BTreeMap::new();
        for (label, hours) in HORIZONS {
            horizons.insert(label.to_string(), scan_ts + Duration::hours(hours));
            realized.insert(label.to_string(), None);
            pass.insert(label.to_string(), None);
        }

        Self {
            scan_ts,
            symbol: symbol.into(),
            composite,
            gates_all_pass,
            entry_price,
            horizons,
            realized,
            pass,
            status: default_status(),
        }
    }

    /// Entry for a symbol task cancelled by the tick deadline.
    pub fn timeout(scan_ts: DateTime<Utc>, symbol: impl Into<String>) -> Self {
        let mut entry = Self::new(scan_ts, symbol, 0.0, false, 0.0);
        entry.status = "timeout".to_string();
        entry
    }
}

// =============================================================================
// Writers
// =============================================================================

/// Append entries to `ledger.jsonl` under `artifacts_dir`. Existing lines
/// are never rewritten.
pub fn append_ledger(artifacts_dir: &Path, entries: &[LedgerEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    std::fs::create_dir_all(artifacts_dir)
        .with_context(|| format!("failed to create {}", artifacts_dir.display()))?;

    let path = artifacts_dir.join("ledger.jsonl");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open ledger {}", path.display()))?;

    for entry in entries {
        let line = serde_json::to_string(entry).context("failed to serialize ledger entry")?;
        writeln!(file, "{line}").context("failed to append ledger entry")?;
    }

    info!(count = entries.len(), path = %path.display(), "ledger entries appended");
    Ok(())
}

/// Rewrite `latest_candidates.jsonl` atomically. Rows failing the symbol
/// validator are dropped and logged to the offender audit.
pub fn write_candidates(artifacts_dir: &Path, candidates: &[Candidate]) -> Result<usize> {
    std::fs::create_dir_all(artifacts_dir)
        .with_context(|| format!("failed to create {}", artifacts_dir.display()))?;

    let mut body = String::new();
    let mut written = 0usize;

    for candidate in candidates {
        if let Err(e) = validate_symbol(&candidate.symbol) {
            warn!(symbol = %candidate.symbol, "candidate blocked by symbol validator");
            log_offender(
                &artifacts_dir.join("audit"),
                &candidate.symbol,
                &e.message,
                "latest_candidates",
            )?;
            continue;
        }
        body.push_str(&serde_json::to_string(candidate).context("failed to serialize candidate")?);
        body.push('\n');
        written += 1;
    }

    let path = artifacts_dir.join("latest_candidates.jsonl");
    let tmp = path.with_extension("jsonl.tmp");
    std::fs::write(&tmp, body.as_bytes())
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;

    info!(written, blocked = candidates.len() - written, "candidates artifact written");
    Ok(written)
}

/// Read the ledger back (analysis jobs and tests).
pub fn read_ledger(artifacts_dir: &Path) -> Result<Vec<LedgerEntry>> {
    let path = artifacts_dir.join("ledger.jsonl");
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read ledger {}", path.display()))?;

    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("failed to parse ledger line"))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightVector;
    use crate::factors::FactorMetadata;

    fn score(symbol: &str) -> CompositeScore {
        CompositeScore {
            symbol: symbol.to_string(),
            score: 80.0,
            components: Vec::new(),
            regime: "normal".to_string(),
            weights: WeightVector {
                momentum_core: 0.45,
                technical_residual: 0.22,
                volume_residual: 0.18,
                quality_residual: 0.10,
                social_residual: 0.05,
            },
            selected: true,
            momentum_core: 5.0,
        }
    }

    fn factors(symbol: &str) -> FactorSet {
        FactorSet {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            momentum_core: 5.0,
            technical: 0.0,
            volume: 0.0,
            quality: 0.0,
            social: 0.0,
            metadata: FactorMetadata::default(),
        }
    }

    fn gates() -> AllGateResults {
        AllGateResults {
            microstructure: Vec::new(),
            freshness: Vec::new(),
            late_fill: None,
            fatigue: None,
            confirmation: None,
            all_pass: true,
            failure_reasons: Vec::new(),
            short_circuited: false,
        }
    }

    fn candidate(symbol: &str) -> Candidate {
        Candidate {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            score: score(symbol),
            factors: factors(symbol),
            gates: gates(),
            portfolio: Some(PortfolioOutcome {
                accepted: true,
                rejection_reason: None,
            }),
            decision: Decision::Pass,
            snapshot_saved: true,
        }
    }

    #[test]
    fn ledger_entry_initializes_null_horizons() {
        let entry = LedgerEntry::new(Utc::now(), "BTCUSD", 82.5, true, 100.0);
        assert_eq!(entry.horizons.len(), 4);
        assert!(entry.realized.values().all(Option::is_none));
        assert!(entry.pass.values().all(Option::is_none));
        assert_eq!(entry.status, "scanned");

        let h6 = entry.horizons.get("6h").unwrap();
        assert_eq!(*h6 - entry.scan_ts, Duration::hours(6));
    }

    #[test]
    fn timeout_entry_is_marked() {
        let entry = LedgerEntry::timeout(Utc::now(), "ETHUSD");
        assert_eq!(entry.status, "timeout");
        assert!(!entry.gates_all_pass);
    }

    #[test]
    fn ledger_appends_are_cumulative() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();

        append_ledger(
            dir.path(),
            &[LedgerEntry::new(now, "BTCUSD", 80.0, true, 100.0)],
        )
        .unwrap();
        append_ledger(
            dir.path(),
            &[LedgerEntry::new(now, "ETHUSD", 70.0, false, 50.0)],
        )
        .unwrap();

        let entries = read_ledger(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].symbol, "BTCUSD");
        assert_eq!(entries[1].symbol, "ETHUSD");
    }

    #[test]
    fn candidates_artifact_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let written =
            write_candidates(dir.path(), &[candidate("BTCUSD"), candidate("ETHUSD")]).unwrap();
        assert_eq!(written, 2);

        let content =
            std::fs::read_to_string(dir.path().join("latest_candidates.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: Candidate = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.symbol, "BTCUSD");
        assert_eq!(parsed.decision, Decision::Pass);
    }

    #[test]
    fn invalid_symbol_is_blocked_and_audited() {
        let dir = tempfile::tempdir().unwrap();
        let written =
            write_candidates(dir.path(), &[candidate("BTCUSD"), candidate("BAD/SYM")]).unwrap();
        assert_eq!(written, 1);

        let audit = std::fs::read_to_string(
            dir.path().join("audit").join("symbol_offenders.jsonl"),
        )
        .unwrap();
        assert!(audit.contains("BAD/SYM"));

        let content =
            std::fs::read_to_string(dir.path().join("latest_candidates.jsonl")).unwrap();
        assert!(!content.contains("BAD/SYM"));
    }

    #[test]
    fn rewrite_replaces_previous_tick() {
        let dir = tempfile::tempdir().unwrap();
        write_candidates(dir.path(), &[candidate("BTCUSD")]).unwrap();
        write_candidates(dir.path(), &[candidate("ETHUSD")]).unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("latest_candidates.jsonl")).unwrap();
        assert!(content.contains("ETHUSD"));
        assert!(!content.contains("BTCUSD"));
        assert!(!dir.path().join("latest_candidates.jsonl.tmp").exists());
    }
}
