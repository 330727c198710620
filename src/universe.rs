// =============================================================================
// Universe file contract + symbol canonicalization
// =============================================================================
//
// The symbol-universe sync job (external) produces a JSON file listing the
// venue's USD pairs. The scan core only consumes that contract:
//
//   - `usd_pairs` sorted, each matching ^[A-Z0-9]+USD$
//   - `_hash` = sha256 hex over the canonical JSON of {symbols, criteria}
//   - rewrites are atomic (temp + rename)
//
// Symbol canonicalization happens once at the ingest boundary: strip every
// trailing "USD" occurrence, append exactly one "USD", and reject anything
// that does not match the pattern. Offenders go to an append-only audit log.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{ErrorKind, ScanError};

// =============================================================================
// Symbol canonicalization
// =============================================================================

/// Canonicalize a raw symbol into the `XXXUSD` form.
///
/// Steps: trim + upper-case, strip all trailing `USD` occurrences, append a
/// single `USD`, then validate against `^[A-Z0-9]+USD$`. Idempotent:
/// `normalize(normalize(s)) == normalize(s)` for every accepted input.
pub fn normalize_symbol(raw: &str) -> Result<String, ScanError> {
    let mut sym = raw.trim().to_uppercase();

    while sym.ends_with("USD") {
        sym.truncate(sym.len() - 3);
    }
    sym.push_str("USD");

    validate_symbol(&sym)?;
    Ok(sym)
}

/// Check a symbol against `^[A-Z0-9]+USD$` (at least one base character
/// before the quote suffix).
pub fn validate_symbol(sym: &str) -> Result<(), ScanError> {
    let base_len = sym.len().saturating_sub(3);
    let valid = sym.ends_with("USD")
        && base_len > 0
        && sym.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(ScanError::new(
            ErrorKind::DataQuality,
            format!("symbol '{sym}' does not match ^[A-Z0-9]+USD$"),
        )
        .with_offender(sym.to_string()))
    }
}

// =============================================================================
// Offender audit log
// =============================================================================

/// One rejected-symbol record in `audit/symbol_offenders.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolOffender {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub violation: String,
    pub expected: String,
    pub source: String,
}

/// Append an offender record to the audit log, creating directories as
/// needed. The log is append-only; existing lines are never touched.
pub fn log_offender(audit_dir: &Path, symbol: &str, violation: &str, source: &str) -> Result<()> {
    use std::io::Write;

    std::fs::create_dir_all(audit_dir)
        .with_context(|| format!("failed to create audit dir {}", audit_dir.display()))?;

    let record = SymbolOffender {
        ts: Utc::now(),
        symbol: symbol.to_string(),
        violation: violation.to_string(),
        expected: "^[A-Z0-9]+USD$".to_string(),
        source: source.to_string(),
    };

    let path = audit_dir.join("symbol_offenders.jsonl");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open offender audit {}", path.display()))?;

    let line = serde_json::to_string(&record).context("failed to serialize offender record")?;
    writeln!(file, "{line}").context("failed to append offender record")?;

    warn!(symbol, violation, source, "symbol offender logged");
    Ok(())
}

// =============================================================================
// Universe file
// =============================================================================

/// Selection criteria recorded alongside the pair list. Part of the hashed
/// content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UniverseCriteria {
    pub quote: String,
    pub min_adv_usd: u64,
}

impl Default for UniverseCriteria {
    fn default() -> Self {
        Self {
            quote: "USD".to_string(),
            min_adv_usd: 100_000,
        }
    }
}

/// The stable JSON contract produced by the universe sync job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Universe {
    pub venue: String,
    pub usd_pairs: Vec<String>,
    #[serde(default)]
    pub do_not_trade: Vec<String>,
    #[serde(rename = "_synced_at")]
    pub synced_at: DateTime<Utc>,
    #[serde(rename = "_source")]
    pub source: String,
    #[serde(rename = "_criteria")]
    pub criteria: UniverseCriteria,
    #[serde(rename = "_hash")]
    pub hash: String,
}

impl Universe {
    /// Build a universe from raw symbols: normalize, sort, dedupe, hash.
    /// Rejected symbols are returned separately so the caller can audit them.
    pub fn build(
        venue: impl Into<String>,
        raw_symbols: &[String],
        criteria: UniverseCriteria,
        source: impl Into<String>,
    ) -> (Self, Vec<String>) {
        let mut pairs = Vec::with_capacity(raw_symbols.len());
        let mut rejected = Vec::new();

        for raw in raw_symbols {
            match normalize_symbol(raw) {
                Ok(sym) => pairs.push(sym),
                Err(_) => rejected.push(raw.clone()),
            }
        }

        pairs.sort();
        pairs.dedup();

        let hash = universe_hash(&pairs, &criteria);

        let universe = Self {
            venue: venue.into(),
            usd_pairs: pairs,
            do_not_trade: Vec::new(),
            synced_at: Utc::now(),
            source: source.into(),
            criteria,
            hash,
        };

        (universe, rejected)
    }

    /// Load and verify a universe file. A hash mismatch is a data-quality
    /// error: the file was edited outside the sync job.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read universe file {}", path.display()))?;

        let universe: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse universe file {}", path.display()))?;

        let expected = universe_hash(&universe.usd_pairs, &universe.criteria);
        if expected != universe.hash {
            anyhow::bail!(
                "universe hash mismatch in {}: recorded {}, computed {}",
                path.display(),
                universe.hash,
                expected
            );
        }

        info!(
            path = %path.display(),
            venue = %universe.venue,
            pairs = universe.usd_pairs.len(),
            "universe loaded"
        );

        Ok(universe)
    }

    /// Atomic rewrite: serialize to a temp sibling, then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialize universe")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp universe to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp universe to {}", path.display()))?;

        info!(path = %path.display(), pairs = self.usd_pairs.len(), "universe saved (atomic)");
        Ok(())
    }

    /// Tradeable pairs: `usd_pairs` minus `do_not_trade`.
    pub fn tradeable(&self) -> Vec<String> {
        self.usd_pairs
            .iter()
            .filter(|p| !self.do_not_trade.contains(p))
            .cloned()
            .collect()
    }
}

/// Hash input: only `{symbols, criteria}`, canonically serialized.
/// serde_json emits map keys in sorted order, which keeps the digest stable
/// across rewrites.
#[derive(Serialize)]
struct HashedContent<'a> {
    symbols: &'a [String],
    criteria: &'a UniverseCriteria,
}

/// SHA-256 hex digest over the canonical JSON of `{symbols, criteria}`.
pub fn universe_hash(symbols: &[String], criteria: &UniverseCriteria) -> String {
    let content = HashedContent { symbols, criteria };
    let json = serde_json::to_string(&content).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}
