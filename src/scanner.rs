// =============================================================================
// Scan Pipeline — one tick from universe to persisted decisions
// =============================================================================
//
// Per tick: load the universe, fetch + compute factors per symbol
// concurrently (bounded by `max_concurrent_scans`, cancelled at the tick
// deadline), then run the cross-symbol stages once behind the join
// barrier: orthogonalization, regime classification, scoring/ranking, the
// gate cascade, the portfolio pruner, and the alerts governor. Decisions
// are recorded through the PIT store and the ledger.
//
// Symbol-local failures are absorbed and recorded; a tick-wide failure
// aborts the tick without corrupting persisted state. Cancelled symbol
// tasks never write to the ledger or PIT beyond their `timeout` marker,
// and late results never influence an earlier tick's output (scan_ts is
// strictly monotone).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::alerts::{AlertCandidate, AlertDecision, AlertsGovernor};
use crate::config::{EntryLimits, ScanConfig};
use crate::data::facade::DataFacade;
use crate::data::{BookTop, Ohlc, Payload};
use crate::error::ScanError;
use crate::factors::momentum::compute_factors;
use crate::factors::orthogonal::orthogonalize;
use crate::factors::{CrossSection, FactorMetadata, FactorSet, SocialProvider};
use crate::gates::confirmation::ConfirmationInputs;
use crate::gates::microstructure::vadr;
use crate::gates::{self, AllGateResults, GateInputs, MicroInputs, TimingInputs};
use crate::ledger::{self, Candidate, Decision, LedgerEntry, PortfolioOutcome};
use crate::ops::guards::{any_block, GuardReport, OpsGuards};
use crate::ops::kpi::{KpiTracker, VenueHealthSample};
use crate::pit::PitStore;
use crate::portfolio::{prune, PrunerCandidate, ReturnsCorrelations};
use crate::regime::{RegimeDetector, RegimeInputs, RegimeState};
use crate::scoring::{rank_and_select, score_cross_section, CompositeScore};

/// External confirmation data (funding, whale flows, supply) injected per
/// deployment. The neutral default confirms nothing.
pub trait ConfirmationSource: Send + Sync {
    fn confirmation_inputs(&self, symbol: &str) -> ConfirmationInputs;
}

/// Default source: no external aggregates wired in, nothing confirms.
pub struct NeutralConfirmationSource;

impl ConfirmationSource for NeutralConfirmationSource {
    fn confirmation_inputs(&self, _symbol: &str) -> ConfirmationInputs {
        ConfirmationInputs::default()
    }
}

/// Everything the scanner needs, wired once by the composition root.
pub struct Scanner {
    config: ScanConfig,
    facade: Arc<DataFacade>,
    regime: Arc<RegimeDetector>,
    kpi: Arc<KpiTracker>,
    ops: Arc<OpsGuards>,
    pit: Arc<PitStore>,
    alerts: Arc<AlertsGovernor>,
    confirmation: Arc<dyn ConfirmationSource>,
    social: Option<Arc<dyn SocialProvider>>,
    /// Symbol -> sector tag; symbols absent here read "uncategorized".
    sectors: HashMap<String, String>,
    /// Strictly monotone scan timestamps across ticks.
    last_scan_ts: Mutex<DateTime<Utc>>,
    /// Correlations from the previous tick, feeding the ops correlation
    /// guard at the top of the next one.
    last_correlations: Mutex<Arc<ReturnsCorrelations>>,
}

/// Everything one symbol task produces before the barrier.
struct SymbolSnapshot {
    factors: FactorSet,
    book: BookTop,
    bars: Vec<Ohlc>,
    current_price: f64,
    bar_close_time: DateTime<Utc>,
}

/// Machine-readable output of one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub scan_ts: DateTime<Utc>,
    pub regime: RegimeState,
    pub universe_size: usize,
    pub scanned: usize,
    pub timed_out: Vec<String>,
    pub skipped: HashMap<String, String>,
    pub guard_reports: Vec<GuardReport>,
    pub candidates: Vec<Candidate>,
    pub accepted: Vec<String>,
    /// Set when the tick was vetoed before scanning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ScanConfig,
        facade: Arc<DataFacade>,
        regime: Arc<RegimeDetector>,
        kpi: Arc<KpiTracker>,
        ops: Arc<OpsGuards>,
        pit: Arc<PitStore>,
        alerts: Arc<AlertsGovernor>,
        confirmation: Arc<dyn ConfirmationSource>,
        social: Option<Arc<dyn SocialProvider>>,
        sectors: HashMap<String, String>,
    ) -> Self {
        Self {
            config,
            facade,
            regime,
            kpi,
            ops,
            pit,
            alerts,
            confirmation,
            social,
            sectors,
            last_scan_ts: Mutex::new(DateTime::<Utc>::MIN_UTC),
            last_correlations: Mutex::new(Arc::new(ReturnsCorrelations::default())),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Next scan timestamp: wall clock, bumped if the clock has not moved
    /// past the previous tick.
    fn next_scan_ts(&self) -> DateTime<Utc> {
        let mut last = self.last_scan_ts.lock();
        let mut ts = Utc::now();
        if ts <= *last {
            ts = *last + Duration::microseconds(1);
        }
        *last = ts;
        ts
    }

    // -------------------------------------------------------------------------
    // One tick
    // -------------------------------------------------------------------------

    pub async fn run_tick(&self, symbols: &[String]) -> Result<TickReport> {
        let scan_ts = self.next_scan_ts();
        let deadline = tokio::time::Instant::now()
            + StdDuration::from_secs(self.config.scan_timeout_seconds);

        let regime_state = self.regime.current();

        // --- Emergency switches ---------------------------------------------
        if self.config.emergency.disable_all_scanners {
            warn!("scanners disabled by emergency switch — tick skipped");
            return Ok(self.aborted_report(scan_ts, regime_state, symbols.len(), "disable_all_scanners"));
        }
        self.facade
            .set_live_data(!self.config.emergency.disable_live_data);

        // --- Ops guards ------------------------------------------------------
        let providers: Vec<String> =
            self.config.ops.call_quota_providers.keys().cloned().collect();
        let prior_correlations = self.last_correlations.lock().clone();
        let venue_samples: Vec<VenueHealthSample> = self.kpi.rollup().venues;
        let guard_reports =
            self.ops
                .evaluate_all(&providers, prior_correlations.as_ref(), &venue_samples);
        if any_block(&guard_reports) {
            warn!("ops guard BLOCK — tick vetoed");
            let mut report =
                self.aborted_report(scan_ts, regime_state, symbols.len(), "ops_guard_block");
            report.guard_reports = guard_reports;
            return Ok(report);
        }

        // --- Per-symbol fan-out ---------------------------------------------
        let (snapshots, skipped, timed_out) = self.collect_symbols(symbols, deadline).await;

        info!(
            scanned = snapshots.len(),
            skipped = skipped.len(),
            timed_out = timed_out.len(),
            "symbol collection complete"
        );

        // Timed-out symbols are excluded from ranking but ledgered.
        let timeout_entries: Vec<LedgerEntry> = timed_out
            .iter()
            .map(|s| LedgerEntry::timeout(scan_ts, s.clone()))
            .collect();

        // --- Cross-symbol stages --------------------------------------------
        let mut xs = CrossSection::new();
        let mut by_symbol: HashMap<String, SymbolSnapshot> = HashMap::new();
        for snapshot in snapshots {
            let symbol = snapshot.factors.symbol.clone();
            if xs.push(snapshot.factors.clone()).is_some() {
                by_symbol.insert(symbol, snapshot);
            }
        }

        let histories: Vec<&[Ohlc]> = by_symbol.values().map(|s| s.bars.as_slice()).collect();
        let regime_state = match RegimeInputs::from_universe(&histories) {
            Some(inputs) => self.regime.update(inputs),
            None => self.regime.current(),
        };

        orthogonalize(
            &mut xs,
            &self.config.orthogonalization_sequence,
            self.config.weights.validation.social_hard_cap,
        );

        let weights = self
            .config
            .weights
            .regimes
            .get(regime_state.regime.as_str())
            .copied()
            .ok_or_else(|| {
                ScanError::config(format!(
                    "no weight vector for regime '{}'",
                    regime_state.regime
                ))
            })?;

        let mut scores = score_cross_section(
            &xs,
            &weights,
            regime_state.regime.as_str(),
            self.config.score_steepness,
        );
        rank_and_select(&mut scores, self.config.top_n);

        // Orthogonalized factor sets, re-keyed for candidate assembly.
        let factor_sets: HashMap<String, FactorSet> = xs
            .into_sets()
            .into_iter()
            .map(|s| (s.symbol.clone(), s))
            .collect();

        // --- Gates on the selected set --------------------------------------
        let correlations = Arc::new(ReturnsCorrelations::from_closes(
            &by_symbol
                .iter()
                .map(|(sym, snap)| {
                    (sym.clone(), snap.bars.iter().map(|b| b.close).collect())
                })
                .collect(),
        ));
        *self.last_correlations.lock() = correlations.clone();

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut pruner_input: Vec<PrunerCandidate> = Vec::new();

        for score in scores.iter().filter(|s| s.selected) {
            let Some(snapshot) = by_symbol.get(&score.symbol) else { continue };
            let Some(factors) = factor_sets.get(&score.symbol) else { continue };

            let gate_results = self.evaluate_gates(score, snapshot, factors, &regime_state);

            let entry_block =
                entry_policy_blocks(&self.config.entry_limits, score.score, &factors.metadata);
            if let Some(reason) = &entry_block {
                debug!(symbol = %score.symbol, reason = %reason, "entry policy blocked candidate");
            }

            if gate_results.all_pass && entry_block.is_none() {
                pruner_input.push(PrunerCandidate {
                    symbol: score.symbol.clone(),
                    score: score.score,
                    beta_btc: correlations.beta(&score.symbol, "BTCUSD"),
                    sector: self
                        .sectors
                        .get(&score.symbol)
                        .cloned()
                        .unwrap_or_else(|| "uncategorized".to_string()),
                    adv_usd: snapshot
                        .bars
                        .iter()
                        .rev()
                        .take(24)
                        .map(|b| b.volume * b.close)
                        .sum(),
                    position_size_pct: self.config.portfolio.max_single_position_pct,
                });
            }

            candidates.push(Candidate {
                symbol: score.symbol.clone(),
                timestamp: scan_ts,
                score: score.clone(),
                factors: factors.clone(),
                gates: gate_results,
                portfolio: None,
                decision: Decision::Reject,
                snapshot_saved: false,
            });
        }

        // --- Portfolio pruner ------------------------------------------------
        let decision = prune(&pruner_input, &self.config.portfolio, correlations.as_ref());

        for candidate in &mut candidates {
            if decision.accepted.contains(&candidate.symbol) {
                candidate.portfolio = Some(PortfolioOutcome {
                    accepted: true,
                    rejection_reason: None,
                });
                candidate.decision = Decision::Pass;
            } else if let Some(reason) = decision.rejection_reasons.get(&candidate.symbol) {
                candidate.portfolio = Some(PortfolioOutcome {
                    accepted: false,
                    rejection_reason: Some(reason.clone()),
                });
            }
        }

        // --- Alerts governor -------------------------------------------------
        for symbol in &decision.accepted {
            let Some(candidate) = candidates.iter().find(|c| &c.symbol == symbol) else {
                continue;
            };
            let passed_gates = candidate
                .gates
                .confirmation
                .as_ref()
                .map(|c| c.confirmation_count as u32)
                .unwrap_or(0);

            let verdict = self.alerts.evaluate(&AlertCandidate {
                symbol: symbol.clone(),
                score: candidate.score.score,
                passed_gates,
                is_high_vol: regime_state.regime.as_str() == "volatile",
            });
            if verdict.decision == AlertDecision::SendAlert {
                self.alerts.record_alert(symbol);
            }
            debug!(symbol = %symbol, decision = %verdict.decision, "alert governor verdict");
        }

        // --- Persistence ------------------------------------------------------
        let read_only = self.config.emergency.read_only_mode;
        if !read_only {
            self.persist(scan_ts, &mut candidates, &timeout_entries, &by_symbol, &scores)?;
            for symbol in &decision.accepted {
                self.ops.record_signal(symbol);
            }
        }

        let report = TickReport {
            scan_ts,
            regime: regime_state,
            universe_size: symbols.len(),
            scanned: by_symbol.len(),
            timed_out,
            skipped,
            guard_reports,
            accepted: decision.accepted.clone(),
            candidates,
            aborted: None,
        };

        if !read_only {
            self.write_tick_report(&report)?;
        }

        info!(
            scan_ts = %report.scan_ts,
            regime = %report.regime.regime,
            candidates = report.candidates.len(),
            accepted = report.accepted.len(),
            "tick complete"
        );

        Ok(report)
    }

    fn aborted_report(
        &self,
        scan_ts: DateTime<Utc>,
        regime: RegimeState,
        universe_size: usize,
        reason: &str,
    ) -> TickReport {
        TickReport {
            scan_ts,
            regime,
            universe_size,
            scanned: 0,
            timed_out: Vec::new(),
            skipped: HashMap::new(),
            guard_reports: Vec::new(),
            candidates: Vec::new(),
            accepted: Vec::new(),
            aborted: Some(reason.to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // Symbol fan-out
    // -------------------------------------------------------------------------

    /// Fetch + factor tasks, bounded by the semaphore, cancelled at the
    /// deadline. Returns (snapshots, skipped symbol -> reason, timed out).
    async fn collect_symbols(
        &self,
        symbols: &[String],
        deadline: tokio::time::Instant,
    ) -> (Vec<SymbolSnapshot>, HashMap<String, String>, Vec<String>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_scans));
        let mut join_set: JoinSet<(String, Result<SymbolSnapshot, ScanError>)> = JoinSet::new();

        for symbol in symbols {
            // Symbol validation happens at the ingest boundary; offenders
            // are skipped for the tick and audited by the artifact writer.
            if crate::universe::validate_symbol(symbol).is_err() {
                warn!(symbol = %symbol, "symbol failed validation — skipped for tick");
                continue;
            }

            let facade = self.facade.clone();
            let ops = self.ops.clone();
            let social = self.social.clone();
            let provider = self.config.venue.to_lowercase();
            let semaphore = semaphore.clone();
            let symbol = symbol.clone();

            join_set.spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(p) => p,
                    Err(_) => {
                        return (
                            symbol.clone(),
                            Err(ScanError::transient("scan semaphore closed")),
                        )
                    }
                };
                let result =
                    fetch_symbol(&facade, &ops, &provider, &symbol, social.as_deref()).await;
                (symbol, result)
            });
        }

        let expected: Vec<String> = symbols
            .iter()
            .filter(|s| crate::universe::validate_symbol(s).is_ok())
            .cloned()
            .collect();

        let mut snapshots = Vec::new();
        let mut skipped = HashMap::new();
        let mut completed: Vec<String> = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((symbol, result)))) => {
                    completed.push(symbol.clone());
                    match result {
                        Ok(snapshot) => snapshots.push(snapshot),
                        Err(e) => {
                            debug!(symbol = %symbol, error = %e, "symbol skipped");
                            skipped.insert(symbol, e.message);
                        }
                    }
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "symbol task panicked");
                }
                Ok(None) => break, // all tasks joined
                Err(_) => {
                    // Tick deadline: cancel everything still in flight.
                    warn!("tick deadline reached — cancelling in-flight symbol tasks");
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let timed_out: Vec<String> = expected
            .into_iter()
            .filter(|s| !completed.contains(s))
            .collect();

        (snapshots, skipped, timed_out)
    }

    // -------------------------------------------------------------------------
    // Gates
    // -------------------------------------------------------------------------

    fn evaluate_gates(
        &self,
        score: &CompositeScore,
        snapshot: &SymbolSnapshot,
        factors: &FactorSet,
        regime_state: &RegimeState,
    ) -> AllGateResults {
        let meta = &factors.metadata;
        let now = Utc::now();

        let mut confirmation_inputs = self.confirmation.confirmation_inputs(&score.symbol);
        confirmation_inputs.volume_ratio_24h = meta.volume_ratio_24h;

        let bars_age = {
            let last = snapshot
                .bars
                .last()
                .map(|b| b.timestamp)
                .unwrap_or(snapshot.bar_close_time);
            ((now - last).num_minutes().max(0) / 60) as u32
        };

        let inputs = GateInputs {
            micro: MicroInputs {
                spread_bps: snapshot.book.spread_bps(),
                depth_usd: snapshot.book.depth_usd(),
                vadr: vadr(&snapshot.bars, meta.volume_ratio_24h).unwrap_or(0.0),
            },
            timing: TimingInputs {
                current_price: snapshot.current_price,
                base_price: snapshot
                    .bars
                    .last()
                    .map(|b| b.close)
                    .unwrap_or(snapshot.current_price),
                atr: meta.atr_1h,
                bars_age,
                fill_time: now,
                bar_close_time: snapshot.bar_close_time,
            },
            return_24h: meta.return_24h,
            rsi_4h: meta.rsi_4h,
            acceleration: meta.acceleration,
            confirmation: confirmation_inputs,
        };

        gates::evaluate(
            &inputs,
            &self.config.entry_limits,
            &self.config.guards.for_regime(regime_state.regime.as_str()),
            &self.config.confirmation,
            regime_state.regime.as_str(),
        )
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn persist(
        &self,
        scan_ts: DateTime<Utc>,
        candidates: &mut [Candidate],
        timeout_entries: &[LedgerEntry],
        by_symbol: &HashMap<String, SymbolSnapshot>,
        scores: &[CompositeScore],
    ) -> Result<()> {
        let artifacts = std::path::Path::new(&self.config.artifacts_dir);

        // PIT snapshots of every candidate decision.
        for candidate in candidates.iter_mut() {
            let payload = serde_json::json!({
                "venue": self.facade.venue(),
                "score": candidate.score.score,
                "regime": candidate.score.regime,
                "gates_all_pass": candidate.gates.all_pass,
                "decision": candidate.decision.to_string(),
                "failure_reasons": candidate.gates.failure_reasons,
            });
            match self
                .pit
                .snapshot(&candidate.symbol, scan_ts, payload, Some("scanner"))
            {
                Ok(_) => candidate.snapshot_saved = true,
                Err(e) => {
                    // Fatal-runtime: abort the tick; earlier writes stay.
                    return Err(e).context(format!(
                        "PIT write failed for {} — aborting tick",
                        candidate.symbol
                    ));
                }
            }
        }

        // Ledger: every scored symbol plus the timeout markers.
        let mut entries: Vec<LedgerEntry> = Vec::with_capacity(scores.len());
        for score in scores {
            let all_pass = candidates
                .iter()
                .find(|c| c.symbol == score.symbol)
                .map(|c| c.gates.all_pass)
                .unwrap_or(false);
            let entry_price = by_symbol
                .get(&score.symbol)
                .map(|s| s.current_price)
                .unwrap_or(0.0);
            entries.push(LedgerEntry::new(
                scan_ts,
                score.symbol.clone(),
                score.score,
                all_pass,
                entry_price,
            ));
        }
        entries.extend_from_slice(timeout_entries);
        ledger::append_ledger(artifacts, &entries)?;

        ledger::write_candidates(artifacts, candidates)?;
        Ok(())
    }

    fn write_tick_report(&self, report: &TickReport) -> Result<()> {
        let artifacts = std::path::Path::new(&self.config.artifacts_dir);
        std::fs::create_dir_all(artifacts)
            .with_context(|| format!("failed to create {}", artifacts.display()))?;

        let path = artifacts.join(format!(
            "tick_{}.json",
            report.scan_ts.format("%Y%m%d_%H%M%S")
        ));
        let tmp = path.with_extension("json.tmp");
        let body =
            serde_json::to_string_pretty(report).context("failed to serialize tick report")?;
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }
}

/// Entry-policy floors applied between the gate cascade and the pruner:
/// composite score, 24h volume multiple, and the trend-quality indicators
/// (ADX strength, Hurst persistence). The indicator checks are skipped
/// when there was not enough history to compute them. Returns the first
/// violated floor.
fn entry_policy_blocks(
    limits: &EntryLimits,
    score: f64,
    meta: &FactorMetadata,
) -> Option<String> {
    if score < limits.min_score {
        return Some(format!("min_score:{score:.1}<{:.1}", limits.min_score));
    }
    if meta.volume_ratio_24h < limits.min_volume_multiple {
        return Some(format!(
            "min_volume_multiple:{:.2}<{:.2}",
            meta.volume_ratio_24h, limits.min_volume_multiple
        ));
    }
    if let Some(adx) = meta.adx {
        if adx < limits.min_adx {
            return Some(format!("min_adx:{adx:.1}<{:.1}", limits.min_adx));
        }
    }
    if let Some(hurst) = meta.hurst {
        if hurst < limits.min_hurst {
            return Some(format!("min_hurst:{hurst:.2}<{:.2}", limits.min_hurst));
        }
    }
    None
}

/// One symbol's fetch + factor computation. Runs inside the bounded task.
async fn fetch_symbol(
    facade: &DataFacade,
    ops: &OpsGuards,
    provider: &str,
    symbol: &str,
    social: Option<&dyn SocialProvider>,
) -> Result<SymbolSnapshot, ScanError> {
    // Historical bars for factors (trailing ~3 days of hourly data).
    let now = Utc::now();
    ops.record_api_call(provider);
    let history = facade
        .get_historical_slice(symbol, now - Duration::hours(72), now)
        .await?;
    let bars = match history.payload {
        Payload::Historical(bars) => bars,
        other => {
            return Err(ScanError::data_quality(format!(
                "historical read returned {:?} payload for {symbol}",
                other.kind()
            ))
            .with_offender(symbol.to_string()))
        }
    };

    // Venue-native order book.
    ops.record_api_call(provider);
    let book_env = facade.get_order_book(symbol).await?;
    let book = match book_env.payload {
        Payload::OrderBook(book) => book,
        other => {
            return Err(ScanError::data_quality(format!(
                "order-book read returned {:?} payload for {symbol}",
                other.kind()
            ))
            .with_offender(symbol.to_string()))
        }
    };

    // Latest price + 24h volume.
    ops.record_api_call(provider);
    let price_env = facade.get_price_data(symbol).await?;
    let (bar, volume_24h_usd) = match price_env.payload {
        Payload::Price {
            bar,
            volume_24h_usd,
        } => (bar, volume_24h_usd),
        other => {
            return Err(ScanError::data_quality(format!(
                "price read returned {:?} payload for {symbol}",
                other.kind()
            ))
            .with_offender(symbol.to_string()))
        }
    };

    let factors = compute_factors(symbol, &bars, &book, volume_24h_usd, social).ok_or_else(
        || {
            ScanError::data_quality(format!("insufficient history to compute factors for {symbol}"))
                .with_offender(symbol.to_string())
        },
    )?;

    // The latest bar closes one bar-interval after it opens.
    let bar_close_time = bar.timestamp + Duration::hours(1);

    Ok(SymbolSnapshot {
        factors,
        book,
        bars,
        current_price: bar.close,
        bar_close_time,
    })
}
