// =============================================================================
// CryptoRun — Momentum Scanner Entry Point
// =============================================================================
//
// The composition root: everything (guards, KPI tracker, PIT store, config)
// is constructed exactly once here and passed down by reference. There are
// no global singletons; tests construct their own instances.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod config;
mod data;
mod error;
mod factors;
mod gates;
mod indicators;
mod ledger;
mod ops;
mod pit;
mod portfolio;
mod provider;
mod regime;
mod scanner;
mod scoring;
mod universe;

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertsGovernor;
use crate::config::ScanConfig;
use crate::data::cold::ColdTier;
use crate::data::facade::DataFacade;
use crate::data::hot::{self, HotTier};
use crate::data::warm::WarmTier;
use crate::ops::guards::OpsGuards;
use crate::ops::kpi::KpiTracker;
use crate::pit::PitStore;
use crate::provider::guard::ProviderGuard;
use crate::provider::kraken::KrakenClient;
use crate::regime::RegimeDetector;
use crate::scanner::{NeutralConfirmationSource, Scanner, TickReport};
use crate::universe::Universe;

#[derive(Parser)]
#[command(name = "cryptorun", about = "Cryptocurrency momentum scanner", version)]
struct Cli {
    /// Path to the scan configuration file.
    #[arg(long, default_value = "scan_config.json")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single scan tick and print the top candidates.
    Scan,
    /// Run scan ticks on the configured interval until Ctrl+C.
    Monitor,
    /// Verify the engine's core invariants offline.
    Selftest,
    /// Print provider, venue, and KPI health.
    Health,
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            // Single summary line naming the kind and first offender.
            eprintln!("cryptorun: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match ScanConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "config not loaded — using defaults");
            ScanConfig::default()
        }
    };

    // Config errors are fatal at startup.
    if let Err(e) = config.validate() {
        anyhow::bail!("{}", e.summary_line());
    }

    match cli.command {
        Command::Scan => {
            let engine = Engine::build(config);
            let symbols = engine.universe_symbols()?;
            engine.spawn_hot_stream(&symbols);
            let report = engine.scanner.run_tick(&symbols).await?;
            print_tick_summary(&report);
            Ok(())
        }
        Command::Monitor => {
            let engine = Engine::build(config);
            let symbols = engine.universe_symbols()?;
            engine.spawn_hot_stream(&symbols);
            engine.monitor_loop(&symbols).await
        }
        Command::Selftest => selftest(&config).await,
        Command::Health => {
            let engine = Engine::build(config);
            engine.print_health();
            Ok(())
        }
    }
}

// =============================================================================
// Engine wiring
// =============================================================================

struct Engine {
    config: ScanConfig,
    facade: Arc<DataFacade>,
    hot: Arc<HotTier>,
    kpi: Arc<KpiTracker>,
    pit: Arc<PitStore>,
    scanner: Scanner,
}

impl Engine {
    fn build(config: ScanConfig) -> Self {
        let provider_name = config.venue.to_lowercase();
        let guard = ProviderGuard::new(&provider_name, config.provider_guard(&provider_name));
        let client = KrakenClient::new(config.provider_guard(&provider_name).timeout_seconds);

        let hot = HotTier::new(&config.venue, config.hot_stale_threshold_ms);
        let warm = WarmTier::new(
            &config.venue,
            client,
            guard.clone(),
            config.provider_guard(&provider_name).ttl_seconds,
        );
        let cold = ColdTier::new(&config.cold_base_dir, &config.venue);

        let kpi = KpiTracker::standard();
        kpi.register_guard(guard);

        let facade = Arc::new(DataFacade::new(
            &config.venue,
            hot.clone(),
            warm,
            cold,
            kpi.clone(),
        ));

        let pit = Arc::new(PitStore::new(&config.pit_base_dir));

        let scanner = Scanner::new(
            config.clone(),
            facade.clone(),
            RegimeDetector::new(),
            kpi.clone(),
            Arc::new(OpsGuards::new(config.ops.clone())),
            pit.clone(),
            Arc::new(AlertsGovernor::new(config.alerts.clone())),
            Arc::new(NeutralConfirmationSource),
            None,
            HashMap::new(),
        );

        Self {
            config,
            facade,
            hot,
            kpi,
            pit,
            scanner,
        }
    }

    /// Symbols for this run: the synced universe file when configured,
    /// else a small default set.
    fn universe_symbols(&self) -> anyhow::Result<Vec<String>> {
        match &self.config.universe_file {
            Some(path) => {
                let universe = Universe::load(path)?;
                if universe.venue != self.config.venue {
                    warn!(
                        universe_venue = %universe.venue,
                        config_venue = %self.config.venue,
                        "universe venue differs from configured venue"
                    );
                }
                Ok(universe.tradeable())
            }
            None => Ok(vec![
                "BTCUSD".to_string(),
                "ETHUSD".to_string(),
                "SOLUSD".to_string(),
                "XRPUSD".to_string(),
                "ADAUSD".to_string(),
            ]),
        }
    }

    /// Launch the hot-tier WebSocket stream with reconnect backoff.
    fn spawn_hot_stream(&self, symbols: &[String]) {
        let tier = self.hot.clone();
        let symbols = symbols.to_vec();
        tokio::spawn(async move {
            loop {
                if let Err(e) = hot::run_ticker_stream(&symbols, &tier).await {
                    error!(error = %e, "ticker stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    async fn monitor_loop(&self, symbols: &[String]) -> anyhow::Result<()> {
        info!(
            interval_s = self.config.scan_interval_seconds,
            symbols = symbols.len(),
            "monitor loop starting"
        );

        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
            self.config.scan_interval_seconds,
        ));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.scanner.run_tick(symbols).await {
                        Ok(report) => print_tick_summary(&report),
                        Err(e) => error!(error = %e, "tick failed"),
                    }

                    if let Err(e) = self.pit.cleanup(self.config.pit_retention_days) {
                        warn!(error = %e, "PIT cleanup failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("shutdown signal received — stopping monitor");
                    return Ok(());
                }
            }
        }
    }

    fn print_health(&self) {
        println!("provider guards:");
        for snap in self.kpi.guard_snapshots() {
            println!(
                "  {:<10} breaker={:<9} requests={} errors={} cache {}h/{}m trips={}",
                snap.provider,
                snap.breaker.to_string(),
                snap.requests,
                snap.errors,
                snap.cache_hits,
                snap.cache_misses,
                snap.breaker_trips
            );
        }

        let rollup = self.kpi.rollup();
        println!(
            "kpi: fallbacks={} checksum_mismatches={} open_breakers={:?}",
            rollup.fallbacks_used, rollup.checksum_mismatches, rollup.open_breakers
        );

        println!(
            "hot tier: connected={} cached_symbols={}",
            self.facade.hot().is_connected(),
            self.facade.hot().cached_symbols().len()
        );

        if rollup.venues.is_empty() {
            println!("venue health: no samples yet");
        }
        for venue in &rollup.venues {
            println!(
                "venue {}: uptime={:.2}% p99={:.0}ms depth=${:.0} spread={:.1}bps",
                venue.venue,
                venue.uptime_percent,
                venue.p99_latency_ms,
                venue.depth_usd,
                venue.spread_bps
            );
        }
    }
}

/// Top-5 stdout table with pass/fail badges; the machine-readable version
/// lands in the tick's artifact directory.
fn print_tick_summary(report: &TickReport) {
    if let Some(reason) = &report.aborted {
        println!("tick aborted: {reason}");
        return;
    }

    println!(
        "scan {} | regime {} (confidence {:.2}) | {} scanned, {} accepted",
        report.scan_ts.format("%Y-%m-%d %H:%M:%S"),
        report.regime.regime,
        report.regime.confidence,
        report.scanned,
        report.accepted.len()
    );
    println!("{:<10} {:>7} {:^7} {:^9} {}", "SYMBOL", "SCORE", "GATES", "DECISION", "REASONS");

    for candidate in report.candidates.iter().take(5) {
        let gates = if candidate.gates.all_pass { "PASS" } else { "FAIL" };
        let reasons = if candidate.gates.failure_reasons.is_empty() {
            String::from("-")
        } else {
            candidate.gates.failure_reasons.join(",")
        };
        println!(
            "{:<10} {:>7.1} {:^7} {:^9} {}",
            candidate.symbol,
            candidate.score.score,
            gates,
            candidate.decision.to_string(),
            reasons
        );
    }
}

// =============================================================================
// Selftest
// =============================================================================

/// Offline verification of the engine's core invariants. Exits non-zero on
/// the first failure.
async fn selftest(config: &ScanConfig) -> anyhow::Result<()> {
    use crate::config::{FACTOR_MOMENTUM, FACTOR_SOCIAL};
    use crate::factors::{CrossSection, FactorMetadata, FactorSet};
    use crate::provider::guard::{BreakerState, FetchError};

    let mut failures = 0usize;
    let mut check = |name: &str, ok: bool| {
        println!("{:<40} {}", name, if ok { "PASS" } else { "FAIL" });
        if !ok {
            failures += 1;
        }
    };

    // 1. Config invariants.
    check("config: validation", config.validate().is_ok());
    check(
        "config: protected factor first",
        config.orthogonalization_sequence.first().map(String::as_str) == Some(FACTOR_MOMENTUM),
    );

    // 2. Orthogonalization preserves the protected factor and caps social.
    let mut xs = CrossSection::new();
    for (symbol, momentum, social) in
        [("BTCUSD", 5.0, 12.0), ("ETHUSD", 3.0, -14.0), ("SOLUSD", -1.0, 4.0)]
    {
        let _ = xs.push(FactorSet {
            symbol: symbol.to_string(),
            timestamp: chrono::Utc::now(),
            momentum_core: momentum,
            technical: momentum * 0.5 + 1.0,
            volume: 2.0,
            quality: 3.0,
            social,
            metadata: FactorMetadata::default(),
        });
    }
    let before = xs.column(FACTOR_MOMENTUM);
    let cap = config.weights.validation.social_hard_cap;
    crate::factors::orthogonal::orthogonalize(
        &mut xs,
        &config.orthogonalization_sequence,
        cap,
    );
    check(
        "orthogonalization: momentum preserved",
        xs.column(FACTOR_MOMENTUM) == before,
    );
    check(
        "orthogonalization: social capped",
        xs.column(FACTOR_SOCIAL).iter().all(|v| v.abs() <= cap + 1e-9),
    );

    // 3. Breaker transitions without any network.
    let guard = ProviderGuard::new(
        "selftest",
        crate::config::ProviderGuardConfig {
            window_requests: 2,
            failure_threshold: 0.5,
            max_retries: 0,
            probe_interval_seconds: 0,
            ..Default::default()
        },
    );
    for i in 0..2 {
        let key = format!("k{i}");
        let _ = guard
            .fetch(&key, || async {
                Err::<serde_json::Value, _>(FetchError::Timeout)
            })
            .await;
    }
    let opened = guard.breaker_state() != BreakerState::Closed;
    let probe = guard.fetch("probe", || async { Ok(serde_json::json!({})) }).await;
    check("breaker: opens on failures", opened);
    check(
        "breaker: half-open probe recovers",
        probe.is_ok() && guard.breaker_state() == BreakerState::Closed,
    );

    // 4. PIT round-trip in a scratch directory.
    let scratch = std::env::temp_dir().join(format!("cryptorun-selftest-{}", uuid::Uuid::new_v4()));
    let store = PitStore::new(&scratch);
    let when = chrono::Utc::now();
    let wrote = store
        .snapshot("SELFTEST", when, serde_json::json!({"venue": "KRAKEN"}), None)
        .unwrap_or(false);
    let reread = store.read("SELFTEST", when).is_ok();
    let duplicate_noop = store
        .snapshot("SELFTEST", when, serde_json::json!({"venue": "OTHER"}), None)
        .map(|wrote_again| !wrote_again)
        .unwrap_or(false);
    check("pit: write + read", wrote && reread);
    check("pit: duplicate timestamp is no-op", duplicate_noop);
    let _ = std::fs::remove_dir_all(&scratch);

    // 5. Symbol normalization idempotence.
    let idempotent = ["BTC", "ethusd", "SOLUSDUSD"].iter().all(|raw| {
        match crate::universe::normalize_symbol(raw) {
            Ok(once) => crate::universe::normalize_symbol(&once).as_deref() == Ok(once.as_str()),
            Err(_) => false,
        }
    });
    check("universe: normalization idempotent", idempotent);

    if failures > 0 {
        anyhow::bail!("config: selftest failed {failures} check(s)");
    }
    println!("selftest: all checks passed");
    Ok(())
}
