// =============================================================================
// Ops Guards — budget, call quota, correlation cap, venue health
// =============================================================================
//
// Evaluated at the top of each scan tick (and from the health surface).
// Severity ladder:
//
//   Budget      OK < soft_warn% <= WARN < hard_stop% <= BLOCK
//   Call quota  BLOCK on 10s burst excess, CRITICAL on minute excess,
//               WARN at 80% of the minute limit
//   Correlation BLOCK when the max pairwise correlation among the top-N
//               recent signals exceeds the cap
//   Venue       WARN per failing health dimension
//
// Any BLOCK vetoes the tick.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::OpsConfig;
use crate::ops::kpi::VenueHealthSample;
use crate::portfolio::CorrelationProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardStatus {
    Ok,
    Warn,
    Critical,
    Block,
}

impl std::fmt::Display for GuardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Warn => write!(f, "WARN"),
            Self::Critical => write!(f, "CRITICAL"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

/// One guard's verdict for the current tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardReport {
    pub name: String,
    pub status: GuardStatus,
    pub detail: String,
}

impl GuardReport {
    fn new(name: &str, status: GuardStatus, detail: String) -> Self {
        if status != GuardStatus::Ok {
            warn!(guard = name, status = %status, detail = %detail, "ops guard raised");
        }
        Self {
            name: name.to_string(),
            status,
            detail,
        }
    }
}

/// Shared guard state. Counters are monotonic adds behind per-window locks;
/// readers work on snapshot copies.
pub struct OpsGuards {
    config: OpsConfig,
    /// All API call timestamps in the trailing hour (budget).
    api_calls: Mutex<VecDeque<DateTime<Utc>>>,
    /// Per-provider call timestamps in the trailing minute (quota).
    provider_calls: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    /// Recent accepted signals for the correlation guard, newest last.
    recent_signals: Mutex<VecDeque<String>>,
}

impl OpsGuards {
    pub fn new(config: OpsConfig) -> Self {
        Self {
            config,
            api_calls: Mutex::new(VecDeque::new()),
            provider_calls: Mutex::new(HashMap::new()),
            recent_signals: Mutex::new(VecDeque::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    pub fn record_api_call(&self, provider: &str) {
        self.record_api_call_at(provider, Utc::now());
    }

    pub fn record_api_call_at(&self, provider: &str, at: DateTime<Utc>) {
        {
            let mut calls = self.api_calls.lock();
            calls.push_back(at);
            let cutoff = at - Duration::hours(1);
            while calls.front().is_some_and(|t| *t <= cutoff) {
                calls.pop_front();
            }
        }
        {
            let mut map = self.provider_calls.lock();
            let calls = map.entry(provider.to_string()).or_default();
            calls.push_back(at);
            let cutoff = at - Duration::minutes(1);
            while calls.front().is_some_and(|t| *t <= cutoff) {
                calls.pop_front();
            }
        }
    }

    /// Record an emitted signal for the correlation guard's lookback.
    pub fn record_signal(&self, symbol: &str) {
        let mut signals = self.recent_signals.lock();
        signals.push_back(symbol.to_string());
        while signals.len() > self.config.correlation.lookback_periods {
            signals.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Guards
    // -------------------------------------------------------------------------

    pub fn budget_status(&self) -> GuardReport {
        self.budget_status_at(Utc::now())
    }

    pub fn budget_status_at(&self, now: DateTime<Utc>) -> GuardReport {
        let cutoff = now - Duration::hours(1);
        let count = self
            .api_calls
            .lock()
            .iter()
            .filter(|t| **t > cutoff)
            .count();

        let limit = self.config.budget.hourly_limit as f64;
        let percent = if limit > 0.0 {
            count as f64 / limit * 100.0
        } else {
            0.0
        };

        let status = if percent >= self.config.budget.hard_stop_percent {
            GuardStatus::Block
        } else if percent >= self.config.budget.soft_warn_percent {
            GuardStatus::Warn
        } else {
            GuardStatus::Ok
        };

        GuardReport::new(
            "budget",
            status,
            format!(
                "{count}/{} calls this hour ({percent:.1}%)",
                self.config.budget.hourly_limit
            ),
        )
    }

    pub fn quota_status(&self, provider: &str) -> GuardReport {
        self.quota_status_at(provider, Utc::now())
    }

    pub fn quota_status_at(&self, provider: &str, now: DateTime<Utc>) -> GuardReport {
        let Some(quota) = self.config.call_quota_providers.get(provider) else {
            return GuardReport::new(
                "call_quota",
                GuardStatus::Ok,
                format!("no quota configured for {provider}"),
            );
        };

        let (minute_count, burst_count) = {
            let map = self.provider_calls.lock();
            match map.get(provider) {
                Some(calls) => {
                    let minute_cutoff = now - Duration::minutes(1);
                    let burst_cutoff = now - Duration::seconds(10);
                    (
                        calls.iter().filter(|t| **t > minute_cutoff).count(),
                        calls.iter().filter(|t| **t > burst_cutoff).count(),
                    )
                }
                None => (0, 0),
            }
        };

        let status = if burst_count > quota.burst_limit as usize {
            GuardStatus::Block
        } else if minute_count > quota.calls_per_minute as usize {
            GuardStatus::Critical
        } else if minute_count as f64 >= quota.calls_per_minute as f64 * 0.8 {
            GuardStatus::Warn
        } else {
            GuardStatus::Ok
        };

        GuardReport::new(
            "call_quota",
            status,
            format!(
                "{provider}: {minute_count}/{} per minute, {burst_count}/{} burst",
                quota.calls_per_minute, quota.burst_limit
            ),
        )
    }

    /// Max pairwise correlation among the most recent top-N signals.
    pub fn correlation_status(&self, correlations: &dyn CorrelationProvider) -> GuardReport {
        let signals: Vec<String> = {
            let recent = self.recent_signals.lock();
            let n = self.config.correlation.top_n_signals.min(recent.len());
            recent.iter().rev().take(n).cloned().collect()
        };

        let mut max_corr = 0.0f64;
        let mut worst_pair = None;
        for i in 0..signals.len() {
            for j in (i + 1)..signals.len() {
                let corr = correlations.correlation(&signals[i], &signals[j]).abs();
                if corr > max_corr {
                    max_corr = corr;
                    worst_pair = Some((signals[i].clone(), signals[j].clone()));
                }
            }
        }

        let cap = self.config.correlation.max_correlation;
        let status = if max_corr > cap {
            GuardStatus::Block
        } else {
            GuardStatus::Ok
        };

        let detail = match worst_pair {
            Some((a, b)) => format!("max pairwise {max_corr:.2} ({a}/{b}), cap {cap:.2}"),
            None => format!("fewer than two recent signals, cap {cap:.2}"),
        };

        GuardReport::new("correlation", status, detail)
    }

    pub fn venue_health_status(&self, sample: &VenueHealthSample) -> GuardReport {
        let cfg = &self.config.venue_health;
        let mut failures = Vec::new();

        if sample.uptime_percent < cfg.min_uptime_percent {
            failures.push(format!(
                "uptime {:.2}% < {:.2}%",
                sample.uptime_percent, cfg.min_uptime_percent
            ));
        }
        if sample.p99_latency_ms > cfg.max_latency_ms {
            failures.push(format!(
                "p99 {:.0}ms > {:.0}ms",
                sample.p99_latency_ms, cfg.max_latency_ms
            ));
        }
        if sample.depth_usd < cfg.min_depth_usd {
            failures.push(format!(
                "depth ${:.0} < ${:.0}",
                sample.depth_usd, cfg.min_depth_usd
            ));
        }
        if sample.spread_bps > cfg.max_spread_bps {
            failures.push(format!(
                "spread {:.1}bps > {:.1}bps",
                sample.spread_bps, cfg.max_spread_bps
            ));
        }

        if failures.is_empty() {
            GuardReport::new(
                "venue_health",
                GuardStatus::Ok,
                format!("{} healthy", sample.venue),
            )
        } else {
            GuardReport::new(
                "venue_health",
                GuardStatus::Warn,
                format!("{}: {}", sample.venue, failures.join(", ")),
            )
        }
    }

    /// All guards for the tick. The scanner skips the tick when any report
    /// is BLOCK.
    pub fn evaluate_all(
        &self,
        providers: &[String],
        correlations: &dyn CorrelationProvider,
        venue_samples: &[VenueHealthSample],
    ) -> Vec<GuardReport> {
        let mut reports = vec![self.budget_status()];
        for provider in providers {
            reports.push(self.quota_status(provider));
        }
        reports.push(self.correlation_status(correlations));
        for sample in venue_samples {
            reports.push(self.venue_health_status(sample));
        }

        debug!(
            blocks = reports.iter().filter(|r| r.status == GuardStatus::Block).count(),
            total = reports.len(),
            "ops guards evaluated"
        );
        reports
    }
}

/// Whether any report vetoes the tick.
pub fn any_block(reports: &[GuardReport]) -> bool {
    reports.iter().any(|r| r.status == GuardStatus::Block)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, CallQuotaConfig, CorrelationGuardConfig};
    use crate::portfolio::StaticCorrelations;

    fn ops(hourly_limit: u32) -> OpsGuards {
        let mut config = OpsConfig::default();
        config.budget = BudgetConfig {
            hourly_limit,
            soft_warn_percent: 70.0,
            hard_stop_percent: 95.0,
        };
        config.call_quota_providers.insert(
            "kraken".to_string(),
            CallQuotaConfig {
                calls_per_minute: 10,
                burst_limit: 3,
            },
        );
        config.correlation = CorrelationGuardConfig {
            max_correlation: 0.65,
            top_n_signals: 10,
            lookback_periods: 20,
        };
        OpsGuards::new(config)
    }

    #[test]
    fn budget_ladders_through_statuses() {
        let guards = ops(100);
        let now = Utc::now();

        for _ in 0..60 {
            guards.record_api_call_at("kraken", now);
        }
        assert_eq!(guards.budget_status_at(now).status, GuardStatus::Ok);

        for _ in 0..15 {
            guards.record_api_call_at("kraken", now);
        }
        assert_eq!(guards.budget_status_at(now).status, GuardStatus::Warn);

        for _ in 0..20 {
            guards.record_api_call_at("kraken", now);
        }
        assert_eq!(guards.budget_status_at(now).status, GuardStatus::Block);
    }

    #[test]
    fn budget_window_slides() {
        let guards = ops(10);
        let start = Utc::now();
        for _ in 0..10 {
            guards.record_api_call_at("kraken", start);
        }
        assert_eq!(guards.budget_status_at(start).status, GuardStatus::Block);
        // An hour later the window has drained.
        assert_eq!(
            guards.budget_status_at(start + Duration::minutes(61)).status,
            GuardStatus::Ok
        );
    }

    #[test]
    fn quota_burst_blocks() {
        let guards = ops(1000);
        let now = Utc::now();
        for _ in 0..4 {
            guards.record_api_call_at("kraken", now);
        }
        // 4 calls in 10s > burst 3.
        assert_eq!(guards.quota_status_at("kraken", now).status, GuardStatus::Block);
    }

    #[test]
    fn quota_minute_excess_is_critical() {
        let guards = ops(1000);
        let now = Utc::now();
        // Spread 11 calls over the minute so no 10s burst forms.
        for i in 0..11 {
            guards.record_api_call_at("kraken", now - Duration::seconds(55 - i * 5));
        }
        let report = guards.quota_status_at("kraken", now);
        assert_eq!(report.status, GuardStatus::Critical);
    }

    #[test]
    fn quota_warns_at_eighty_percent() {
        let guards = ops(1000);
        let now = Utc::now();
        for i in 0..8 {
            guards.record_api_call_at("kraken", now - Duration::seconds(55 - i * 6));
        }
        assert_eq!(guards.quota_status_at("kraken", now).status, GuardStatus::Warn);
    }

    #[test]
    fn unconfigured_provider_quota_is_ok() {
        let guards = ops(1000);
        assert_eq!(guards.quota_status("unknown").status, GuardStatus::Ok);
    }

    #[test]
    fn correlation_guard_blocks_crowded_signals() {
        let guards = ops(1000);
        let mut corr = StaticCorrelations::new();
        corr.set("BTCUSD", "ETHUSD", 0.90);

        guards.record_signal("BTCUSD");
        guards.record_signal("ETHUSD");

        let report = guards.correlation_status(&corr);
        assert_eq!(report.status, GuardStatus::Block);
        assert!(report.detail.contains("0.90"));
    }

    #[test]
    fn correlation_guard_ok_when_diverse() {
        let guards = ops(1000);
        let corr = StaticCorrelations::new();
        guards.record_signal("BTCUSD");
        guards.record_signal("ETHUSD");
        assert_eq!(guards.correlation_status(&corr).status, GuardStatus::Ok);
    }

    #[test]
    fn venue_health_warns_per_dimension() {
        let guards = ops(1000);
        let sample = VenueHealthSample {
            venue: "KRAKEN".to_string(),
            uptime_percent: 97.0,
            p99_latency_ms: 800.0,
            depth_usd: 50_000.0,
            spread_bps: 80.0,
            observed_at: Utc::now(),
        };
        let report = guards.venue_health_status(&sample);
        assert_eq!(report.status, GuardStatus::Warn);
        assert!(report.detail.contains("uptime"));
        assert!(report.detail.contains("p99"));
    }

    #[test]
    fn any_block_detects_vetoes() {
        let reports = vec![
            GuardReport::new("a", GuardStatus::Ok, String::new()),
            GuardReport::new("b", GuardStatus::Warn, String::new()),
        ];
        assert!(!any_block(&reports));

        let reports = vec![GuardReport::new("c", GuardStatus::Block, String::new())];
        assert!(any_block(&reports));
    }
}
