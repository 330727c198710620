// =============================================================================
// Alerts Governor — rate limits with regime boost and manual override
// =============================================================================
//
// Per-symbol rolling windows over 1h and 24h. Decision order:
//
//   1. Manual override: score >= ManualOverrideScore while passed gates are
//      BELOW ManualOverrideGates — allowed as `alert_only` (no trading
//      action) and never blocked by rate limits.
//   2. Rate limits: the hourly cap switches to the high-volatility cap when
//      the regime is volatile; the daily cap always applies. A per-symbol
//      cooldown suppresses repeats inside its window.
//   3. Otherwise: defer to the next hour.
//
// Evaluation never mutates state; `record_alert` is an explicit second
// step so callers can evaluate without committing.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AlertsConfig;

/// Outcome of one governor evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertDecision {
    SendAlert,
    /// Manual override: surface the alert, suppress any trading action.
    AlertOnly,
    DeferToNextHour,
}

impl std::fmt::Display for AlertDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendAlert => write!(f, "send_alert"),
            Self::AlertOnly => write!(f, "alert_only"),
            Self::DeferToNextHour => write!(f, "defer_to_next_hour"),
        }
    }
}

/// Full evaluation verdict with the counters that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertVerdict {
    pub symbol: String,
    pub decision: AlertDecision,
    pub override_applied: bool,
    pub hourly_count: usize,
    pub daily_count: usize,
    pub effective_hourly_limit: u32,
    pub reason: String,
}

/// Candidate attributes the governor looks at.
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub symbol: String,
    pub score: f64,
    pub passed_gates: u32,
    pub is_high_vol: bool,
}

/// Rate-limit governor. One instance per engine; per-symbol state inside.
pub struct AlertsGovernor {
    config: AlertsConfig,
    /// Sent-alert timestamps per symbol, trimmed to the trailing 24h.
    sent: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl AlertsGovernor {
    pub fn new(config: AlertsConfig) -> Self {
        Self {
            config,
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate a candidate WITHOUT committing. Call `record_alert` after
    /// actually sending.
    pub fn evaluate(&self, candidate: &AlertCandidate) -> AlertVerdict {
        self.evaluate_at(candidate, Utc::now())
    }

    /// Clock-injected evaluation (tests drive the windows directly).
    pub fn evaluate_at(&self, candidate: &AlertCandidate, now: DateTime<Utc>) -> AlertVerdict {
        let (hourly_count, daily_count, last_sent) = self.counts(&candidate.symbol, now);

        let effective_hourly = if candidate.is_high_vol {
            self.config.high_vol_hourly_limit
        } else {
            self.config.hourly_limit
        };

        // 1. Manual override precedence: exceptional score with too few
        //    passed gates surfaces as alert_only, immune to rate limits.
        if candidate.score >= self.config.manual_override_score
            && candidate.passed_gates < self.config.manual_override_gates
        {
            info!(
                symbol = %candidate.symbol,
                score = candidate.score,
                passed_gates = candidate.passed_gates,
                "manual override — alert_only"
            );
            return AlertVerdict {
                symbol: candidate.symbol.clone(),
                decision: AlertDecision::AlertOnly,
                override_applied: true,
                hourly_count,
                daily_count,
                effective_hourly_limit: effective_hourly,
                reason: format!(
                    "score {:.1} >= {:.1} with {} gates < {}",
                    candidate.score,
                    self.config.manual_override_score,
                    candidate.passed_gates,
                    self.config.manual_override_gates
                ),
            };
        }

        // 2. Cooldown.
        if let Some(last) = last_sent {
            let elapsed = (now - last).num_seconds();
            if elapsed < self.config.cooldown_seconds {
                return self.deny(
                    candidate,
                    hourly_count,
                    daily_count,
                    effective_hourly,
                    format!(
                        "cooldown: {elapsed}s since last alert < {}s",
                        self.config.cooldown_seconds
                    ),
                );
            }
        }

        // 3. Rate limits.
        if hourly_count < effective_hourly as usize
            && daily_count < self.config.daily_limit as usize
        {
            AlertVerdict {
                symbol: candidate.symbol.clone(),
                decision: AlertDecision::SendAlert,
                override_applied: false,
                hourly_count,
                daily_count,
                effective_hourly_limit: effective_hourly,
                reason: format!(
                    "within limits: {hourly_count}/{effective_hourly} hourly, {daily_count}/{} daily",
                    self.config.daily_limit
                ),
            }
        } else {
            self.deny(
                candidate,
                hourly_count,
                daily_count,
                effective_hourly,
                format!(
                    "rate limited: {hourly_count}/{effective_hourly} hourly, {daily_count}/{} daily",
                    self.config.daily_limit
                ),
            )
        }
    }

    fn deny(
        &self,
        candidate: &AlertCandidate,
        hourly_count: usize,
        daily_count: usize,
        effective_hourly: u32,
        reason: String,
    ) -> AlertVerdict {
        debug!(symbol = %candidate.symbol, reason = %reason, "alert deferred");
        AlertVerdict {
            symbol: candidate.symbol.clone(),
            decision: AlertDecision::DeferToNextHour,
            override_applied: false,
            hourly_count,
            daily_count,
            effective_hourly_limit: effective_hourly,
            reason,
        }
    }

    /// Commit a sent alert into the rolling windows.
    pub fn record_alert(&self, symbol: &str) {
        self.record_alert_at(symbol, Utc::now());
    }

    pub fn record_alert_at(&self, symbol: &str, at: DateTime<Utc>) {
        let mut sent = self.sent.lock();
        let entries = sent.entry(symbol.to_string()).or_default();
        entries.push(at);

        // Trim beyond the daily window while we hold the lock.
        let cutoff = at - Duration::hours(24);
        entries.retain(|t| *t > cutoff);
    }

    fn counts(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> (usize, usize, Option<DateTime<Utc>>) {
        let sent = self.sent.lock();
        match sent.get(symbol) {
            Some(entries) => {
                let hour_cutoff = now - Duration::hours(1);
                let day_cutoff = now - Duration::hours(24);
                let hourly = entries.iter().filter(|t| **t > hour_cutoff).count();
                let daily = entries.iter().filter(|t| **t > day_cutoff).count();
                (hourly, daily, entries.last().copied())
            }
            None => (0, 0, None),
        }
    }
}
