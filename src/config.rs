// =============================================================================
// Scan Configuration — regime weights, gate thresholds, ops budgets
// =============================================================================
//
// Central configuration hub for the CryptoRun scan engine. Every tunable
// parameter lives here so a deployment can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// `validate()` runs once at startup and is fatal on error: regime weight
// vectors must sum to 1.0 within tolerance, respect the momentum/social
// bounds, and the orthogonalization sequence must start with the protected
// factor.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ErrorKind, ScanError};

/// Factor identifiers used in weight vectors and the orthogonalization
/// sequence. `momentum_core` is the protected factor.
pub const FACTOR_MOMENTUM: &str = "momentum_core";
pub const FACTOR_TECHNICAL: &str = "technical_residual";
pub const FACTOR_VOLUME: &str = "volume_residual";
pub const FACTOR_QUALITY: &str = "quality_residual";
pub const FACTOR_SOCIAL: &str = "social_residual";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_venue() -> String {
    "KRAKEN".to_string()
}

fn default_max_concurrent_scans() -> usize {
    8
}

fn default_scan_timeout_seconds() -> u64 {
    45
}

fn default_scan_interval_seconds() -> u64 {
    300
}

fn default_top_n() -> usize {
    20
}

fn default_artifacts_dir() -> String {
    "artifacts".to_string()
}

fn default_weight_sum_tolerance() -> f64 {
    0.005
}

fn default_min_momentum_weight() -> f64 {
    0.40
}

fn default_max_social_weight() -> f64 {
    0.10
}

fn default_social_hard_cap() -> f64 {
    10.0
}

fn default_sequence() -> Vec<String> {
    vec![
        FACTOR_MOMENTUM.to_string(),
        FACTOR_TECHNICAL.to_string(),
        FACTOR_VOLUME.to_string(),
        FACTOR_QUALITY.to_string(),
        FACTOR_SOCIAL.to_string(),
    ]
}

fn default_regime_weights() -> HashMap<String, WeightVector> {
    let mut map = HashMap::new();
    map.insert(
        "calm".to_string(),
        WeightVector {
            momentum_core: 0.40,
            technical_residual: 0.25,
            volume_residual: 0.20,
            quality_residual: 0.10,
            social_residual: 0.05,
        },
    );
    map.insert(
        "normal".to_string(),
        WeightVector {
            momentum_core: 0.45,
            technical_residual: 0.22,
            volume_residual: 0.18,
            quality_residual: 0.10,
            social_residual: 0.05,
        },
    );
    map.insert(
        "volatile".to_string(),
        WeightVector {
            momentum_core: 0.50,
            technical_residual: 0.20,
            volume_residual: 0.15,
            quality_residual: 0.10,
            social_residual: 0.05,
        },
    );
    map
}

fn default_score_steepness() -> f64 {
    1.2
}

fn default_min_score() -> f64 {
    75.0
}

fn default_min_vadr() -> f64 {
    1.75
}

fn default_max_spread_bps() -> f64 {
    50.0
}

fn default_min_depth_usd() -> f64 {
    100_000.0
}

fn default_min_funding_divergence_sigma() -> f64 {
    2.0
}

fn default_min_volume_multiple() -> f64 {
    1.5
}

fn default_min_adx() -> f64 {
    20.0
}

fn default_min_hurst() -> f64 {
    0.50
}

fn default_fatigue_return_24h() -> f64 {
    12.0
}

fn default_fatigue_rsi_4h() -> f64 {
    70.0
}

fn default_freshness_atr_factor() -> f64 {
    1.2
}

fn default_freshness_max_bars_age() -> u32 {
    2
}

fn default_late_fill_max_delay_seconds() -> i64 {
    30
}

fn default_whale_threshold() -> f64 {
    0.70
}

fn default_supply_squeeze_threshold() -> f64 {
    0.60
}

fn default_volume_confirmation_threshold() -> f64 {
    2.5
}

fn default_volume_boost_regimes() -> Vec<String> {
    // Must use the regime detector's vocabulary (calm/normal/volatile) or
    // the boost never fires in the wired pipeline.
    vec!["volatile".to_string()]
}

fn default_correlation_cap() -> f64 {
    0.65
}

fn default_beta_budget() -> f64 {
    2.0
}

fn default_max_single_position_pct() -> f64 {
    5.0
}

fn default_max_total_exposure_pct() -> f64 {
    20.0
}

fn default_sector_caps() -> HashMap<String, usize> {
    let mut map = HashMap::new();
    map.insert("l1".to_string(), 3);
    map.insert("defi".to_string(), 2);
    map.insert("meme".to_string(), 1);
    map
}

fn default_alert_hourly_limit() -> u32 {
    3
}

fn default_alert_daily_limit() -> u32 {
    10
}

fn default_alert_high_vol_hourly_limit() -> u32 {
    6
}

fn default_manual_override_score() -> f64 {
    90.0
}

fn default_manual_override_gates() -> u32 {
    2
}

fn default_alert_cooldown_seconds() -> i64 {
    900
}

fn default_budget_hourly_limit() -> u32 {
    3600
}

fn default_soft_warn_percent() -> f64 {
    70.0
}

fn default_hard_stop_percent() -> f64 {
    95.0
}

fn default_quota_providers() -> HashMap<String, CallQuotaConfig> {
    let mut map = HashMap::new();
    map.insert(
        "kraken".to_string(),
        CallQuotaConfig {
            calls_per_minute: 60,
            burst_limit: 10,
        },
    );
    map
}

fn default_max_correlation() -> f64 {
    0.65
}

fn default_top_n_signals() -> usize {
    10
}

fn default_lookback_periods() -> usize {
    20
}

fn default_guard_ttl_seconds() -> u64 {
    30
}

fn default_guard_burst_limit() -> u32 {
    10
}

fn default_guard_sustained_rate() -> f64 {
    1.0
}

fn default_guard_max_retries() -> u32 {
    3
}

fn default_guard_backoff_base_ms() -> u64 {
    250
}

fn default_guard_failure_threshold() -> f64 {
    0.5
}

fn default_guard_window_requests() -> usize {
    10
}

fn default_guard_probe_interval_seconds() -> u64 {
    30
}

fn default_provider_timeout_seconds() -> u64 {
    10
}

fn default_hot_stale_threshold_ms() -> i64 {
    5_000
}

fn default_pit_base_dir() -> String {
    "artifacts/pit".to_string()
}

fn default_pit_retention_days() -> i64 {
    30
}

fn default_cold_base_dir() -> String {
    "data/historical".to_string()
}

fn default_min_uptime_percent() -> f64 {
    99.0
}

fn default_max_latency_ms() -> f64 {
    500.0
}

// =============================================================================
// Weight vectors
// =============================================================================

/// Regime weight vector over the five orthogonalized factors. Must sum to
/// 1.0 within `weight_sum_tolerance`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightVector {
    pub momentum_core: f64,
    pub technical_residual: f64,
    pub volume_residual: f64,
    pub quality_residual: f64,
    pub social_residual: f64,
}

impl WeightVector {
    pub fn sum(&self) -> f64 {
        self.momentum_core
            + self.technical_residual
            + self.volume_residual
            + self.quality_residual
            + self.social_residual
    }

    /// Weight for a named factor; unknown names get 0.
    pub fn get(&self, factor: &str) -> f64 {
        match factor {
            FACTOR_MOMENTUM => self.momentum_core,
            FACTOR_TECHNICAL => self.technical_residual,
            FACTOR_VOLUME => self.volume_residual,
            FACTOR_QUALITY => self.quality_residual,
            FACTOR_SOCIAL => self.social_residual,
            _ => 0.0,
        }
    }
}

/// Validation bounds applied to every regime weight vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightValidation {
    #[serde(default = "default_weight_sum_tolerance")]
    pub weight_sum_tolerance: f64,
    #[serde(default = "default_min_momentum_weight")]
    pub min_momentum_weight: f64,
    #[serde(default = "default_max_social_weight")]
    pub max_social_weight: f64,
    /// Hard clamp applied to the social factor after orthogonalization
    /// (symmetric on the negative side).
    #[serde(default = "default_social_hard_cap")]
    pub social_hard_cap: f64,
}

impl Default for WeightValidation {
    fn default() -> Self {
        Self {
            weight_sum_tolerance: default_weight_sum_tolerance(),
            min_momentum_weight: default_min_momentum_weight(),
            max_social_weight: default_max_social_weight(),
            social_hard_cap: default_social_hard_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsConfig {
    #[serde(default = "default_regime_weights")]
    pub regimes: HashMap<String, WeightVector>,
    #[serde(default)]
    pub validation: WeightValidation,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            regimes: default_regime_weights(),
            validation: WeightValidation::default(),
        }
    }
}

// =============================================================================
// Gate thresholds
// =============================================================================

/// Per-regime guard thresholds for the timing/fatigue gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardThresholds {
    /// 24h return (percent) above which fatigue can trip.
    #[serde(default = "default_fatigue_return_24h")]
    pub fatigue_return_24h: f64,
    /// 4h RSI above which fatigue can trip.
    #[serde(default = "default_fatigue_rsi_4h")]
    pub fatigue_rsi_4h: f64,
    /// Price must stay within `atr_factor × ATR` of the base bar.
    #[serde(default = "default_freshness_atr_factor")]
    pub freshness_atr_factor: f64,
    /// Maximum bar age (count of bars) considered fresh.
    #[serde(default = "default_freshness_max_bars_age")]
    pub freshness_max_bars_age: u32,
    /// Maximum fill delay after bar close, in seconds.
    #[serde(default = "default_late_fill_max_delay_seconds")]
    pub late_fill_max_delay_seconds: i64,
}

impl Default for GuardThresholds {
    fn default() -> Self {
        Self {
            fatigue_return_24h: default_fatigue_return_24h(),
            fatigue_rsi_4h: default_fatigue_rsi_4h(),
            freshness_atr_factor: default_freshness_atr_factor(),
            freshness_max_bars_age: default_freshness_max_bars_age(),
            late_fill_max_delay_seconds: default_late_fill_max_delay_seconds(),
        }
    }
}

fn default_guard_regimes() -> HashMap<String, GuardThresholds> {
    let mut map = HashMap::new();
    map.insert("calm".to_string(), GuardThresholds::default());
    map.insert("normal".to_string(), GuardThresholds::default());
    map.insert(
        "volatile".to_string(),
        GuardThresholds {
            fatigue_return_24h: 18.0,
            fatigue_rsi_4h: 75.0,
            freshness_atr_factor: 1.5,
            freshness_max_bars_age: 2,
            late_fill_max_delay_seconds: 20,
        },
    );
    map
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardsConfig {
    #[serde(default = "default_guard_regimes")]
    pub regimes: HashMap<String, GuardThresholds>,
}

impl Default for GuardsConfig {
    fn default() -> Self {
        Self {
            regimes: default_guard_regimes(),
        }
    }
}

impl GuardsConfig {
    /// Thresholds for `regime`, falling back to defaults for unknown labels.
    pub fn for_regime(&self, regime: &str) -> GuardThresholds {
        self.regimes.get(regime).cloned().unwrap_or_default()
    }
}

/// Entry limits applied by the microstructure gate and ranking floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryLimits {
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_min_vadr")]
    pub min_vadr: f64,
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: f64,
    #[serde(default = "default_min_depth_usd")]
    pub min_depth_usd: f64,
    #[serde(default = "default_min_funding_divergence_sigma")]
    pub min_funding_divergence_sigma: f64,
    #[serde(default = "default_min_volume_multiple")]
    pub min_volume_multiple: f64,
    #[serde(default = "default_min_adx")]
    pub min_adx: f64,
    #[serde(default = "default_min_hurst")]
    pub min_hurst: f64,
}

impl Default for EntryLimits {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            min_vadr: default_min_vadr(),
            max_spread_bps: default_max_spread_bps(),
            min_depth_usd: default_min_depth_usd(),
            min_funding_divergence_sigma: default_min_funding_divergence_sigma(),
            min_volume_multiple: default_min_volume_multiple(),
            min_adx: default_min_adx(),
            min_hurst: default_min_hurst(),
        }
    }
}

/// Thresholds for the 2-of-3 confirmation gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_min_funding_divergence_sigma")]
    pub funding_divergence_threshold: f64,
    #[serde(default = "default_whale_threshold")]
    pub whale_composite_threshold: f64,
    #[serde(default = "default_supply_squeeze_threshold")]
    pub supply_squeeze_threshold: f64,
    #[serde(default = "default_volume_confirmation_threshold")]
    pub volume_confirmation_threshold: f64,
    /// Regimes in which a strong volume ratio lowers the required
    /// confirmation count from 2 to 1. Labels must come from the regime
    /// detector's vocabulary; default boosts only the volatile regime.
    #[serde(default = "default_volume_boost_regimes")]
    pub volume_boost_regimes: Vec<String>,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            funding_divergence_threshold: default_min_funding_divergence_sigma(),
            whale_composite_threshold: default_whale_threshold(),
            supply_squeeze_threshold: default_supply_squeeze_threshold(),
            volume_confirmation_threshold: default_volume_confirmation_threshold(),
            volume_boost_regimes: default_volume_boost_regimes(),
        }
    }
}

// =============================================================================
// Portfolio / alerts
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    #[serde(default = "default_correlation_cap")]
    pub correlation_cap: f64,
    #[serde(default = "default_sector_caps")]
    pub sector_caps: HashMap<String, usize>,
    /// Σ|β_i| budget across accepted candidates.
    #[serde(default = "default_beta_budget")]
    pub beta_budget: f64,
    #[serde(default = "default_max_single_position_pct")]
    pub max_single_position_pct: f64,
    #[serde(default = "default_max_total_exposure_pct")]
    pub max_total_exposure_pct: f64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            correlation_cap: default_correlation_cap(),
            sector_caps: default_sector_caps(),
            beta_budget: default_beta_budget(),
            max_single_position_pct: default_max_single_position_pct(),
            max_total_exposure_pct: default_max_total_exposure_pct(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_alert_hourly_limit")]
    pub hourly_limit: u32,
    #[serde(default = "default_alert_daily_limit")]
    pub daily_limit: u32,
    /// Replaces `hourly_limit` while the regime is volatile.
    #[serde(default = "default_alert_high_vol_hourly_limit")]
    pub high_vol_hourly_limit: u32,
    #[serde(default = "default_manual_override_score")]
    pub manual_override_score: f64,
    #[serde(default = "default_manual_override_gates")]
    pub manual_override_gates: u32,
    #[serde(default = "default_alert_cooldown_seconds")]
    pub cooldown_seconds: i64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            hourly_limit: default_alert_hourly_limit(),
            daily_limit: default_alert_daily_limit(),
            high_vol_hourly_limit: default_alert_high_vol_hourly_limit(),
            manual_override_score: default_manual_override_score(),
            manual_override_gates: default_manual_override_gates(),
            cooldown_seconds: default_alert_cooldown_seconds(),
        }
    }
}

// =============================================================================
// Ops
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_budget_hourly_limit")]
    pub hourly_limit: u32,
    #[serde(default = "default_soft_warn_percent")]
    pub soft_warn_percent: f64,
    #[serde(default = "default_hard_stop_percent")]
    pub hard_stop_percent: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            hourly_limit: default_budget_hourly_limit(),
            soft_warn_percent: default_soft_warn_percent(),
            hard_stop_percent: default_hard_stop_percent(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CallQuotaConfig {
    pub calls_per_minute: u32,
    pub burst_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationGuardConfig {
    #[serde(default = "default_max_correlation")]
    pub max_correlation: f64,
    #[serde(default = "default_top_n_signals")]
    pub top_n_signals: usize,
    #[serde(default = "default_lookback_periods")]
    pub lookback_periods: usize,
}

impl Default for CorrelationGuardConfig {
    fn default() -> Self {
        Self {
            max_correlation: default_max_correlation(),
            top_n_signals: default_top_n_signals(),
            lookback_periods: default_lookback_periods(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueHealthConfig {
    #[serde(default = "default_min_uptime_percent")]
    pub min_uptime_percent: f64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: f64,
    #[serde(default = "default_min_depth_usd")]
    pub min_depth_usd: f64,
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: f64,
}

impl Default for VenueHealthConfig {
    fn default() -> Self {
        Self {
            min_uptime_percent: default_min_uptime_percent(),
            max_latency_ms: default_max_latency_ms(),
            min_depth_usd: default_min_depth_usd(),
            max_spread_bps: default_max_spread_bps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsConfig {
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default = "default_quota_providers")]
    pub call_quota_providers: HashMap<String, CallQuotaConfig>,
    #[serde(default)]
    pub correlation: CorrelationGuardConfig,
    #[serde(default)]
    pub venue_health: VenueHealthConfig,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            call_quota_providers: default_quota_providers(),
            correlation: CorrelationGuardConfig::default(),
            venue_health: VenueHealthConfig::default(),
        }
    }
}

/// Kill switches honored by the scanner at the top of every tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyConfig {
    #[serde(default)]
    pub disable_all_scanners: bool,
    /// Skip the hot and warm tiers; cold files only.
    #[serde(default)]
    pub disable_live_data: bool,
    /// Evaluate but never write ledger/PIT/artifacts.
    #[serde(default)]
    pub read_only_mode: bool,
}

// =============================================================================
// Provider guard settings
// =============================================================================

/// Per-provider settings for the TTL cache + token bucket + circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderGuardConfig {
    #[serde(default = "default_guard_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_guard_burst_limit")]
    pub burst_limit: u32,
    /// Sustained request rate in tokens per second.
    #[serde(default = "default_guard_sustained_rate")]
    pub sustained_rate: f64,
    #[serde(default = "default_guard_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_guard_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Failure rate in [0,1] that opens the breaker once the window is full.
    #[serde(default = "default_guard_failure_threshold")]
    pub failure_threshold: f64,
    #[serde(default = "default_guard_window_requests")]
    pub window_requests: usize,
    /// Seconds an OPEN breaker waits before allowing the half-open probe.
    #[serde(default = "default_guard_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
    #[serde(default = "default_provider_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ProviderGuardConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_guard_ttl_seconds(),
            burst_limit: default_guard_burst_limit(),
            sustained_rate: default_guard_sustained_rate(),
            max_retries: default_guard_max_retries(),
            backoff_base_ms: default_guard_backoff_base_ms(),
            failure_threshold: default_guard_failure_threshold(),
            window_requests: default_guard_window_requests(),
            probe_interval_seconds: default_guard_probe_interval_seconds(),
            timeout_seconds: default_provider_timeout_seconds(),
        }
    }
}

// =============================================================================
// ScanConfig
// =============================================================================

/// Top-level configuration for the CryptoRun scan engine.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Primary venue identifier (canonical, upper-case).
    #[serde(default = "default_venue")]
    pub venue: String,

    /// Path to the universe file produced by the symbol sync job.
    #[serde(default)]
    pub universe_file: Option<String>,

    /// Maximum per-symbol tasks in flight within one tick.
    #[serde(default = "default_max_concurrent_scans")]
    pub max_concurrent_scans: usize,

    /// Per-tick deadline; in-flight symbol tasks are cancelled past it.
    #[serde(default = "default_scan_timeout_seconds")]
    pub scan_timeout_seconds: u64,

    /// Interval between ticks for `monitor`.
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,

    /// Candidates retained after ranking.
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Root directory for tick artifacts (candidates, ledger, audit).
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,

    /// Steepness of the logistic transform mapping raw composite values
    /// into [0,100].
    #[serde(default = "default_score_steepness")]
    pub score_steepness: f64,

    #[serde(default)]
    pub weights: WeightsConfig,

    /// Orthogonalization order; must start with the protected factor.
    #[serde(default = "default_sequence")]
    pub orthogonalization_sequence: Vec<String>,

    #[serde(default)]
    pub guards: GuardsConfig,

    #[serde(default)]
    pub entry_limits: EntryLimits,

    #[serde(default)]
    pub confirmation: ConfirmationConfig,

    #[serde(default)]
    pub portfolio: PortfolioConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub ops: OpsConfig,

    #[serde(default)]
    pub emergency: EmergencyConfig,

    /// Per-provider guard settings, keyed by provider name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderGuardConfig>,

    /// Hot-tier ticks older than this fail `STALE_WS`.
    #[serde(default = "default_hot_stale_threshold_ms")]
    pub hot_stale_threshold_ms: i64,

    #[serde(default = "default_pit_base_dir")]
    pub pit_base_dir: String,

    #[serde(default = "default_pit_retention_days")]
    pub pit_retention_days: i64,

    #[serde(default = "default_cold_base_dir")]
    pub cold_base_dir: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            venue: default_venue(),
            universe_file: None,
            max_concurrent_scans: default_max_concurrent_scans(),
            scan_timeout_seconds: default_scan_timeout_seconds(),
            scan_interval_seconds: default_scan_interval_seconds(),
            top_n: default_top_n(),
            artifacts_dir: default_artifacts_dir(),
            score_steepness: default_score_steepness(),
            weights: WeightsConfig::default(),
            orthogonalization_sequence: default_sequence(),
            guards: GuardsConfig::default(),
            entry_limits: EntryLimits::default(),
            confirmation: ConfirmationConfig::default(),
            portfolio: PortfolioConfig::default(),
            alerts: AlertsConfig::default(),
            ops: OpsConfig::default(),
            emergency: EmergencyConfig::default(),
            providers: HashMap::new(),
            hot_stale_threshold_ms: default_hot_stale_threshold_ms(),
            pit_base_dir: default_pit_base_dir(),
            pit_retention_days: default_pit_retention_days(),
            cold_base_dir: default_cold_base_dir(),
        }
    }
}

impl ScanConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scan config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse scan config from {}", path.display()))?;

        info!(
            path = %path.display(),
            venue = %config.venue,
            regimes = config.weights.regimes.len(),
            "scan config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialize scan config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "scan config saved (atomic)");
        Ok(())
    }

    /// Guard settings for `provider`, falling back to defaults.
    pub fn provider_guard(&self, provider: &str) -> ProviderGuardConfig {
        self.providers.get(provider).cloned().unwrap_or_default()
    }

    /// Validate invariants that are fatal at startup:
    ///
    /// - every regime weight vector sums to 1.0 within tolerance;
    /// - every vector respects `min_momentum_weight` / `max_social_weight`;
    /// - the orthogonalization sequence is non-empty and starts with the
    ///   protected factor (`momentum_core`);
    /// - budget percentages are ordered (`soft_warn < hard_stop`).
    pub fn validate(&self) -> Result<(), ScanError> {
        let v = &self.weights.validation;

        if self.weights.regimes.is_empty() {
            return Err(ScanError::new(ErrorKind::Config, "no regime weight vectors configured"));
        }

        for (regime, weights) in &self.weights.regimes {
            let sum = weights.sum();
            if (sum - 1.0).abs() > v.weight_sum_tolerance {
                return Err(ScanError::new(
                    ErrorKind::Config,
                    format!("regime '{regime}' weights sum to {sum:.4}, expected 1.0"),
                )
                .with_offender(regime.clone()));
            }
            if weights.momentum_core < v.min_momentum_weight {
                return Err(ScanError::new(
                    ErrorKind::Config,
                    format!(
                        "regime '{regime}' momentum weight {:.3} below minimum {:.3}",
                        weights.momentum_core, v.min_momentum_weight
                    ),
                )
                .with_offender(regime.clone()));
            }
            if weights.social_residual > v.max_social_weight {
                return Err(ScanError::new(
                    ErrorKind::Config,
                    format!(
                        "regime '{regime}' social weight {:.3} above maximum {:.3}",
                        weights.social_residual, v.max_social_weight
                    ),
                )
                .with_offender(regime.clone()));
            }
        }

        match self.orthogonalization_sequence.first() {
            Some(first) if first == FACTOR_MOMENTUM => {}
            Some(first) => {
                return Err(ScanError::new(
                    ErrorKind::Config,
                    format!(
                        "orthogonalization sequence must start with the protected factor \
                         '{FACTOR_MOMENTUM}', found '{first}'"
                    ),
                ));
            }
            None => {
                return Err(ScanError::new(
                    ErrorKind::Config,
                    "orthogonalization sequence is empty",
                ));
            }
        }

        if self.ops.budget.soft_warn_percent >= self.ops.budget.hard_stop_percent {
            return Err(ScanError::new(
                ErrorKind::Config,
                format!(
                    "budget soft_warn_percent {:.1} must be below hard_stop_percent {:.1}",
                    self.ops.budget.soft_warn_percent, self.ops.budget.hard_stop_percent
                ),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ScanConfig::default();
        cfg.validate().expect("default config must validate");
    }

    #[test]
    fn default_weights_sum_to_one() {
        let cfg = ScanConfig::default();
        for (regime, w) in &cfg.weights.regimes {
            assert!(
                (w.sum() - 1.0).abs() < 1e-9,
                "regime {regime} sums to {}",
                w.sum()
            );
        }
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: ScanConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.venue, "KRAKEN");
        assert_eq!(cfg.max_concurrent_scans, 8);
        assert_eq!(cfg.orthogonalization_sequence[0], FACTOR_MOMENTUM);
        assert!((cfg.weights.validation.social_hard_cap - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "venue": "COINBASE", "top_n": 5 }"#;
        let cfg: ScanConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.venue, "COINBASE");
        assert_eq!(cfg.top_n, 5);
        assert_eq!(cfg.scan_timeout_seconds, 45);
        assert!(cfg.weights.regimes.contains_key("normal"));
    }

    #[test]
    fn bad_weight_sum_fails_validation() {
        let mut cfg = ScanConfig::default();
        cfg.weights.regimes.insert(
            "normal".to_string(),
            WeightVector {
                momentum_core: 0.50,
                technical_residual: 0.30,
                volume_residual: 0.30,
                quality_residual: 0.10,
                social_residual: 0.05,
            },
        );
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert!(err.message.contains("sum"));
    }

    #[test]
    fn low_momentum_weight_fails_validation() {
        let mut cfg = ScanConfig::default();
        cfg.weights.regimes.insert(
            "calm".to_string(),
            WeightVector {
                momentum_core: 0.20,
                technical_residual: 0.35,
                volume_residual: 0.25,
                quality_residual: 0.15,
                social_residual: 0.05,
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.message.contains("momentum"));
    }

    #[test]
    fn sequence_must_start_with_protected_factor() {
        let mut cfg = ScanConfig::default();
        cfg.orthogonalization_sequence =
            vec![FACTOR_TECHNICAL.to_string(), FACTOR_MOMENTUM.to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.message.contains("protected"));
    }

    #[test]
    fn empty_sequence_fails_validation() {
        let mut cfg = ScanConfig::default();
        cfg.orthogonalization_sequence.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = ScanConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: ScanConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.venue, cfg2.venue);
        assert_eq!(cfg.top_n, cfg2.top_n);
        assert_eq!(
            cfg.orthogonalization_sequence,
            cfg2.orthogonalization_sequence
        );
    }

    #[test]
    fn atomic_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan_config.json");

        let cfg = ScanConfig::default();
        cfg.save(&path).unwrap();

        let loaded = ScanConfig::load(&path).unwrap();
        assert_eq!(loaded.venue, cfg.venue);
        // No stray tmp file after the rename.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn weight_vector_lookup_by_name() {
        let w = WeightVector {
            momentum_core: 0.5,
            technical_residual: 0.2,
            volume_residual: 0.15,
            quality_residual: 0.1,
            social_residual: 0.05,
        };
        assert!((w.get(FACTOR_MOMENTUM) - 0.5).abs() < f64::EPSILON);
        assert!((w.get(FACTOR_SOCIAL) - 0.05).abs() < f64::EPSILON);
        assert!((w.get("unknown") - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn provider_guard_falls_back_to_defaults() {
        let cfg = ScanConfig::default();
        let guard = cfg.provider_guard("unconfigured");
        assert_eq!(guard.max_retries, 3);
        assert_eq!(guard.window_requests, 10);
    }
}
