//! Configuration management for the regime allocator.
//!
//! Loads settings from environment variables and config files. Every field
//! has a documented default so a partially-populated config file never
//! produces missing-key behavior at a read site.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Integer strategy identifier, unique across the whole symbol map.
pub type StrategyId = i64;

/// symbol → style → strategy ids. The union of all ids is the managed set:
/// the only strategies this core is allowed to start or stop.
pub type SymbolStrategyMap = BTreeMap<String, BTreeMap<String, Vec<StrategyId>>>;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tick scheduling intervals
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Regime resolution rules (indicators, cutoffs, custom expression)
    #[serde(default)]
    pub regime_rules: RegimeRules,
    /// Weighted multi-strategy allocation settings
    #[serde(default)]
    pub multi_strategy: MultiStrategyConfig,
    /// Legacy binary mode: regime → styles that should run
    #[serde(default)]
    pub regime_to_style: BTreeMap<String, Vec<String>>,
    /// symbol → style → strategy ids; empty means "fall back to the store"
    #[serde(default)]
    pub symbol_strategies: SymbolStrategyMap,
    /// Operator-configured symbol → market overrides for per-market regimes
    #[serde(default)]
    pub symbol_markets: BTreeMap<String, String>,
    /// Macro indicator feed endpoint
    #[serde(default)]
    pub macro_feed: MacroFeedConfig,
    /// SQLite state database
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Minutes between regime reconciliation ticks
    #[serde(default = "default_regime_interval")]
    pub regime_interval_minutes: u64,
    /// Minutes between portfolio monitor (drawdown) ticks
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeRules {
    /// Primary indicator: vix | vhsi | civix | fear_greed | custom | auto
    #[serde(default = "default_primary_indicator")]
    pub primary_indicator: String,

    // VIX cutoffs (also the fallback for VHSI/CIVIX when unset)
    #[serde(default = "default_vix_panic")]
    pub vix_panic: Decimal,
    #[serde(default = "default_vix_high_vol")]
    pub vix_high_vol: Decimal,
    #[serde(default = "default_vix_low_vol")]
    pub vix_low_vol: Decimal,

    // VHSI / CIVIX cutoffs; `None` falls back to the VIX cutoffs
    #[serde(default)]
    pub vhsi_panic: Option<Decimal>,
    #[serde(default)]
    pub vhsi_high_vol: Option<Decimal>,
    #[serde(default)]
    pub vhsi_low_vol: Option<Decimal>,
    #[serde(default)]
    pub civix_panic: Option<Decimal>,
    #[serde(default)]
    pub civix_high_vol: Option<Decimal>,
    #[serde(default)]
    pub civix_low_vol: Option<Decimal>,

    // Fear & Greed cutoffs (0-100, low = fear)
    #[serde(default = "default_fg_extreme_fear")]
    pub fg_extreme_fear: Decimal,
    #[serde(default = "default_fg_high_fear")]
    pub fg_high_fear: Decimal,
    #[serde(default = "default_fg_low_greed")]
    pub fg_low_greed: Decimal,

    /// Allow-listed expression for custom regime scoring (empty = unused)
    #[serde(default)]
    pub custom_expr: String,
    /// Score cutoffs for custom mode, fear-greed polarity (low score = panic)
    #[serde(default = "default_fg_extreme_fear")]
    pub custom_score_extreme_fear: Decimal,
    #[serde(default = "default_fg_high_fear")]
    pub custom_score_high_fear: Decimal,
    #[serde(default = "default_fg_low_greed")]
    pub custom_score_low_greed: Decimal,

    /// market → indicator, used when primary_indicator = "auto"
    #[serde(default)]
    pub indicator_per_market: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiStrategyConfig {
    /// Enable weighted allocation; false falls back to legacy binary mode
    #[serde(default)]
    pub enabled: bool,
    /// regime → style → weight; missing regimes use a hard-coded fallback
    #[serde(default)]
    pub regime_to_weights: BTreeMap<String, BTreeMap<String, Decimal>>,
    /// Weights below this are zeroed before normalization
    #[serde(default = "default_min_weight_threshold")]
    pub min_weight_threshold: Decimal,
    /// Per-strategy cap: allocation ≤ initial_capital × this ratio
    #[serde(default = "default_max_allocation_ratio")]
    pub max_allocation_ratio: Decimal,
    /// Operator override: symbol → capital pool
    #[serde(default)]
    pub symbol_capital_pool: BTreeMap<String, Decimal>,
    /// Weight transition behavior between ticks
    #[serde(default)]
    pub transition: TransitionConfig,
    /// Portfolio drawdown circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionConfig {
    /// "immediate" or "gradual"
    #[serde(default = "default_transition_mode")]
    pub mode: String,
    /// Maximum per-style weight movement per tick in gradual mode
    #[serde(default = "default_max_step_per_tick")]
    pub max_step_per_tick: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Drawdown percentage that trips the breaker
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    /// Drawdown must fall below this before recovery is considered
    #[serde(default = "default_recovery_threshold_pct")]
    pub recovery_threshold_pct: Decimal,
    /// Minimum dwell time in the triggered state
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroFeedConfig {
    /// Base URL of the macro snapshot service; empty = use static defaults
    #[serde(default)]
    pub base_url: String,
    /// Request timeout in seconds
    #[serde(default = "default_macro_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

// Default value functions

fn default_regime_interval() -> u64 {
    15
}

fn default_monitor_interval() -> u64 {
    5
}

fn default_primary_indicator() -> String {
    "vix".to_string()
}

fn default_vix_panic() -> Decimal {
    Decimal::new(30, 0)
}

fn default_vix_high_vol() -> Decimal {
    Decimal::new(25, 0)
}

fn default_vix_low_vol() -> Decimal {
    Decimal::new(15, 0)
}

fn default_fg_extreme_fear() -> Decimal {
    Decimal::new(20, 0)
}

fn default_fg_high_fear() -> Decimal {
    Decimal::new(35, 0)
}

fn default_fg_low_greed() -> Decimal {
    Decimal::new(65, 0)
}

fn default_min_weight_threshold() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_max_allocation_ratio() -> Decimal {
    Decimal::new(2, 0)
}

fn default_transition_mode() -> String {
    "immediate".to_string()
}

fn default_max_step_per_tick() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_max_drawdown_pct() -> Decimal {
    Decimal::new(15, 0)
}

fn default_recovery_threshold_pct() -> Decimal {
    Decimal::new(10, 0)
}

fn default_cooldown_minutes() -> f64 {
    60.0
}

fn default_macro_timeout() -> u64 {
    10
}

fn default_db_path() -> String {
    "data/state.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("RA"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.scheduler.regime_interval_minutes >= 1
                && self.scheduler.monitor_interval_minutes >= 1,
            "tick intervals must be at least 1 minute"
        );

        anyhow::ensure!(
            self.multi_strategy.min_weight_threshold >= Decimal::ZERO
                && self.multi_strategy.min_weight_threshold < Decimal::ONE,
            "min_weight_threshold must be in [0, 1)"
        );

        anyhow::ensure!(
            self.multi_strategy.max_allocation_ratio > Decimal::ZERO,
            "max_allocation_ratio must be positive"
        );

        anyhow::ensure!(
            self.multi_strategy.transition.max_step_per_tick > Decimal::ZERO,
            "transition.max_step_per_tick must be positive"
        );

        let cb = &self.multi_strategy.circuit_breaker;
        anyhow::ensure!(
            cb.max_drawdown_pct > Decimal::ZERO && cb.max_drawdown_pct <= Decimal::new(100, 0),
            "circuit_breaker.max_drawdown_pct must be in (0, 100]"
        );
        anyhow::ensure!(
            cb.recovery_threshold_pct < cb.max_drawdown_pct,
            "circuit_breaker.recovery_threshold_pct must be below max_drawdown_pct"
        );
        anyhow::ensure!(
            cb.cooldown_minutes >= 0.0,
            "circuit_breaker.cooldown_minutes must be non-negative"
        );

        // Strategy ids must be unique across the whole map
        let mut seen = std::collections::HashSet::new();
        for style_map in self.symbol_strategies.values() {
            for ids in style_map.values() {
                for id in ids {
                    anyhow::ensure!(
                        seen.insert(*id),
                        "strategy id {} appears more than once in symbol_strategies",
                        id
                    );
                }
            }
        }

        Ok(())
    }
}

/// Source of runtime configuration for the reconciliation controller.
///
/// Implementations must degrade to `Config::default()` on failure so a
/// tick never crashes on a bad or missing config file.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Config;
}

/// File/environment-backed config source.
#[derive(Debug, Default)]
pub struct FileConfigSource;

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Config {
        match Config::load() {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e:#}");
                Config::default()
            }
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            regime_interval_minutes: default_regime_interval(),
            monitor_interval_minutes: default_monitor_interval(),
        }
    }
}

impl Default for RegimeRules {
    fn default() -> Self {
        Self {
            primary_indicator: default_primary_indicator(),
            vix_panic: default_vix_panic(),
            vix_high_vol: default_vix_high_vol(),
            vix_low_vol: default_vix_low_vol(),
            vhsi_panic: None,
            vhsi_high_vol: None,
            vhsi_low_vol: None,
            civix_panic: None,
            civix_high_vol: None,
            civix_low_vol: None,
            fg_extreme_fear: default_fg_extreme_fear(),
            fg_high_fear: default_fg_high_fear(),
            fg_low_greed: default_fg_low_greed(),
            custom_expr: String::new(),
            custom_score_extreme_fear: default_fg_extreme_fear(),
            custom_score_high_fear: default_fg_high_fear(),
            custom_score_low_greed: default_fg_low_greed(),
            indicator_per_market: BTreeMap::new(),
        }
    }
}

impl Default for MultiStrategyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            regime_to_weights: BTreeMap::new(),
            min_weight_threshold: default_min_weight_threshold(),
            max_allocation_ratio: default_max_allocation_ratio(),
            symbol_capital_pool: BTreeMap::new(),
            transition: TransitionConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            mode: default_transition_mode(),
            max_step_per_tick: default_max_step_per_tick(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_drawdown_pct: default_max_drawdown_pct(),
            recovery_threshold_pct: default_recovery_threshold_pct(),
            cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

impl Default for MacroFeedConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_macro_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}
