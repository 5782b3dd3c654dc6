//! Market regime resolution.
//!
//! Maps macro indicator readings onto a discrete [`Regime`] through
//! configured cutoffs, with optional per-market indicator routing and a
//! custom expression mode. Resolution never fails: any problem degrades
//! to [`Regime::Normal`] with a warning.

mod expr;

pub use expr::{evaluate, ExprError};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::config::{RegimeRules, SymbolStrategyMap};
use crate::macrodata::MacroSnapshot;

/// Discrete market regime, ordered from most to least stressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Panic,
    HighVol,
    Normal,
    LowVol,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Panic => "panic",
            Regime::HighVol => "high_vol",
            Regime::Normal => "normal",
            Regime::LowVol => "low_vol",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Regime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "panic" => Ok(Regime::Panic),
            "high_vol" => Ok(Regime::HighVol),
            "normal" => Ok(Regime::Normal),
            "low_vol" => Ok(Regime::LowVol),
            other => anyhow::bail!("unknown regime '{other}'"),
        }
    }
}

// Sentinel bindings for custom expressions that want to name a regime
// directly, e.g. `if(vix > 40, PANIC, NORMAL)`. Values sit far outside
// the 0-100 score range and are matched exactly.
const SENTINEL_PANIC: f64 = 100_001.0;
const SENTINEL_HIGH_VOL: f64 = 100_002.0;
const SENTINEL_NORMAL: f64 = 100_003.0;
const SENTINEL_LOW_VOL: f64 = 100_004.0;

/// Resolve the regime using the rules' primary indicator.
pub fn resolve_regime(snapshot: &MacroSnapshot, rules: &RegimeRules) -> Regime {
    let indicator = if rules.primary_indicator == "auto" {
        // Auto without a per-market map has nothing to route on
        "vix"
    } else {
        rules.primary_indicator.as_str()
    };
    resolve_with_indicator(snapshot, rules, indicator)
}

/// Resolve the regime through one named indicator.
pub fn resolve_with_indicator(
    snapshot: &MacroSnapshot,
    rules: &RegimeRules,
    indicator: &str,
) -> Regime {
    match indicator {
        "vix" => resolve_volatility(
            snapshot.vix,
            rules.vix_panic,
            rules.vix_high_vol,
            rules.vix_low_vol,
        ),
        "vhsi" => resolve_volatility(
            snapshot.vhsi,
            rules.vhsi_panic.unwrap_or(rules.vix_panic),
            rules.vhsi_high_vol.unwrap_or(rules.vix_high_vol),
            rules.vhsi_low_vol.unwrap_or(rules.vix_low_vol),
        ),
        "civix" => resolve_volatility(
            snapshot.civix,
            rules.civix_panic.unwrap_or(rules.vix_panic),
            rules.civix_high_vol.unwrap_or(rules.vix_high_vol),
            rules.civix_low_vol.unwrap_or(rules.vix_low_vol),
        ),
        "fear_greed" => resolve_fear_greed(snapshot.fear_greed, rules),
        "custom" => resolve_custom(snapshot, rules),
        other => {
            warn!("unknown primary indicator '{other}', defaulting to normal");
            Regime::Normal
        }
    }
}

/// Volatility-style resolution: high reading = stressed market. The
/// upper cutoffs are exclusive, so a reading sitting exactly on one
/// stays in the calmer bucket.
fn resolve_volatility(value: Decimal, panic: Decimal, high_vol: Decimal, low_vol: Decimal) -> Regime {
    if value > panic {
        Regime::Panic
    } else if value > high_vol {
        Regime::HighVol
    } else if value < low_vol {
        Regime::LowVol
    } else {
        Regime::Normal
    }
}

/// Fear & Greed resolution: polarity is inverted, low reading = fear.
fn resolve_fear_greed(value: Decimal, rules: &RegimeRules) -> Regime {
    if value < rules.fg_extreme_fear {
        Regime::Panic
    } else if value < rules.fg_high_fear {
        Regime::HighVol
    } else if value > rules.fg_low_greed {
        Regime::LowVol
    } else {
        Regime::Normal
    }
}

fn expr_bindings(snapshot: &MacroSnapshot) -> HashMap<String, f64> {
    let defaults = MacroSnapshot::default();
    let to_f64 = |value: Decimal, fallback: Decimal| {
        value
            .to_f64()
            .or_else(|| fallback.to_f64())
            .unwrap_or(0.0)
    };
    let mut vars = HashMap::new();
    vars.insert("vix".to_string(), to_f64(snapshot.vix, defaults.vix));
    vars.insert("vhsi".to_string(), to_f64(snapshot.vhsi, defaults.vhsi));
    vars.insert("civix".to_string(), to_f64(snapshot.civix, defaults.civix));
    vars.insert("dxy".to_string(), to_f64(snapshot.dxy, defaults.dxy));
    vars.insert(
        "fear_greed".to_string(),
        to_f64(snapshot.fear_greed, defaults.fear_greed),
    );
    vars.insert("PANIC".to_string(), SENTINEL_PANIC);
    vars.insert("HIGH_VOL".to_string(), SENTINEL_HIGH_VOL);
    vars.insert("NORMAL".to_string(), SENTINEL_NORMAL);
    vars.insert("LOW_VOL".to_string(), SENTINEL_LOW_VOL);
    vars
}

/// Custom expression resolution. The expression either names a regime
/// directly through a sentinel or yields a numeric score mapped through
/// the `custom_score_*` cutoffs (fear polarity: low score = panic).
fn resolve_custom(snapshot: &MacroSnapshot, rules: &RegimeRules) -> Regime {
    if rules.custom_expr.trim().is_empty() {
        warn!("custom indicator selected but custom_expr is empty, defaulting to normal");
        return Regime::Normal;
    }

    let score = match expr::evaluate(&rules.custom_expr, &expr_bindings(snapshot)) {
        Ok(score) => score,
        Err(e) => {
            warn!("custom expression failed ({e}), defaulting to normal");
            return Regime::Normal;
        }
    };

    if score == SENTINEL_PANIC {
        return Regime::Panic;
    }
    if score == SENTINEL_HIGH_VOL {
        return Regime::HighVol;
    }
    if score == SENTINEL_NORMAL {
        return Regime::Normal;
    }
    if score == SENTINEL_LOW_VOL {
        return Regime::LowVol;
    }

    let score = match Decimal::try_from(score) {
        Ok(d) => d,
        Err(_) => {
            warn!("custom expression score {score} not representable, defaulting to normal");
            return Regime::Normal;
        }
    };

    if score < rules.custom_score_extreme_fear {
        Regime::Panic
    } else if score < rules.custom_score_high_fear {
        Regime::HighVol
    } else if score > rules.custom_score_low_greed {
        Regime::LowVol
    } else {
        Regime::Normal
    }
}

/// Maps symbols to markets so per-market indicator routing can apply.
pub trait MarketLookup: Send + Sync {
    fn resolve(&self, symbols: &[String]) -> anyhow::Result<HashMap<String, String>>;
}

/// Fixed symbol → market table, typically from `symbol_markets` config.
pub struct StaticMarketLookup {
    map: HashMap<String, String>,
}

impl StaticMarketLookup {
    pub fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }
}

impl MarketLookup for StaticMarketLookup {
    fn resolve(&self, symbols: &[String]) -> anyhow::Result<HashMap<String, String>> {
        Ok(symbols
            .iter()
            .filter_map(|s| self.map.get(s).map(|m| (s.clone(), m.clone())))
            .collect())
    }
}

/// Digit-length fallback when no lookup entry exists: 5-digit codes are
/// Hong Kong listings, 6-digit codes are mainland listings.
pub fn heuristic_market(symbol: &str) -> &'static str {
    let code = symbol.strip_suffix(".HK").unwrap_or(symbol);
    if code.chars().all(|c| c.is_ascii_digit()) {
        match code.len() {
            5 => return "HShare",
            6 => return "AShare",
            _ => {}
        }
    }
    "default"
}

fn indicator_for_market(rules: &RegimeRules, market: &str) -> String {
    rules
        .indicator_per_market
        .get(market)
        .or_else(|| rules.indicator_per_market.get("default"))
        .cloned()
        .unwrap_or_else(|| "vix".to_string())
}

/// Resolve a regime per symbol.
///
/// Per-market routing applies only when the primary indicator is `auto`
/// and `indicator_per_market` is non-empty; otherwise every symbol gets
/// the single primary-indicator regime.
pub fn resolve_per_symbol(
    snapshot: &MacroSnapshot,
    rules: &RegimeRules,
    symbol_strategies: &SymbolStrategyMap,
    lookup: &dyn MarketLookup,
) -> BTreeMap<String, Regime> {
    let symbols: Vec<String> = symbol_strategies.keys().cloned().collect();

    let per_market = rules.primary_indicator == "auto" && !rules.indicator_per_market.is_empty();
    if !per_market {
        let regime = resolve_regime(snapshot, rules);
        return symbols.into_iter().map(|s| (s, regime)).collect();
    }

    let markets = match lookup.resolve(&symbols) {
        Ok(map) => map,
        Err(e) => {
            warn!("market lookup failed ({e:#}), using digit-length heuristic");
            HashMap::new()
        }
    };

    symbols
        .into_iter()
        .map(|symbol| {
            let market = markets
                .get(&symbol)
                .map(String::as_str)
                .unwrap_or_else(|| heuristic_market(&symbol));
            let indicator = indicator_for_market(rules, market);
            let regime = resolve_with_indicator(snapshot, rules, &indicator);
            debug!(%symbol, %market, %indicator, %regime, "resolved symbol regime");
            (symbol, regime)
        })
        .collect()
}
