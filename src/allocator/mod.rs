//! Weight and allocation engine.
//!
//! Converts a resolved regime into per-style weight vectors, per-symbol
//! capital pools, and per-strategy dollar allocations, then diffs the
//! result against the currently running set to decide which strategies
//! to start and stop. All money math is `Decimal`.

mod weights;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

use crate::config::{MultiStrategyConfig, StrategyId, SymbolStrategyMap};
use crate::regime::Regime;

use weights::WeightVec;

/// Effective weights below this distance count as unchanged.
const WEIGHT_EPSILON: Decimal = dec!(0.000001);

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegimeUpdate {
    /// Managed strategies that should be started (sorted ascending)
    pub started: Vec<StrategyId>,
    /// Managed strategies that should be stopped (sorted ascending)
    pub stopped: Vec<StrategyId>,
    /// Strategies whose effective weight moved by more than the epsilon
    pub weight_changed: Vec<StrategyId>,
    /// Managed strategies currently running
    pub running_count: usize,
    /// Strategies with a positive allocation after this pass
    pub target_count: usize,
    /// Symbols whose capital pool resolved to a positive amount
    pub symbols_with_pool: usize,
    pub symbols_total: usize,
}

/// One open position reported by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPosition {
    pub strategy_id: StrategyId,
    pub symbol: String,
    /// "long" or "short"
    pub side: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl StrategyPosition {
    fn market_value(&self) -> Decimal {
        self.size * self.current_price
    }
}

/// Per-symbol exposure rollup across managed strategies.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SymbolExposure {
    pub total_long_value: Decimal,
    pub total_short_value: Decimal,
    pub net_exposure: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: Vec<StrategyPosition>,
}

/// Point-in-time portfolio view for monitoring and the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub regime: Regime,
    pub weights: BTreeMap<String, BTreeMap<String, Decimal>>,
    pub allocation: BTreeMap<StrategyId, Decimal>,
    pub total_equity: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub exposures: BTreeMap<String, SymbolExposure>,
}

#[derive(Debug, Default)]
struct AllocatorState {
    current_regime: Option<Regime>,
    regime_per_symbol: BTreeMap<String, Regime>,
    /// symbol → style → target weight after threshold + normalize
    target: BTreeMap<String, WeightVec>,
    /// symbol → style → weight actually applied this tick
    effective: BTreeMap<String, WeightVec>,
    allocation: BTreeMap<StrategyId, Decimal>,
    capital_pools: BTreeMap<String, Decimal>,
    symbol_strategies: SymbolStrategyMap,
    initial_capitals: HashMap<StrategyId, Decimal>,
    /// Strategies whose allocation shrank but stayed positive: they keep
    /// their positions but must not open new ones
    frozen: BTreeSet<StrategyId>,
}

/// Thread-safe allocation engine. State lives behind a mutex; locks are
/// short and never held across awaits.
#[derive(Debug, Default)]
pub struct PortfolioAllocator {
    state: Mutex<AllocatorState>,
}

impl PortfolioAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one full reconciliation pass for the given regimes.
    ///
    /// `running` is the live set reported by the strategy runtime; only
    /// ids present in `symbol_strategies` (the managed set) are ever
    /// diffed against it. Everything except effective weights and the
    /// frozen set is recomputed from scratch each pass.
    pub fn update_regime(
        &self,
        default_regime: Regime,
        regime_per_symbol: &BTreeMap<String, Regime>,
        config: &MultiStrategyConfig,
        symbol_strategies: &SymbolStrategyMap,
        initial_capitals: Option<&HashMap<StrategyId, Decimal>>,
        running: &HashSet<StrategyId>,
    ) -> RegimeUpdate {
        let mut state = self.lock();

        state.current_regime = Some(default_regime);
        state.regime_per_symbol = regime_per_symbol.clone();
        state.symbol_strategies = symbol_strategies.clone();
        if let Some(capitals) = initial_capitals {
            state.initial_capitals = capitals.clone();
        }

        let old_effective = std::mem::take(&mut state.effective);
        let old_allocation = std::mem::take(&mut state.allocation);

        // Weight pipeline per symbol
        let mut target = BTreeMap::new();
        let mut effective = BTreeMap::new();
        for (symbol, styles) in symbol_strategies {
            let regime = regime_per_symbol
                .get(symbol)
                .copied()
                .unwrap_or(default_regime);
            let raw = target_weights(config, regime, styles);
            let thresholded = weights::apply_threshold(&raw, config.min_weight_threshold);
            let normalized = weights::normalize(&thresholded);

            let empty = WeightVec::new();
            let previous = old_effective.get(symbol).unwrap_or(&empty);
            let applied = weights::apply_transition(previous, &normalized, &config.transition);

            target.insert(symbol.clone(), normalized);
            effective.insert(symbol.clone(), applied);
        }

        // Capital pools and per-strategy allocations
        let mut pools = BTreeMap::new();
        let mut allocation = BTreeMap::new();
        for (symbol, styles) in symbol_strategies {
            let pool = self.resolve_pool(config, &state.initial_capitals, symbol, styles);
            if pool > Decimal::ZERO {
                if let Some(symbol_weights) = effective.get(symbol) {
                    for (style, ids) in styles {
                        let weight = symbol_weights
                            .get(style)
                            .copied()
                            .unwrap_or(Decimal::ZERO);
                        // A zero-weight style still writes explicit zeros:
                        // managed-at-zero is distinct from unmanaged for
                        // anyone sizing off `allocated_capital`
                        if weight <= Decimal::ZERO {
                            for id in ids {
                                allocation.insert(*id, Decimal::ZERO);
                            }
                            continue;
                        }
                        if ids.is_empty() {
                            continue;
                        }
                        let count = Decimal::from(ids.len() as i64);
                        for id in ids {
                            let mut amount = pool * weight / count;
                            if let Some(initial) = state.initial_capitals.get(id) {
                                let cap = *initial * config.max_allocation_ratio;
                                if amount > cap {
                                    amount = cap;
                                }
                            }
                            allocation.insert(*id, amount);
                        }
                    }
                }
            }
            pools.insert(symbol.clone(), pool);
        }

        // Freeze bookkeeping: a shrinking but still positive allocation
        // freezes the strategy; growth unfreezes; zero removes it
        let mut frozen = std::mem::take(&mut state.frozen);
        let all_ids: BTreeSet<StrategyId> = old_allocation
            .keys()
            .chain(allocation.keys())
            .copied()
            .collect();
        for id in &all_ids {
            let old = old_allocation.get(id).copied().unwrap_or(Decimal::ZERO);
            let new = allocation.get(id).copied().unwrap_or(Decimal::ZERO);
            if new <= Decimal::ZERO {
                frozen.remove(id);
            } else if new < old {
                frozen.insert(*id);
            } else if new > old {
                frozen.remove(id);
            }
        }
        frozen.retain(|id| {
            allocation
                .get(id)
                .map_or(false, |amount| *amount > Decimal::ZERO)
        });

        // Diff against the live running set, managed ids only. Zero
        // entries are bookkeeping, not run targets.
        let managed = managed_ids(symbol_strategies);
        let target_ids: BTreeSet<StrategyId> = allocation
            .iter()
            .filter(|(_, amount)| **amount > Decimal::ZERO)
            .map(|(id, _)| *id)
            .collect();
        let running_managed: BTreeSet<StrategyId> =
            running.iter().copied().filter(|id| managed.contains(id)).collect();
        let started: Vec<StrategyId> =
            target_ids.difference(&running_managed).copied().collect();
        let stopped: Vec<StrategyId> =
            running_managed.difference(&target_ids).copied().collect();

        let weight_changed =
            diff_weights(&old_effective, &effective, symbol_strategies);

        let update = RegimeUpdate {
            started,
            stopped,
            weight_changed,
            running_count: running_managed.len(),
            target_count: target_ids.len(),
            symbols_with_pool: pools.values().filter(|p| **p > Decimal::ZERO).count(),
            symbols_total: symbol_strategies.len(),
        };

        debug!(
            regime = %default_regime,
            started = update.started.len(),
            stopped = update.stopped.len(),
            target = update.target_count,
            "allocation pass complete"
        );

        state.target = target;
        state.effective = effective;
        state.allocation = allocation;
        state.capital_pools = pools;
        state.frozen = frozen;

        update
    }

    /// Capital pool for one symbol: operator override first, otherwise the
    /// largest initial capital among the symbol's strategies multiplied by
    /// the number of styles that actually carry strategies.
    fn resolve_pool(
        &self,
        config: &MultiStrategyConfig,
        initial_capitals: &HashMap<StrategyId, Decimal>,
        symbol: &str,
        styles: &BTreeMap<String, Vec<StrategyId>>,
    ) -> Decimal {
        if let Some(pool) = config.symbol_capital_pool.get(symbol) {
            return *pool;
        }
        let max_initial = styles
            .values()
            .flatten()
            .filter_map(|id| initial_capitals.get(id))
            .copied()
            .max()
            .unwrap_or(Decimal::ZERO);
        let style_count = styles.values().filter(|ids| !ids.is_empty()).count();
        max_initial * Decimal::from(style_count as i64)
    }

    pub fn current_regime(&self) -> Option<Regime> {
        self.lock().current_regime
    }

    /// Per-symbol effective weight vectors from the latest pass.
    pub fn effective_weights(&self) -> BTreeMap<String, BTreeMap<String, Decimal>> {
        self.lock().effective.clone()
    }

    /// Per-symbol target weight vectors (post threshold + normalize).
    pub fn target_weights(&self) -> BTreeMap<String, BTreeMap<String, Decimal>> {
        self.lock().target.clone()
    }

    pub fn allocation(&self) -> BTreeMap<StrategyId, Decimal> {
        self.lock().allocation.clone()
    }

    /// Capital budget for one strategy. `Some(0)` is a managed strategy
    /// whose style carries no weight right now; `None` means the id is
    /// outside the allocation table entirely.
    pub fn allocated_capital(&self, id: StrategyId) -> Option<Decimal> {
        self.lock().allocation.get(&id).copied()
    }

    pub fn is_frozen(&self, id: StrategyId) -> bool {
        self.lock().frozen.contains(&id)
    }

    /// Operator override: block new positions for a strategy.
    pub fn freeze_strategy(&self, id: StrategyId) {
        self.lock().frozen.insert(id);
    }

    /// Operator override: lift a freeze.
    pub fn unfreeze_strategy(&self, id: StrategyId) {
        self.lock().frozen.remove(&id);
    }

    pub fn capital_pools(&self) -> BTreeMap<String, Decimal> {
        self.lock().capital_pools.clone()
    }

    pub fn frozen(&self) -> BTreeSet<StrategyId> {
        self.lock().frozen.clone()
    }

    /// Every strategy id in the current symbol map.
    pub fn managed(&self) -> BTreeSet<StrategyId> {
        managed_ids(&self.lock().symbol_strategies)
    }

    /// Roll up open positions into per-symbol exposures. Positions from
    /// unmanaged strategies or with zero size are ignored.
    pub fn combined_positions(
        &self,
        positions: &[StrategyPosition],
    ) -> BTreeMap<String, SymbolExposure> {
        let managed = self.managed();
        let mut exposures: BTreeMap<String, SymbolExposure> = BTreeMap::new();
        for position in positions {
            if position.size <= Decimal::ZERO || !managed.contains(&position.strategy_id) {
                continue;
            }
            let entry = exposures.entry(position.symbol.clone()).or_default();
            if position.side == "short" {
                entry.total_short_value += position.market_value();
            } else {
                entry.total_long_value += position.market_value();
            }
            entry.unrealized_pnl += position.unrealized_pnl;
            entry.positions.push(position.clone());
        }
        for exposure in exposures.values_mut() {
            exposure.net_exposure = exposure.total_long_value - exposure.total_short_value;
        }
        exposures
    }

    /// Point-in-time view across regime, weights, allocation, and the
    /// combined exposures.
    pub fn portfolio_summary(&self, positions: &[StrategyPosition]) -> PortfolioSummary {
        let exposures = self.combined_positions(positions);
        let total_pnl = exposures.values().map(|e| e.unrealized_pnl).sum();

        let state = self.lock();
        PortfolioSummary {
            regime: state.current_regime.unwrap_or(Regime::Normal),
            weights: state.effective.clone(),
            allocation: state.allocation.clone(),
            total_equity: state.capital_pools.values().copied().sum(),
            total_unrealized_pnl: total_pnl,
            exposures,
        }
    }
}

fn managed_ids(symbol_strategies: &SymbolStrategyMap) -> BTreeSet<StrategyId> {
    symbol_strategies
        .values()
        .flat_map(|styles| styles.values())
        .flatten()
        .copied()
        .collect()
}

/// Target weight vector for a symbol in the given regime. Missing or
/// empty config falls back to a conservative/balanced/aggressive split.
fn target_weights(
    config: &MultiStrategyConfig,
    regime: Regime,
    styles: &BTreeMap<String, Vec<StrategyId>>,
) -> WeightVec {
    let configured = config
        .regime_to_weights
        .get(regime.as_str())
        .filter(|w| !w.is_empty());
    match configured {
        Some(weights) => weights.clone(),
        None => {
            let mut fallback = WeightVec::new();
            fallback.insert("conservative".to_string(), dec!(0.2));
            fallback.insert("balanced".to_string(), dec!(0.6));
            fallback.insert("aggressive".to_string(), dec!(0.2));
            // Keep only styles the symbol actually has, if any are known
            if !styles.is_empty() {
                fallback.retain(|style, _| styles.contains_key(style));
            }
            fallback
        }
    }
}

/// Ids whose symbol+style effective weight moved by more than the epsilon.
fn diff_weights(
    old: &BTreeMap<String, WeightVec>,
    new: &BTreeMap<String, WeightVec>,
    symbol_strategies: &SymbolStrategyMap,
) -> Vec<StrategyId> {
    let mut changed = BTreeSet::new();
    for (symbol, styles) in symbol_strategies {
        let empty = WeightVec::new();
        let old_vec = old.get(symbol).unwrap_or(&empty);
        let new_vec = new.get(symbol).unwrap_or(&empty);
        for (style, ids) in styles {
            let before = old_vec.get(style).copied().unwrap_or(Decimal::ZERO);
            let after = new_vec.get(style).copied().unwrap_or(Decimal::ZERO);
            if (after - before).abs() > WEIGHT_EPSILON {
                changed.extend(ids.iter().copied());
            }
        }
    }
    changed.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol_map(entries: &[(&str, &[(&str, &[StrategyId])])]) -> SymbolStrategyMap {
        entries
            .iter()
            .map(|(symbol, styles)| {
                let styles = styles
                    .iter()
                    .map(|(style, ids)| (style.to_string(), ids.to_vec()))
                    .collect();
                (symbol.to_string(), styles)
            })
            .collect()
    }

    fn weights_config(entries: &[(&str, &[(&str, Decimal)])]) -> MultiStrategyConfig
    {
        let mut config = MultiStrategyConfig::default();
        config.enabled = true;
        for (regime, styles) in entries {
            config.regime_to_weights.insert(
                regime.to_string(),
                styles.iter().map(|(s, w)| (s.to_string(), *w)).collect(),
            );
        }
        config
    }

    fn capitals(entries: &[(StrategyId, Decimal)]) -> HashMap<StrategyId, Decimal> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_allocation_with_cap_and_threshold() {
        // Pool 30000; aggressive weight 0.04 falls under the threshold,
        // balanced renormalizes to 30000*0.8=24000 capped at 10000*2,
        // conservative gets 30000*0.2=6000.
        let map = symbol_map(&[(
            "XAUUSD",
            &[
                ("balanced", &[1][..]),
                ("conservative", &[2][..]),
                ("aggressive", &[3][..]),
            ],
        )]);
        let mut config = weights_config(&[(
            "normal",
            &[
                ("balanced", dec!(0.76)),
                ("conservative", dec!(0.19)),
                ("aggressive", dec!(0.04)),
            ],
        )]);
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(30000));

        let allocator = PortfolioAllocator::new();
        let update = allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&capitals(&[(1, dec!(10000)), (2, dec!(10000)), (3, dec!(10000))])),
            &HashSet::new(),
        );

        let allocation = allocator.allocation();
        assert_eq!(allocation[&1], dec!(20000));
        assert_eq!(allocation[&2], dec!(6000));
        assert_eq!(allocation[&3], Decimal::ZERO);
        assert_eq!(update.started, vec![1, 2]);
        assert_eq!(update.target_count, 2);
        assert_eq!(update.symbols_with_pool, 1);
    }

    #[test]
    fn test_pool_from_initial_capital_and_style_count() {
        // No override: pool = max initial (5000) × 2 styles = 10000
        let map = symbol_map(&[(
            "00700.HK",
            &[("balanced", &[10][..]), ("conservative", &[11][..])],
        )]);
        let config = weights_config(&[(
            "normal",
            &[("balanced", dec!(0.5)), ("conservative", dec!(0.5))],
        )]);

        let allocator = PortfolioAllocator::new();
        allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&capitals(&[(10, dec!(5000)), (11, dec!(4000))])),
            &HashSet::new(),
        );

        assert_eq!(allocator.capital_pools()["00700.HK"], dec!(10000));
        assert_eq!(allocator.allocation()[&10], dec!(5000));
        // id 11's cap is 4000 * 2 = 8000, so its full share stands
        assert_eq!(allocator.allocation()[&11], dec!(5000));
    }

    #[test]
    fn test_no_capital_means_no_pool() {
        let map = symbol_map(&[("XAUUSD", &[("balanced", &[1][..])])]);
        let config = weights_config(&[("normal", &[("balanced", dec!(1.0))])]);

        let allocator = PortfolioAllocator::new();
        let update = allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            None,
            &HashSet::new(),
        );

        assert_eq!(update.symbols_with_pool, 0);
        assert!(allocator.allocation().is_empty());
        assert!(update.started.is_empty());
    }

    #[test]
    fn test_shared_pool_split_within_style() {
        let map = symbol_map(&[("XAUUSD", &[("balanced", &[1, 2][..])])]);
        let mut config = weights_config(&[("normal", &[("balanced", dec!(1.0))])]);
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(10000));

        let allocator = PortfolioAllocator::new();
        allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&capitals(&[(1, dec!(10000)), (2, dec!(10000))])),
            &HashSet::new(),
        );

        assert_eq!(allocator.allocation()[&1], dec!(5000));
        assert_eq!(allocator.allocation()[&2], dec!(5000));
    }

    #[test]
    fn test_freeze_on_shrink_unfreeze_on_growth() {
        let map = symbol_map(&[(
            "XAUUSD",
            &[("balanced", &[1][..]), ("conservative", &[2][..])],
        )]);
        let mut config = weights_config(&[
            ("normal", &[("balanced", dec!(0.6)), ("conservative", dec!(0.4))]),
            ("high_vol", &[("balanced", dec!(0.3)), ("conservative", dec!(0.7))]),
        ]);
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(10000));
        let caps = capitals(&[(1, dec!(10000)), (2, dec!(10000))]);

        let allocator = PortfolioAllocator::new();
        allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&caps),
            &HashSet::new(),
        );
        assert!(allocator.frozen().is_empty());

        // Shift to high_vol: balanced shrinks 6000→3000 and freezes,
        // conservative grows and stays unfrozen
        allocator.update_regime(
            Regime::HighVol,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&caps),
            &HashSet::new(),
        );
        assert_eq!(allocator.frozen(), BTreeSet::from([1]));

        // Back to normal: balanced grows 3000→6000 and unfreezes, while
        // conservative shrinks 7000→4000 and takes its turn frozen
        allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&caps),
            &HashSet::new(),
        );
        assert!(!allocator.is_frozen(1));
        assert_eq!(allocator.frozen(), BTreeSet::from([2]));
    }

    #[test]
    fn test_query_surface_and_manual_freeze() {
        let map = symbol_map(&[("XAUUSD", &[("balanced", &[1][..])])]);
        let mut config = weights_config(&[("normal", &[("balanced", dec!(1.0))])]);
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(10000));

        let allocator = PortfolioAllocator::new();
        allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&capitals(&[(1, dec!(10000))])),
            &HashSet::new(),
        );

        assert_eq!(allocator.allocated_capital(1), Some(dec!(10000)));
        assert_eq!(allocator.allocated_capital(99), None);
        assert_eq!(allocator.current_regime(), Some(Regime::Normal));
        assert_eq!(allocator.target_weights()["XAUUSD"]["balanced"], dec!(1.0));

        assert!(!allocator.is_frozen(1));
        allocator.freeze_strategy(1);
        assert!(allocator.is_frozen(1));
        allocator.unfreeze_strategy(1);
        assert!(!allocator.is_frozen(1));
    }

    #[test]
    fn test_zeroed_strategy_leaves_frozen_set() {
        let map = symbol_map(&[(
            "XAUUSD",
            &[("balanced", &[1][..]), ("aggressive", &[3][..])],
        )]);
        let mut config = weights_config(&[
            ("normal", &[("balanced", dec!(0.5)), ("aggressive", dec!(0.5))]),
            ("panic", &[("balanced", dec!(1.0)), ("aggressive", dec!(0.0))]),
        ]);
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(10000));
        let caps = capitals(&[(1, dec!(10000)), (3, dec!(10000))]);

        let allocator = PortfolioAllocator::new();
        allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&caps),
            &HashSet::new(),
        );
        let update = allocator.update_regime(
            Regime::Panic,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&caps),
            &HashSet::from([1, 3]),
        );

        assert!(!allocator.frozen().contains(&3));
        assert_eq!(allocator.allocated_capital(3), Some(Decimal::ZERO));
        assert_eq!(update.stopped, vec![3]);
    }

    #[test]
    fn test_zero_weight_managed_id_reports_zero_not_absent() {
        let map = symbol_map(&[(
            "XAUUSD",
            &[("balanced", &[1][..]), ("aggressive", &[3][..])],
        )]);
        let mut config = weights_config(&[(
            "panic",
            &[("balanced", dec!(1.0)), ("aggressive", dec!(0.0))],
        )]);
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(10000));

        let allocator = PortfolioAllocator::new();
        let update = allocator.update_regime(
            Regime::Panic,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&capitals(&[(1, dec!(10000)), (3, dec!(10000))])),
            &HashSet::new(),
        );

        // Managed at zero weight stays in the table with an explicit 0;
        // only ids outside the symbol map come back as None
        assert_eq!(allocator.allocated_capital(3), Some(Decimal::ZERO));
        assert_eq!(allocator.allocated_capital(99), None);
        // Zero entries are never start targets
        assert_eq!(update.started, vec![1]);
        assert_eq!(update.target_count, 1);
    }

    #[test]
    fn test_start_stop_diff_over_managed_only() {
        // Strategy 2 should start, strategy 1 (weight zeroed) should stop,
        // and the unmanaged running id 99 is never touched
        let map = symbol_map(&[(
            "XAUUSD",
            &[("balanced", &[2][..]), ("aggressive", &[1][..])],
        )]);
        let mut config = weights_config(&[(
            "panic",
            &[("balanced", dec!(1.0)), ("aggressive", dec!(0.0))],
        )]);
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(10000));

        let allocator = PortfolioAllocator::new();
        let update = allocator.update_regime(
            Regime::Panic,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&capitals(&[(1, dec!(10000)), (2, dec!(10000))])),
            &HashSet::from([1, 99]),
        );

        assert_eq!(update.started, vec![2]);
        assert_eq!(update.stopped, vec![1]);
        assert_eq!(update.running_count, 1);
    }

    #[test]
    fn test_per_symbol_regimes_produce_distinct_weights() {
        let map = symbol_map(&[
            ("00700.HK", &[("balanced", &[1][..]), ("conservative", &[2][..])]),
            ("XAUUSD", &[("balanced", &[3][..]), ("conservative", &[4][..])]),
        ]);
        let mut config = weights_config(&[
            ("normal", &[("balanced", dec!(0.7)), ("conservative", dec!(0.3))]),
            ("panic", &[("balanced", dec!(0.0)), ("conservative", dec!(1.0))]),
        ]);
        config
            .symbol_capital_pool
            .insert("00700.HK".to_string(), dec!(10000));
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(10000));

        let mut regimes = BTreeMap::new();
        regimes.insert("00700.HK".to_string(), Regime::Panic);
        regimes.insert("XAUUSD".to_string(), Regime::Normal);

        let allocator = PortfolioAllocator::new();
        allocator.update_regime(
            Regime::Normal,
            &regimes,
            &config,
            &map,
            Some(&capitals(&[
                (1, dec!(10000)),
                (2, dec!(10000)),
                (3, dec!(10000)),
                (4, dec!(10000)),
            ])),
            &HashSet::new(),
        );

        let weights = allocator.effective_weights();
        assert_eq!(weights["00700.HK"]["balanced"], Decimal::ZERO);
        assert_eq!(weights["00700.HK"]["conservative"], dec!(1.0));
        assert_eq!(weights["XAUUSD"]["balanced"], dec!(0.7));
    }

    #[test]
    fn test_weight_changed_uses_epsilon() {
        let map = symbol_map(&[("XAUUSD", &[("balanced", &[1][..])])]);
        let mut config = weights_config(&[("normal", &[("balanced", dec!(1.0))])]);
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(10000));
        let caps = capitals(&[(1, dec!(10000))]);

        let allocator = PortfolioAllocator::new();
        let first = allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&caps),
            &HashSet::new(),
        );
        assert_eq!(first.weight_changed, vec![1]);

        // Identical pass: nothing moved
        let second = allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&caps),
            &HashSet::from([1]),
        );
        assert!(second.weight_changed.is_empty());
        assert!(second.started.is_empty());
        assert!(second.stopped.is_empty());
    }

    #[test]
    fn test_fallback_weights_when_regime_unconfigured() {
        let map = symbol_map(&[(
            "XAUUSD",
            &[
                ("aggressive", &[1][..]),
                ("balanced", &[2][..]),
                ("conservative", &[3][..]),
            ],
        )]);
        let mut config = MultiStrategyConfig::default();
        config.enabled = true;
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(10000));

        let allocator = PortfolioAllocator::new();
        allocator.update_regime(
            Regime::LowVol,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&capitals(&[(1, dec!(10000)), (2, dec!(10000)), (3, dec!(10000))])),
            &HashSet::new(),
        );

        let weights = allocator.effective_weights();
        assert_eq!(weights["XAUUSD"]["balanced"], dec!(0.6));
        assert_eq!(weights["XAUUSD"]["conservative"], dec!(0.2));
    }

    #[test]
    fn test_gradual_transition_carries_across_passes() {
        let map = symbol_map(&[(
            "XAUUSD",
            &[
                ("aggressive", &[1][..]),
                ("balanced", &[2][..]),
                ("conservative", &[3][..]),
            ],
        )]);
        let mut config = weights_config(&[
            (
                "normal",
                &[
                    ("aggressive", dec!(0.2)),
                    ("balanced", dec!(0.6)),
                    ("conservative", dec!(0.2)),
                ],
            ),
            (
                "panic",
                &[
                    ("aggressive", dec!(0.0)),
                    ("balanced", dec!(0.2)),
                    ("conservative", dec!(0.8)),
                ],
            ),
        ]);
        config.transition.mode = "gradual".to_string();
        config.transition.max_step_per_tick = dec!(0.2);
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(10000));
        let caps = capitals(&[(1, dec!(10000)), (2, dec!(10000)), (3, dec!(10000))]);

        let allocator = PortfolioAllocator::new();
        // First pass jumps (no previous effective weights)
        allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&caps),
            &HashSet::new(),
        );
        // Panic pass moves each style at most 0.2, then renormalizes
        allocator.update_regime(
            Regime::Panic,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&caps),
            &HashSet::new(),
        );

        let weights = &allocator.effective_weights()["XAUUSD"];
        assert_eq!(weights["aggressive"], Decimal::ZERO);
        assert_eq!(weights["balanced"], dec!(0.5));
        assert_eq!(weights["conservative"], dec!(0.5));
    }

    #[test]
    fn test_portfolio_summary_rolls_up_exposure() {
        let map = symbol_map(&[("XAUUSD", &[("balanced", &[1, 2][..])])]);
        let mut config = weights_config(&[("normal", &[("balanced", dec!(1.0))])]);
        config
            .symbol_capital_pool
            .insert("XAUUSD".to_string(), dec!(20000));

        let allocator = PortfolioAllocator::new();
        allocator.update_regime(
            Regime::Normal,
            &BTreeMap::new(),
            &config,
            &map,
            Some(&capitals(&[(1, dec!(10000)), (2, dec!(10000))])),
            &HashSet::new(),
        );

        let positions = vec![
            StrategyPosition {
                strategy_id: 1,
                symbol: "XAUUSD".to_string(),
                side: "long".to_string(),
                size: dec!(2),
                entry_price: dec!(2400),
                current_price: dec!(2500),
                unrealized_pnl: dec!(200),
            },
            StrategyPosition {
                strategy_id: 2,
                symbol: "XAUUSD".to_string(),
                side: "short".to_string(),
                size: dec!(1),
                entry_price: dec!(2600),
                current_price: dec!(2500),
                unrealized_pnl: dec!(100),
            },
            // Unmanaged strategy is ignored
            StrategyPosition {
                strategy_id: 99,
                symbol: "XAUUSD".to_string(),
                side: "long".to_string(),
                size: dec!(5),
                entry_price: dec!(1),
                current_price: dec!(1),
                unrealized_pnl: dec!(1000),
            },
        ];

        let summary = allocator.portfolio_summary(&positions);
        let exposure = &summary.exposures["XAUUSD"];
        assert_eq!(exposure.total_long_value, dec!(5000));
        assert_eq!(exposure.total_short_value, dec!(2500));
        assert_eq!(exposure.net_exposure, dec!(2500));
        assert_eq!(summary.total_unrealized_pnl, dec!(300));
        assert_eq!(summary.total_equity, dec!(20000));
        assert_eq!(summary.regime, Regime::Normal);
    }
}
