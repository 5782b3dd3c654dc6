//! Reconciliation controller.
//!
//! Owns the two periodic ticks: the regime tick (resolve regimes, rerun
//! the allocator, reconcile the running set) and the monitor tick
//! (portfolio equity, circuit breaker, emergency stop on a fresh trip).
//! Each tick carries a non-blocking re-entrancy guard: an overrunning
//! tick makes the next one skip with a log line instead of queueing.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::allocator::PortfolioAllocator;
use crate::breaker::CircuitBreaker;
use crate::config::{Config, ConfigSource, StrategyId, SymbolStrategyMap};
use crate::macrodata::MacroDataProvider;
use crate::persistence::{StatusStore, StrategyStatus};
use crate::regime::{self, MarketLookup, Regime};
use crate::runtime::StrategyRuntime;

pub struct ReconciliationController {
    allocator: Arc<PortfolioAllocator>,
    breaker: Arc<CircuitBreaker>,
    runtime: Arc<dyn StrategyRuntime>,
    macro_provider: Arc<dyn MacroDataProvider>,
    store: Arc<dyn StatusStore>,
    lookup: Arc<dyn MarketLookup>,
    config_source: Arc<dyn ConfigSource>,
    regime_guard: Mutex<()>,
    monitor_guard: Mutex<()>,
}

impl ReconciliationController {
    pub fn new(
        runtime: Arc<dyn StrategyRuntime>,
        macro_provider: Arc<dyn MacroDataProvider>,
        store: Arc<dyn StatusStore>,
        lookup: Arc<dyn MarketLookup>,
        config_source: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            allocator: Arc::new(PortfolioAllocator::new()),
            breaker: Arc::new(CircuitBreaker::new()),
            runtime,
            macro_provider,
            store,
            lookup,
            config_source,
            regime_guard: Mutex::new(()),
            monitor_guard: Mutex::new(()),
        }
    }

    pub fn allocator(&self) -> &Arc<PortfolioAllocator> {
        &self.allocator
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// One regime reconciliation pass. Skips immediately if the previous
    /// pass is still in flight.
    pub async fn regime_tick(&self) {
        let Ok(_guard) = self.regime_guard.try_lock() else {
            info!("⏭️  [REGIME] previous tick still running, skipping");
            return;
        };

        let config = self.config_source.load();
        let symbol_strategies = self.symbol_strategies(&config);
        if symbol_strategies.is_empty() {
            debug!("[REGIME] no managed strategies, nothing to do");
            return;
        }

        let snapshot = self.macro_provider.snapshot().await;
        let regimes = regime::resolve_per_symbol(
            &snapshot,
            &config.regime_rules,
            &symbol_strategies,
            self.lookup.as_ref(),
        );
        let default_regime = regimes
            .values()
            .next()
            .copied()
            .unwrap_or(Regime::Normal);

        if config.multi_strategy.enabled {
            self.run_weighted(&config, &symbol_strategies, default_regime, &regimes)
                .await;
        } else {
            self.run_legacy(&config, &symbol_strategies, &regimes).await;
        }
    }

    /// One portfolio monitor pass: equity, breaker, snapshot, emergency
    /// stop when the breaker freshly trips.
    pub async fn monitor_tick(&self) {
        let Ok(_guard) = self.monitor_guard.try_lock() else {
            debug!("[MONITOR] previous tick still running, skipping");
            return;
        };

        let config = self.config_source.load();
        let breaker_config = &config.multi_strategy.circuit_breaker;
        if !config.multi_strategy.enabled || !breaker_config.enabled {
            return;
        }

        let positions = match self.store.positions() {
            Ok(positions) => positions,
            Err(e) => {
                warn!("[MONITOR] failed to load positions: {e:#}");
                Vec::new()
            }
        };
        let summary = self.allocator.portfolio_summary(&positions);
        let equity = summary.total_equity + summary.total_unrealized_pnl;

        let was_triggered = self.breaker.is_triggered();
        let triggered = self.breaker.check(equity, breaker_config);
        let status = self.breaker.status(breaker_config);

        if let Err(e) = self
            .store
            .record_equity(equity, status.current_drawdown_pct)
        {
            warn!("[MONITOR] failed to record equity snapshot: {e:#}");
        }

        if triggered && !was_triggered {
            error!(
                equity = %equity,
                drawdown = %status.current_drawdown_pct,
                "🚨 [MONITOR] circuit breaker tripped, stopping all managed strategies"
            );
            let managed: Vec<StrategyId> = self.allocator.managed().into_iter().collect();
            self.stop_strategies(&managed).await;
        }

        info!(
            equity = %equity,
            drawdown = %status.current_drawdown_pct,
            triggered = status.triggered,
            "📊 [MONITOR] portfolio checked"
        );
    }

    fn symbol_strategies(&self, config: &Config) -> SymbolStrategyMap {
        if !config.symbol_strategies.is_empty() {
            return config.symbol_strategies.clone();
        }
        match self.store.symbol_strategies() {
            Ok(map) => map,
            Err(e) => {
                warn!("[REGIME] failed to load strategy registry: {e:#}");
                SymbolStrategyMap::new()
            }
        }
    }

    async fn run_weighted(
        &self,
        config: &Config,
        symbol_strategies: &SymbolStrategyMap,
        default_regime: Regime,
        regimes: &BTreeMap<String, Regime>,
    ) {
        let initial_capitals = match self.store.initial_capitals() {
            Ok(capitals) => capitals,
            Err(e) => {
                warn!("[REGIME] failed to load initial capitals: {e:#}");
                HashMap::new()
            }
        };
        let running = self.running_ids().await;

        let update = self.allocator.update_regime(
            default_regime,
            regimes,
            &config.multi_strategy,
            symbol_strategies,
            Some(&initial_capitals),
            &running,
        );

        // Stops first so released capital is free before new starts
        self.stop_strategies(&update.stopped).await;
        self.start_strategies(&update.started).await;

        info!(
            regime = %default_regime,
            started = update.started.len(),
            stopped = update.stopped.len(),
            reweighted = update.weight_changed.len(),
            running = update.running_count,
            target = update.target_count,
            pools = format!("{}/{}", update.symbols_with_pool, update.symbols_total),
            "🔄 [REGIME] reconciliation complete"
        );
    }

    /// Legacy binary mode: each symbol's regime maps to the styles that
    /// should run, everything else stops.
    async fn run_legacy(
        &self,
        config: &Config,
        symbol_strategies: &SymbolStrategyMap,
        regimes: &BTreeMap<String, Regime>,
    ) {
        let mut target: BTreeSet<StrategyId> = BTreeSet::new();
        let mut managed: BTreeSet<StrategyId> = BTreeSet::new();
        let default_styles = vec!["balanced".to_string()];

        for (symbol, styles) in symbol_strategies {
            let regime = regimes.get(symbol).copied().unwrap_or(Regime::Normal);
            let active_styles = config
                .regime_to_style
                .get(regime.as_str())
                .unwrap_or(&default_styles);
            for (style, ids) in styles {
                managed.extend(ids.iter().copied());
                if active_styles.contains(style) {
                    target.extend(ids.iter().copied());
                }
            }
        }

        let running: BTreeSet<StrategyId> = self
            .running_ids()
            .await
            .into_iter()
            .filter(|id| managed.contains(id))
            .collect();
        let stopped: Vec<StrategyId> = running.difference(&target).copied().collect();
        let started: Vec<StrategyId> = target.difference(&running).copied().collect();

        self.stop_strategies(&stopped).await;
        self.start_strategies(&started).await;

        info!(
            started = started.len(),
            stopped = stopped.len(),
            target = target.len(),
            "🔄 [REGIME] legacy reconciliation complete"
        );
    }

    async fn running_ids(&self) -> HashSet<StrategyId> {
        match self.runtime.running_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("[REGIME] failed to query running strategies: {e:#}");
                HashSet::new()
            }
        }
    }

    /// Stop protocol: runtime first, then persist Stopped. A runtime
    /// failure is logged and the status still persists so the next tick
    /// retries from a consistent picture.
    async fn stop_strategies(&self, ids: &[StrategyId]) {
        if ids.is_empty() {
            return;
        }
        for id in ids {
            if let Err(e) = self.runtime.stop(*id).await {
                warn!(%id, "⛔ [STOP] runtime stop failed: {e:#}");
            }
        }
        if let Err(e) = self.store.set_statuses(ids, StrategyStatus::Stopped) {
            warn!("⛔ [STOP] failed to persist stopped statuses: {e:#}");
        }
    }

    /// Start protocol: persist Running first so a crash mid-start leaves
    /// an over-approximation, then ask the runtime and revert anything it
    /// declined or failed back to Stopped.
    async fn start_strategies(&self, ids: &[StrategyId]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.store.set_statuses(ids, StrategyStatus::Running) {
            warn!("▶️  [START] failed to persist running statuses: {e:#}");
        }

        let mut declined = Vec::new();
        for id in ids {
            match self.runtime.start(*id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(%id, "▶️  [START] runtime declined start");
                    declined.push(*id);
                }
                Err(e) => {
                    warn!(%id, "▶️  [START] runtime start failed: {e:#}");
                    declined.push(*id);
                }
            }
        }

        if !declined.is_empty() {
            if let Err(e) = self.store.set_statuses(&declined, StrategyStatus::Stopped) {
                warn!("▶️  [START] failed to revert declined starts: {e:#}");
            }
        }
    }
}
