//! Portfolio drawdown circuit breaker with hysteresis.
//!
//! Trips when drawdown from the equity peak reaches the configured
//! maximum, and recovers only after drawdown falls below a separate
//! (lower) recovery threshold AND a cooldown has elapsed. The two-sided
//! band stops the breaker from flapping around the trigger line.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub enabled: bool,
    pub triggered: bool,
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    pub current_drawdown_pct: Decimal,
    /// Minutes left before recovery becomes possible; zero when not
    /// triggered or the cooldown has already elapsed
    pub cooldown_remaining_minutes: f64,
}

#[derive(Debug, Default)]
struct BreakerState {
    peak_equity: Decimal,
    last_equity: Decimal,
    triggered: bool,
    triggered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Feed one equity reading and return whether the breaker is
    /// triggered afterwards. A disabled config returns false and leaves
    /// all state untouched.
    pub fn check(&self, current_equity: Decimal, config: &CircuitBreakerConfig) -> bool {
        if !config.enabled {
            return false;
        }

        let mut state = self.lock();
        state.last_equity = current_equity;
        if current_equity > state.peak_equity {
            state.peak_equity = current_equity;
        }

        let drawdown = drawdown_pct(state.peak_equity, current_equity);

        if state.triggered {
            let elapsed_minutes = state
                .triggered_at
                .map(|at| (Utc::now() - at).num_seconds() as f64 / 60.0)
                .unwrap_or(f64::MAX);
            if drawdown < config.recovery_threshold_pct
                && elapsed_minutes >= config.cooldown_minutes
            {
                state.triggered = false;
                state.triggered_at = None;
                info!(
                    drawdown = %drawdown,
                    "circuit breaker recovered, drawdown back inside recovery band"
                );
            }
        } else if drawdown >= config.max_drawdown_pct {
            state.triggered = true;
            state.triggered_at = Some(Utc::now());
            warn!(
                drawdown = %drawdown,
                peak = %state.peak_equity,
                equity = %current_equity,
                "circuit breaker TRIGGERED"
            );
        }

        state.triggered
    }

    pub fn is_triggered(&self) -> bool {
        self.lock().triggered
    }

    pub fn peak_equity(&self) -> Decimal {
        self.lock().peak_equity
    }

    /// Clear the trip state without touching the recorded peak.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.triggered = false;
        state.triggered_at = None;
        info!("circuit breaker manually reset");
    }

    /// Rebase the peak, e.g. after a capital injection or withdrawal.
    pub fn reset_peak(&self, equity: Decimal) {
        let mut state = self.lock();
        state.peak_equity = equity;
        state.last_equity = equity;
        info!(%equity, "circuit breaker peak rebased");
    }

    pub fn status(&self, config: &CircuitBreakerConfig) -> BreakerStatus {
        let state = self.lock();
        let cooldown_remaining = if state.triggered {
            state
                .triggered_at
                .map(|at| {
                    let elapsed = (Utc::now() - at).num_seconds() as f64 / 60.0;
                    (config.cooldown_minutes - elapsed).max(0.0)
                })
                .unwrap_or(config.cooldown_minutes)
        } else {
            0.0
        };

        BreakerStatus {
            enabled: config.enabled,
            triggered: state.triggered,
            peak_equity: state.peak_equity,
            current_equity: state.last_equity,
            current_drawdown_pct: drawdown_pct(state.peak_equity, state.last_equity),
            cooldown_remaining_minutes: cooldown_remaining,
        }
    }
}

fn drawdown_pct(peak: Decimal, current: Decimal) -> Decimal {
    if peak <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((peak - current) / peak * Decimal::new(100, 0)).max(Decimal::ZERO)
}
