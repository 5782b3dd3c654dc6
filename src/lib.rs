//! # Regime Allocator
//!
//! Regime-driven capital allocation for a fleet of trading strategies:
//! resolve a market regime from macro indicators, turn it into per-style
//! weight vectors and per-strategy dollar allocations, and reconcile the
//! set of running strategies against that target.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `macrodata`: Macro indicator feeds (VIX, VHSI, CIVIX, Fear & Greed)
//! - `regime`: Regime resolution, per-market routing, custom expressions
//! - `allocator`: Weight pipeline, capital pools, start/stop diffing
//! - `breaker`: Portfolio drawdown circuit breaker with hysteresis
//! - `runtime`: Strategy runtime seam (start/stop/running set)
//! - `persistence`: SQLite-based strategy registry and equity snapshots
//! - `controller`: Periodic regime and monitor ticks

pub mod allocator;
pub mod breaker;
pub mod config;
pub mod controller;
pub mod macrodata;
pub mod persistence;
pub mod regime;
pub mod runtime;

pub use config::Config;
