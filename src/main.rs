//! Regime Allocator - Main Entry Point
//!
//! Runs the reconciliation controller on two timers: a regime tick that
//! re-resolves regimes and reconciles the running strategy set, and a
//! monitor tick that feeds portfolio equity through the circuit breaker.

use anyhow::Result;
use clap::{Parser, Subcommand};
use regime_allocator::config::{Config, FileConfigSource};
use regime_allocator::controller::ReconciliationController;
use regime_allocator::macrodata::{HttpMacroProvider, MacroDataProvider, StaticMacroProvider};
use regime_allocator::persistence::{SqliteStore, StatusStore};
use regime_allocator::regime::StaticMarketLookup;
use regime_allocator::runtime::PaperRuntime;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Regime Allocator CLI
#[derive(Parser)]
#[command(name = "regime-allocator")]
#[command(version, about = "Regime-driven multi-strategy capital allocation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show allocation status from the persisted state
    Status {
        /// Path to SQLite database (default: data/state.db)
        #[arg(short, long, default_value = "data/state.db")]
        db: String,
    },

    /// Load, validate, and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::Status { db }) => return show_status(&db),
        Some(Commands::CheckConfig) => return check_config(),
        None => {}
    }

    info!(
        "🚀 Regime Allocator v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load()?;
    config.validate()?;
    log_config(&config);

    if let Some(parent) = Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteStore::open(&config.database.path)?);

    let runtime = Arc::new(PaperRuntime::default());
    let lookup = Arc::new(StaticMarketLookup::new(
        config.symbol_markets.clone().into_iter().collect(),
    ));

    let macro_provider: Arc<dyn MacroDataProvider> = if config.macro_feed.base_url.is_empty() {
        warn!("⚠️  No macro feed configured, using static neutral indicators");
        Arc::new(StaticMacroProvider::default())
    } else {
        Arc::new(HttpMacroProvider::new(&config.macro_feed)?)
    };

    let controller = Arc::new(ReconciliationController::new(
        runtime,
        macro_provider,
        store,
        lookup,
        Arc::new(FileConfigSource),
    ));

    let mut regime_timer = tokio::time::interval(Duration::from_secs(
        config.scheduler.regime_interval_minutes * 60,
    ));
    let mut monitor_timer = tokio::time::interval(Duration::from_secs(
        config.scheduler.monitor_interval_minutes * 60,
    ));

    info!(
        regime_interval_min = config.scheduler.regime_interval_minutes,
        monitor_interval_min = config.scheduler.monitor_interval_minutes,
        "⏱️  Tick loop started"
    );

    loop {
        tokio::select! {
            _ = regime_timer.tick() => {
                let controller = controller.clone();
                tokio::spawn(async move { controller.regime_tick().await });
            }
            _ = monitor_timer.tick() => {
                let controller = controller.clone();
                tokio::spawn(async move { controller.monitor_tick().await });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown signal received");
                break;
            }
        }
    }

    info!("👋 Regime Allocator shutdown complete");
    Ok(())
}

/// Initialize logging with stdout and hourly file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "regime-allocator.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("regime_allocator=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log the operative configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Primary Indicator:   {}",
        config.regime_rules.primary_indicator
    );
    info!(
        "   Multi-Strategy:      {}",
        if config.multi_strategy.enabled { "weighted" } else { "legacy (binary)" }
    );
    info!(
        "   Weight Threshold:    {}",
        config.multi_strategy.min_weight_threshold
    );
    info!(
        "   Max Alloc Ratio:     {}x",
        config.multi_strategy.max_allocation_ratio
    );
    info!(
        "   Transition:          {} (step {})",
        config.multi_strategy.transition.mode,
        config.multi_strategy.transition.max_step_per_tick
    );
    let cb = &config.multi_strategy.circuit_breaker;
    if cb.enabled {
        info!(
            "   Circuit Breaker:     trip {}% / recover {}% / cooldown {}m",
            cb.max_drawdown_pct, cb.recovery_threshold_pct, cb.cooldown_minutes
        );
    } else {
        info!("   Circuit Breaker:     disabled");
    }
    info!(
        "   Managed Symbols:     {}",
        config.symbol_strategies.len()
    );
}

/// Print persisted allocation state.
fn show_status(db_path: &str) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              REGIME ALLOCATOR STATUS                       ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {db_path}");
        println!("   The allocator has not been started yet, or the path is wrong.");
        return Ok(());
    }

    let store = SqliteStore::open(db_path)?;

    let statuses = store.statuses()?;
    let capitals = store.initial_capitals()?;
    let map = store.symbol_strategies()?;

    println!("\n📊 Strategies");
    if map.is_empty() {
        println!("   (none registered)");
    }
    for (symbol, styles) in &map {
        println!("   ┌─ {symbol}");
        for (style, ids) in styles {
            for id in ids {
                let status = statuses.get(id).map(String::as_str).unwrap_or("unknown");
                let capital = capitals.get(id).copied().unwrap_or(Decimal::ZERO);
                println!("   ├─ #{id} {style:14} {status:8} ${capital}");
            }
        }
    }

    let snapshots = store.recent_equity(5)?;
    if !snapshots.is_empty() {
        println!("\n📉 Recent Equity");
        for (ts, equity, drawdown) in &snapshots {
            println!(
                "   ├─ {}: ${equity} (dd {drawdown}%)",
                ts.format("%Y-%m-%d %H:%M")
            );
        }
    }

    println!();
    Ok(())
}

/// Load and validate the configuration, printing the effective values.
fn check_config() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("\n✅ Configuration is valid");
    Ok(())
}
