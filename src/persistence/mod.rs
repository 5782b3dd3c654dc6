//! SQLite persistence for allocation state.
//!
//! Persists state the reconciliation loop needs across restarts:
//! - Strategy registry (symbol, style, status, initial capital)
//! - Open positions reported by the execution layer
//! - Periodic equity snapshots with drawdown
//!
//! Statuses are written through the stop/start protocol: stops persist
//! after the runtime confirms, starts persist before the runtime is
//! asked and roll back on rejection.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::allocator::StrategyPosition;
use crate::config::{StrategyId, SymbolStrategyMap};

/// Lifecycle status persisted per strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyStatus {
    Running,
    Stopped,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Running => "running",
            StrategyStatus::Stopped => "stopped",
        }
    }
}

/// Store surface the reconciliation controller depends on.
#[cfg_attr(test, mockall::automock)]
pub trait StatusStore: Send + Sync {
    /// Persist one status for a batch of strategies. Idempotent.
    fn set_statuses(&self, ids: &[StrategyId], status: StrategyStatus) -> Result<()>;

    /// strategy id → initial capital, for pool sizing and caps.
    fn initial_capitals(&self) -> Result<HashMap<StrategyId, Decimal>>;

    /// Fallback symbol map built from the registry when config has none.
    fn symbol_strategies(&self) -> Result<SymbolStrategyMap>;

    /// Open positions with positive size.
    fn positions(&self) -> Result<Vec<StrategyPosition>>;

    /// Append one equity snapshot.
    fn record_equity(&self, equity: Decimal, drawdown_pct: Decimal) -> Result<()>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database and initialize the schema.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("State store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory database, mainly for tests.
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            -- Strategy registry
            CREATE TABLE IF NOT EXISTS strategies (
                id INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                style TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'stopped',
                initial_capital TEXT NOT NULL DEFAULT '0'
            );
            CREATE INDEX IF NOT EXISTS idx_strategies_symbol ON strategies(symbol);

            -- Open positions, one row per strategy+symbol
            CREATE TABLE IF NOT EXISTS strategy_positions (
                strategy_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                size TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                current_price TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                PRIMARY KEY (strategy_id, symbol)
            );

            -- Equity snapshots from the monitor tick
            CREATE TABLE IF NOT EXISTS equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                equity TEXT NOT NULL,
                drawdown_pct TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON equity_snapshots(timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Register or update a strategy.
    pub fn upsert_strategy(
        &self,
        id: StrategyId,
        symbol: &str,
        style: &str,
        initial_capital: Decimal,
    ) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO strategies (id, symbol, style, status, initial_capital)
            VALUES (?1, ?2, ?3, 'stopped', ?4)
            ON CONFLICT(id) DO UPDATE SET
                symbol = ?2,
                style = ?3,
                initial_capital = ?4
            "#,
            params![id, symbol, style, initial_capital.to_string()],
        )?;
        Ok(())
    }

    /// Replace the stored position for a strategy+symbol.
    pub fn upsert_position(&self, position: &StrategyPosition) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO strategy_positions (strategy_id, symbol, side, size,
                                            entry_price, current_price, unrealized_pnl)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(strategy_id, symbol) DO UPDATE SET
                side = ?3,
                size = ?4,
                entry_price = ?5,
                current_price = ?6,
                unrealized_pnl = ?7
            "#,
            params![
                position.strategy_id,
                position.symbol,
                position.side,
                position.size.to_string(),
                position.entry_price.to_string(),
                position.current_price.to_string(),
                position.unrealized_pnl.to_string(),
            ],
        )?;
        Ok(())
    }

    /// strategy id → persisted status.
    pub fn statuses(&self) -> Result<HashMap<StrategyId, String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, status FROM strategies")?;
        let statuses = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(statuses)
    }

    /// Most recent equity snapshots, newest first.
    pub fn recent_equity(&self, limit: usize) -> Result<Vec<(DateTime<Utc>, Decimal, Decimal)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, equity, drawdown_pct
            FROM equity_snapshots
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let snapshots = stmt
            .query_map([limit], |row| {
                let ts: String = row.get(0)?;
                let equity: String = row.get(1)?;
                let drawdown: String = row.get(2)?;
                Ok((
                    DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    Decimal::from_str(&equity).unwrap_or_default(),
                    Decimal::from_str(&drawdown).unwrap_or_default(),
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(snapshots)
    }
}

impl StatusStore for SqliteStore {
    fn set_statuses(&self, ids: &[StrategyId], status: StrategyStatus) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE strategies SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
        }
        tx.commit()?;
        debug!(count = ids.len(), status = status.as_str(), "statuses persisted");
        Ok(())
    }

    fn initial_capitals(&self) -> Result<HashMap<StrategyId, Decimal>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, initial_capital FROM strategies")?;
        let capitals = stmt
            .query_map([], |row| {
                let id: StrategyId = row.get(0)?;
                let capital: String = row.get(1)?;
                Ok((id, Decimal::from_str(&capital).unwrap_or_default()))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(capitals)
    }

    fn symbol_strategies(&self) -> Result<SymbolStrategyMap> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, symbol, style FROM strategies")?;
        let rows: Vec<(StrategyId, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let mut map = SymbolStrategyMap::new();
        for (id, symbol, style) in rows {
            map.entry(symbol)
                .or_default()
                .entry(style)
                .or_default()
                .push(id);
        }
        Ok(map)
    }

    fn positions(&self) -> Result<Vec<StrategyPosition>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT strategy_id, symbol, side, size, entry_price, current_price, unrealized_pnl
            FROM strategy_positions
            "#,
        )?;

        let positions: Vec<StrategyPosition> = stmt
            .query_map([], |row| {
                Ok(StrategyPosition {
                    strategy_id: row.get(0)?,
                    symbol: row.get(1)?,
                    side: row.get(2)?,
                    size: Decimal::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
                    entry_price: Decimal::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
                    current_price: Decimal::from_str(&row.get::<_, String>(5)?)
                        .unwrap_or_default(),
                    unrealized_pnl: Decimal::from_str(&row.get::<_, String>(6)?)
                        .unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.ok())
            .filter(|p| p.size > Decimal::ZERO)
            .collect();

        Ok(positions)
    }

    fn record_equity(&self, equity: Decimal, drawdown_pct: Decimal) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO equity_snapshots (timestamp, equity, drawdown_pct)
            VALUES (?1, ?2, ?3)
            "#,
            params![
                Utc::now().to_rfc3339(),
                equity.to_string(),
                drawdown_pct.to_string(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_registry_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_strategy(1, "XAUUSD", "balanced", dec!(10000))
            .unwrap();
        store
            .upsert_strategy(2, "XAUUSD", "conservative", dec!(5000))
            .unwrap();
        store
            .upsert_strategy(3, "00700.HK", "balanced", dec!(8000))
            .unwrap();

        let capitals = store.initial_capitals().unwrap();
        assert_eq!(capitals[&1], dec!(10000));
        assert_eq!(capitals[&3], dec!(8000));

        let map = store.symbol_strategies().unwrap();
        assert_eq!(map["XAUUSD"]["balanced"], vec![1]);
        assert_eq!(map["XAUUSD"]["conservative"], vec![2]);
        assert_eq!(map["00700.HK"]["balanced"], vec![3]);
    }

    #[test]
    fn test_status_updates_are_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_strategy(1, "XAUUSD", "balanced", dec!(10000))
            .unwrap();

        store.set_statuses(&[1], StrategyStatus::Running).unwrap();
        store.set_statuses(&[1], StrategyStatus::Running).unwrap();
        assert_eq!(store.statuses().unwrap()[&1], "running");

        store.set_statuses(&[1], StrategyStatus::Stopped).unwrap();
        assert_eq!(store.statuses().unwrap()[&1], "stopped");
    }

    #[test]
    fn test_positions_filter_zero_size() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_position(&StrategyPosition {
                strategy_id: 1,
                symbol: "XAUUSD".to_string(),
                side: "long".to_string(),
                size: dec!(2),
                entry_price: dec!(2400),
                current_price: dec!(2500),
                unrealized_pnl: dec!(200),
            })
            .unwrap();
        store
            .upsert_position(&StrategyPosition {
                strategy_id: 2,
                symbol: "XAUUSD".to_string(),
                side: "long".to_string(),
                size: Decimal::ZERO,
                entry_price: dec!(2400),
                current_price: dec!(2500),
                unrealized_pnl: Decimal::ZERO,
            })
            .unwrap();

        let positions = store.positions().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].strategy_id, 1);
    }

    #[test]
    fn test_equity_snapshots_newest_first() {
        let store = SqliteStore::in_memory().unwrap();
        store.record_equity(dec!(100000), dec!(0)).unwrap();
        store.record_equity(dec!(95000), dec!(5)).unwrap();

        let recent = store.recent_equity(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].1, dec!(95000));
        assert_eq!(recent[1].2, dec!(0));
    }
}
