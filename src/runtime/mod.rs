//! Strategy runtime seam.
//!
//! The allocation core never executes trades itself; it drives an
//! external runtime through this trait. `start` returns `Ok(false)` when
//! the runtime declines a start (capacity, strategy in a bad state) so
//! the controller can roll the persisted status back.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::StrategyId;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StrategyRuntime: Send + Sync {
    /// Request a strategy start. `Ok(false)` means the runtime declined.
    async fn start(&self, id: StrategyId) -> anyhow::Result<bool>;

    /// Request a strategy stop. Stopping a non-running id is a no-op.
    async fn stop(&self, id: StrategyId) -> anyhow::Result<()>;

    /// Live view of which strategies are currently running.
    async fn running_ids(&self) -> anyhow::Result<HashSet<StrategyId>>;
}

/// In-process runtime for paper runs and tests. Tracks a running set and
/// enforces an optional concurrency limit.
pub struct PaperRuntime {
    running: RwLock<HashSet<StrategyId>>,
    max_concurrent: Option<usize>,
}

impl PaperRuntime {
    pub fn new(max_concurrent: Option<usize>) -> Self {
        Self {
            running: RwLock::new(HashSet::new()),
            max_concurrent,
        }
    }

    /// Pre-seed the running set, e.g. to resume from persisted statuses.
    pub async fn seed(&self, ids: impl IntoIterator<Item = StrategyId>) {
        let mut running = self.running.write().await;
        running.extend(ids);
    }
}

impl Default for PaperRuntime {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl StrategyRuntime for PaperRuntime {
    async fn start(&self, id: StrategyId) -> anyhow::Result<bool> {
        let mut running = self.running.write().await;
        if let Some(limit) = self.max_concurrent {
            if !running.contains(&id) && running.len() >= limit {
                info!(%id, limit, "start declined, runtime at capacity");
                return Ok(false);
            }
        }
        running.insert(id);
        debug!(%id, "strategy started");
        Ok(true)
    }

    async fn stop(&self, id: StrategyId) -> anyhow::Result<()> {
        let mut running = self.running.write().await;
        if running.remove(&id) {
            debug!(%id, "strategy stopped");
        }
        Ok(())
    }

    async fn running_ids(&self) -> anyhow::Result<HashSet<StrategyId>> {
        Ok(self.running.read().await.clone())
    }
}
