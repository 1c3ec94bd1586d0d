// =============================================================================
// BoundaryAdapter — translates the command surface into subsystem calls (§6.1, C10)
// =============================================================================
//
// The HTTP handlers in `api::rest` never touch `AppState`'s subsystems
// directly — every command goes through here first, the same separation the
// teacher keeps between `api/rest.rs` (wire concerns: status codes, JSON
// shape) and the engines it calls into. Keeping that seam means the command
// surface can grow a second transport (a CLI, an internal RPC) without
// touching a single handler.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::config::{LiveConfig, LiveConfigPatch};
use crate::position::CloseOutcome;
use crate::types::{BalanceSnapshot, Position, RsiValue, Side, Timeframe};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::Desc
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub updated: usize,
    pub total: usize,
}

pub struct BoundaryAdapter {
    state: Arc<AppState>,
}

impl BoundaryAdapter {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// `get_positions(limit?, order)` (§6.1).
    pub fn get_positions(&self, limit: Option<usize>, order: SortOrder) -> Vec<Position> {
        let mut positions = self.state.store.all_sorted_by_created_at_desc(limit);
        if matches!(order, SortOrder::Asc) {
            positions.reverse();
        }
        positions
    }

    pub fn get_position(&self, id: &str) -> Option<Position> {
        self.state.store.get(id)
    }

    /// `create_position{tf, side, amount}` (§6.1).
    pub async fn create_position(&self, tf: Timeframe, side: Side, amount: f64) -> Result<Position> {
        let pool = self
            .state
            .static_config
            .pools
            .get(&tf)
            .ok_or_else(|| anyhow::anyhow!(crate::error::CoreError::Validation(format!(
                "no pool configured for timeframe {tf}"
            ))))?;
        let position = self
            .state
            .position_manager
            .create(&pool.pool_id, tf, side, amount, pool.strategy_type)
            .await?;
        self.state.bump_version();
        Ok(position)
    }

    /// `close_position{id}` (§6.1).
    pub async fn close_position(&self, id: &str) -> Result<CloseOutcome> {
        let outcome = self.state.position_manager.close(id, false).await?;
        self.state.bump_version();
        Ok(outcome)
    }

    /// `sync_positions` — on-demand reconciliation outside the scheduler's
    /// periodic resync, reporting how many positions changed status (§6.1).
    pub async fn sync_positions(&self) -> Result<SyncResult> {
        let before = self.state.store.all_active();
        self.state.position_manager.sync_with_chain().await?;
        let after = self.state.store.all_active();
        let total = self.state.store.all_sorted_by_created_at_desc(None).len();
        let updated = before.len().saturating_sub(after.len());
        self.state.bump_version();
        Ok(SyncResult { updated, total })
    }

    /// `get_balance` (§6.1).
    pub async fn get_balance(&self) -> Result<BalanceSnapshot> {
        self.state.wallet.balance().await
    }

    /// `get_balance_history{limit?, hours?}` (§6.1).
    pub fn get_balance_history(&self, limit: Option<usize>, hours: Option<u32>) -> Vec<BalanceSnapshot> {
        let mut snapshots = self.state.wallet.snapshots();
        if let Some(hours) = hours {
            let cutoff = chrono::Utc::now().timestamp() - hours as i64 * 3600;
            snapshots.retain(|s| s.timestamp >= cutoff);
        }
        snapshots.sort_by_key(|s| s.timestamp);
        if let Some(limit) = limit {
            if snapshots.len() > limit {
                let drop = snapshots.len() - limit;
                snapshots.drain(0..drop);
            }
        }
        snapshots
    }

    /// `get_rsi{tf?}` — every tracked timeframe when `tf` is omitted (§6.1).
    pub async fn get_rsi(&self, tf: Option<Timeframe>) -> Vec<RsiValue> {
        let cfg = self.state.live_config.read().clone();
        let symbol = &self.state.static_config.trading_symbol;
        match tf {
            Some(tf) => {
                match self
                    .state
                    .indicators
                    .get_rsi(symbol, tf, cfg.rsi_period, cfg.oversold, cfg.overbought)
                    .await
                {
                    Ok(value) => vec![value],
                    Err(_) => vec![RsiValue::neutral_fallback(tf, 0)],
                }
            }
            None => {
                self.state
                    .indicators
                    .rsi_all(symbol, cfg.rsi_period, cfg.oversold, cfg.overbought, &Timeframe::ALL)
                    .await
            }
        }
    }

    /// `get_price` (§6.1).
    pub async fn get_price(&self) -> Result<f64> {
        self.state
            .indicators
            .get_spot_price(&self.state.static_config.trading_symbol)
            .await
    }

    /// `get_config` (§6.1).
    pub fn get_config(&self) -> LiveConfig {
        self.state.live_config.read().clone()
    }

    /// `update_config{partial}` — validates, applies, persists (§6.1).
    pub fn update_config(&self, patch: LiveConfigPatch) -> Result<LiveConfig> {
        let updated = {
            let mut cfg = self.state.live_config.write();
            cfg.apply_patch(patch)?;
            cfg.clone()
        };
        updated.save(self.state.live_config_path())?;
        self.state.bump_version();
        Ok(updated)
    }
}
