// =============================================================================
// Scheduler — per-timeframe cron for signal evaluation, range monitoring,
// and the global harvest tick (C8)
// =============================================================================
//
// One `tokio::spawn`ed loop per timeframe per concern, the same shape as the
// teacher's per-symbol stream loops in `main.rs`: `tokio::time::interval`,
// tick, act, repeat forever. Every handler is reentrancy-safe — a lease set
// (mirroring C7's `closing_positions` guard) is checked and inserted before
// any await, so a tick that outlives its own period is simply skipped rather
// than queued or run twice concurrently.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info, instrument, warn};

use crate::config::LiveConfig;
use crate::error::CoreError;
use crate::indicators::IndicatorCache;
use crate::pool::PoolClient;
use crate::position::{PositionManager, PositionStore};
use crate::types::{Position, PoolDescriptor, RsiSignal, Side, Timeframe};
use crate::wallet::WalletService;

const HARVEST_TICK_INTERVAL: Duration = Duration::from_secs(60);
const HOURLY_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Defensive re-reconciliation beyond the one run at startup, in the style of
/// the teacher's `reconcile.rs` periodic loop (there: every 60s against the
/// exchange; here: far less frequent since on-chain accounts don't drift on
/// their own between ticks).
const CHAIN_RESYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct Scheduler {
    symbol: String,
    indicators: Arc<IndicatorCache>,
    pool: Arc<dyn PoolClient>,
    manager: Arc<PositionManager>,
    store: Arc<PositionStore>,
    wallet: Arc<WalletService>,
    pools: HashMap<Timeframe, PoolDescriptor>,
    config: Arc<RwLock<LiveConfig>>,
    shutting_down: Arc<AtomicBool>,
    signal_leases: Mutex<HashSet<Timeframe>>,
    range_leases: Mutex<HashSet<Timeframe>>,
    harvest_lease: AtomicBool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        indicators: Arc<IndicatorCache>,
        pool: Arc<dyn PoolClient>,
        manager: Arc<PositionManager>,
        store: Arc<PositionStore>,
        wallet: Arc<WalletService>,
        pools: HashMap<Timeframe, PoolDescriptor>,
        config: Arc<RwLock<LiveConfig>>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            indicators,
            pool,
            manager,
            store,
            wallet,
            pools,
            config,
            shutting_down,
            signal_leases: Mutex::new(HashSet::new()),
            range_leases: Mutex::new(HashSet::new()),
            harvest_lease: AtomicBool::new(false),
        }
    }

    /// Reconcile on-chain state once at startup — positions whose close was
    /// mid-flight at the previous shutdown are picked up here.
    pub async fn startup_reconcile(&self) {
        if let Err(err) = self.manager.sync_with_chain().await {
            warn!(%err, "startup reconciliation failed");
        }
    }

    /// Spawn every cron loop this engine needs and return their join handles
    /// so the caller can await them during graceful shutdown.
    pub fn spawn(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        for tf in Timeframe::ALL {
            let s = self.clone();
            handles.push(tokio::spawn(async move { s.signal_loop(tf).await }));

            let s = self.clone();
            handles.push(tokio::spawn(async move { s.range_loop(tf).await }));
        }

        let s = self.clone();
        handles.push(tokio::spawn(async move { s.harvest_loop().await }));

        let s = self.clone();
        handles.push(tokio::spawn(async move { s.hourly_snapshot_loop().await }));

        let s = self.clone();
        handles.push(tokio::spawn(async move { s.chain_resync_loop().await }));

        info!("scheduler: all cron loops launched");
        handles
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // signal evaluation cron
    // -------------------------------------------------------------------------

    async fn signal_loop(self: Arc<Self>, tf: Timeframe) {
        let mut ticker = interval(tf.cron_period());
        loop {
            ticker.tick().await;
            if self.is_shutting_down() {
                return;
            }
            self.evaluate_signal(tf).await;
        }
    }

    /// Reentrancy-guarded entry point for `evaluate_signal(tf)`.
    async fn evaluate_signal(&self, tf: Timeframe) {
        {
            let mut leases = self.signal_leases.lock();
            if leases.contains(&tf) {
                debug!(%tf, "signal tick skipped — prior invocation still running");
                return;
            }
            leases.insert(tf);
        }

        if let Err(err) = self.evaluate_signal_inner(tf).await {
            warn!(%tf, %err, "signal evaluation failed — will retry next tick");
        }

        self.signal_leases.lock().remove(&tf);
    }

    #[instrument(skip(self), fields(%tf))]
    async fn evaluate_signal_inner(&self, tf: Timeframe) -> Result<()> {
        let Some(pool) = self.pools.get(&tf) else {
            return Ok(());
        };
        let cfg = self.config.read().clone();
        if !cfg.is_enabled(tf) {
            return Ok(());
        }

        let rsi = self
            .indicators
            .refresh_rsi(&self.symbol, tf, cfg.rsi_period, cfg.oversold, cfg.overbought)
            .await?;
        let current_price = self.indicators.get_spot_price(&self.symbol).await?;
        let active = self.store.active_by_timeframe(tf);

        match rsi.signal {
            RsiSignal::Oversold => {
                self.pursue_side(tf, pool, &cfg, active, Side::Buy, current_price).await
            }
            RsiSignal::Overbought => {
                self.pursue_side(tf, pool, &cfg, active, Side::Sell, current_price).await
            }
            RsiSignal::Neutral => {
                if let Some(position) = active {
                    if extremely_out_of_range(&position, current_price) {
                        info!(%tf, id = %position.id, price = current_price, "neutral RSI + extreme range exit — closing");
                        self.manager.close(&position.id, false).await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Step 4/5 of the signal tick: replace the active position with `side`
    /// unless it already holds `side` within range, then size and create.
    async fn pursue_side(
        &self,
        tf: Timeframe,
        pool: &PoolDescriptor,
        cfg: &LiveConfig,
        active: Option<Position>,
        side: Side,
        current_price: f64,
    ) -> Result<()> {
        if let Some(position) = &active {
            if position.side == side && self.manager.is_in_valid_range(position, current_price) {
                return Ok(());
            }
            info!(%tf, id = %position.id, %side, "replacing existing position ahead of new entry");
            self.manager.close(&position.id, false).await?;
            sleep(Duration::from_secs(1)).await;
        }

        let balance = self.wallet.balance().await?;
        let relevant_balance = match side {
            Side::Buy => balance.base_qty,
            Side::Sell => balance.quote_qty,
        };
        let amount = relevant_balance * cfg.position_factor(tf);

        match self.manager.create(&pool.pool_id, tf, side, amount, pool.strategy_type).await {
            Ok(position) => {
                info!(%tf, id = %position.id, %side, amount, "position created by signal tick");
                Ok(())
            }
            Err(err) if matches!(crate::error::classify(&err), Some(CoreError::Validation(_))) => {
                debug!(%tf, %side, amount, %err, "sizing below minimum — holding cash this tick");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // -------------------------------------------------------------------------
    // range monitor cron
    // -------------------------------------------------------------------------

    async fn range_loop(self: Arc<Self>, tf: Timeframe) {
        let mut ticker = interval(tf.cron_period());
        loop {
            ticker.tick().await;
            if self.is_shutting_down() {
                return;
            }
            self.monitor_range(tf).await;
        }
    }

    async fn monitor_range(&self, tf: Timeframe) {
        {
            let mut leases = self.range_leases.lock();
            if leases.contains(&tf) {
                debug!(%tf, "range monitor tick skipped — prior invocation still running");
                return;
            }
            leases.insert(tf);
        }

        if let Err(err) = self.monitor_range_inner(tf).await {
            warn!(%tf, %err, "range monitor tick failed");
        }

        self.range_leases.lock().remove(&tf);
    }

    #[instrument(skip(self), fields(%tf))]
    async fn monitor_range_inner(&self, tf: Timeframe) -> Result<()> {
        let Some(position) = self.store.active_by_timeframe(tf) else {
            return Ok(());
        };
        let cfg = self.config.read().clone();

        let rsi = self
            .indicators
            .get_rsi(&self.symbol, tf, cfg.rsi_period, cfg.oversold, cfg.overbought)
            .await?;
        let current_price = self.indicators.get_spot_price(&self.symbol).await?;
        let in_range = self.manager.is_in_valid_range(&position, current_price);

        let should_close = match position.side {
            Side::Buy => {
                rsi.signal == RsiSignal::Overbought || current_price >= position.price_range.max || !in_range
            }
            Side::Sell => {
                rsi.signal == RsiSignal::Oversold || current_price <= position.price_range.min || !in_range
            }
        };

        if should_close {
            info!(%tf, id = %position.id, signal = %rsi.signal, in_range, "range monitor closing position");
            self.manager.close(&position.id, false).await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // global harvest tick
    // -------------------------------------------------------------------------

    async fn harvest_loop(self: Arc<Self>) {
        let mut ticker = interval(HARVEST_TICK_INTERVAL);
        loop {
            ticker.tick().await;
            if self.is_shutting_down() {
                return;
            }
            self.harvest_tick().await;
        }
    }

    async fn harvest_tick(&self) {
        if self.harvest_lease.swap(true, Ordering::AcqRel) {
            debug!("harvest tick skipped — prior invocation still running");
            return;
        }

        if let Err(err) = self.harvest_tick_inner().await {
            warn!(%err, "harvest tick failed");
        }

        self.harvest_lease.store(false, Ordering::Release);
    }

    #[instrument(skip(self))]
    async fn harvest_tick_inner(&self) -> Result<()> {
        let cfg = self.config.read().clone();
        if !cfg.harvest_enabled {
            return Ok(());
        }

        for position in self.store.all_active() {
            let Some(pool) = self.pools.get(&position.timeframe) else {
                continue;
            };
            let current_price = self.indicators.get_spot_price(&self.symbol).await?;

            if self.harvest_precondition(&position, pool, &cfg, current_price).await {
                if let Err(err) = self.manager.harvest(&position, current_price).await {
                    warn!(id = %position.id, %err, "harvest attempt failed");
                }
            }
        }

        Ok(())
    }

    /// `current > min` (BUY) / `current < max` (SELL), and at least
    /// `harvest_min_bins` bins have traded through since the position's
    /// original bound. Falls back to a flat price-move test if the on-chain
    /// read fails.
    async fn harvest_precondition(
        &self,
        position: &Position,
        pool: &PoolDescriptor,
        cfg: &LiveConfig,
        current_price: f64,
    ) -> bool {
        let price_clears_entry = match position.side {
            Side::Buy => current_price > position.price_range.min,
            Side::Sell => current_price < position.price_range.max,
        };
        if !price_clears_entry {
            return false;
        }

        match self.pool.active_bin(&pool.pool_id).await {
            Ok(active) => {
                let bins_traded = match position.side {
                    Side::Buy => active.bin_id - position.price_range.bin_range.min_bin,
                    Side::Sell => position.price_range.bin_range.max_bin - active.bin_id,
                };
                bins_traded.max(0) as u32 >= cfg.harvest_min_bins
            }
            Err(err) => {
                warn!(id = %position.id, %err, "harvest precondition: active bin read failed — falling back to price-move test");
                let move_pct = match position.side {
                    Side::Buy => (current_price - position.entry_price) / position.entry_price,
                    Side::Sell => (position.entry_price - current_price) / position.entry_price,
                };
                move_pct >= cfg.harvest_min_price_move
            }
        }
    }

    // -------------------------------------------------------------------------
    // ambient crons
    // -------------------------------------------------------------------------

    async fn hourly_snapshot_loop(self: Arc<Self>) {
        let mut ticker = interval(HOURLY_SNAPSHOT_INTERVAL);
        loop {
            ticker.tick().await;
            if self.is_shutting_down() {
                return;
            }
            if let Err(err) = self.wallet.append_hourly_snapshot().await {
                warn!(%err, "hourly balance snapshot failed");
            }
        }
    }

    async fn chain_resync_loop(self: Arc<Self>) {
        let mut ticker = interval(CHAIN_RESYNC_INTERVAL);
        loop {
            ticker.tick().await;
            if self.is_shutting_down() {
                return;
            }
            if let Err(err) = self.manager.sync_with_chain().await {
                warn!(%err, "periodic chain resync failed");
            }
        }
    }
}

/// Neutral-RSI close rule: price has moved beyond the buffered range by an
/// additional 50% of that buffer.
fn extremely_out_of_range(position: &Position, current_price: f64) -> bool {
    let buf = (position.price_range.max - position.price_range.min) * position.timeframe.range_buffer_pct();
    let extra = buf * 0.5;
    current_price < position.price_range.min - buf - extra || current_price > position.price_range.max + buf + extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BinRange, PositionStatus, PriceRange};

    fn position(side: Side, min: f64, max: f64) -> Position {
        Position {
            id: "p1".into(),
            pool_id: "pool".into(),
            timeframe: Timeframe::H1,
            side,
            amount: 1.0,
            entry_price: (min + max) / 2.0,
            created_at: 0,
            status: PositionStatus::Active,
            price_range: PriceRange { min, max, bin_range: BinRange { min_bin: 0, max_bin: 10 } },
            last_range_check: 0,
            has_been_harvested: false,
            last_harvest_at: None,
            closed_at: None,
        }
    }

    #[test]
    fn extreme_exit_triggers_well_outside_buffered_range() {
        // H1 buffer is 8%; range is [90, 110] so buf=1.6, extra=0.8 -> trigger past 111.6 / 88.4.
        let p = position(Side::Buy, 90.0, 110.0);
        assert!(!extremely_out_of_range(&p, 111.0));
        assert!(extremely_out_of_range(&p, 120.0));
        assert!(extremely_out_of_range(&p, 80.0));
    }

    #[test]
    fn extreme_exit_false_within_buffered_range() {
        let p = position(Side::Sell, 90.0, 110.0);
        assert!(!extremely_out_of_range(&p, 100.0));
    }
}
