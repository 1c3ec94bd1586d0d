// =============================================================================
// Central Application State — bin-sentinel trading engine
// =============================================================================
//
// The single source of truth for subsystem wiring. Every component (C1-C10)
// is constructed once in `AppState::new` and shared behind `Arc` — the same
// "build once, pass Arc clones to every task" shape the teacher's `AppState`
// uses, generalized from a multi-symbol scoring engine to the bin-position
// trading core.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{LiveConfig, StaticConfig};
use crate::indicators::IndicatorCache;
use crate::market_data::MarketDataClient;
use crate::pool::{PoolClient, RpcPoolClient};
use crate::position::{PositionManager, PositionStore};
use crate::rpc::RpcExecutor;
use crate::scheduler::Scheduler;
use crate::wallet::WalletService;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every mutation the
    /// HTTP surface might care about — lets `GET /api/v1/health` report
    /// liveness cheaply without diffing state.
    version: AtomicU64,
    /// Flipped once at shutdown; every scheduler cron loop checks it each
    /// tick and exits instead of firing again.
    pub shutting_down: Arc<AtomicBool>,

    pub static_config: StaticConfig,
    pub live_config: Arc<RwLock<LiveConfig>>,

    pub market_data: Arc<MarketDataClient>,
    pub indicators: Arc<IndicatorCache>,
    pub rpc: Arc<RpcExecutor>,
    pub pool: Arc<dyn PoolClient>,
    pub wallet: Arc<WalletService>,
    pub store: Arc<PositionStore>,
    pub position_manager: Arc<PositionManager>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(static_config: StaticConfig, live_config: LiveConfig) -> Self {
        let data_dir = std::path::PathBuf::from(&static_config.data_dir);

        let market_data = Arc::new(MarketDataClient::new(static_config.market_data_base_url.clone()));
        let indicators = Arc::new(IndicatorCache::new(market_data.clone()));
        let rpc = Arc::new(RpcExecutor::new(static_config.rpc_url.clone()));

        let bin_steps: HashMap<String, u32> = static_config
            .pools
            .values()
            .map(|p| (p.pool_id.clone(), p.bin_step_bps))
            .collect();
        let pool: Arc<dyn PoolClient> = Arc::new(RpcPoolClient::new(rpc.clone(), bin_steps));

        let wallet = Arc::new(WalletService::new(
            rpc.clone(),
            static_config.wallet_pubkey.clone(),
            static_config.base_token_mint.clone(),
            static_config.quote_token_mint.clone(),
            static_config.base_token_decimals,
            static_config.quote_token_decimals,
            data_dir.join("balance_history.json"),
        ));

        let store = Arc::new(PositionStore::new(data_dir.join("positions.json")));
        let position_manager = Arc::new(PositionManager::new(pool.clone(), store.clone(), wallet.clone()));

        let live_config = Arc::new(RwLock::new(live_config));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let scheduler = Arc::new(Scheduler::new(
            static_config.trading_symbol.clone(),
            indicators.clone(),
            pool.clone(),
            position_manager.clone(),
            store.clone(),
            wallet.clone(),
            static_config.pools.clone(),
            live_config.clone(),
            shutting_down.clone(),
        ));

        Self {
            version: AtomicU64::new(0),
            shutting_down,
            static_config,
            live_config,
            market_data,
            indicators,
            rpc,
            pool,
            wallet,
            store,
            position_manager,
            scheduler,
        }
    }

    /// Load positions and balance history persisted from a prior run.
    pub fn load_persisted_state(&self) -> anyhow::Result<()> {
        self.store.load()?;
        self.wallet.load_snapshots()?;
        Ok(())
    }

    pub fn live_config_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(&self.static_config.data_dir).join("live_config.json")
    }

    /// Persist everything durable on a graceful shutdown.
    pub fn persist_all(&self) -> anyhow::Result<()> {
        self.store.save()?;
        self.live_config.read().save(self.live_config_path())?;
        Ok(())
    }

    pub fn current_state_version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }
}
