// =============================================================================
// PoolClient — thin adapter to the on-chain AMM program (§4.3, C3)
// =============================================================================
//
// The AMM program's instruction encoding and account layout are out of scope
// for this crate (§1) — `RpcPoolClient` treats them as opaque JSON-RPC calls
// routed through `RpcExecutor`, the same way the teacher's `BinanceClient`
// treats the exchange's REST surface as an opaque HTTP adapter. `PoolClient`
// is a trait (not a single struct) so `PositionManager` can be exercised
// against a fake in tests, following the pack's `async-trait` adapter idiom.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{instrument, warn};

use crate::rpc::RpcExecutor;
use crate::types::Side;

use super::bin_math;

#[derive(Debug, Clone, Copy)]
pub struct ActiveBin {
    pub bin_id: i32,
    pub price: f64,
}

#[derive(Debug, Clone)]
pub struct CreatePositionResult {
    pub tx_signature: String,
    pub position_account: String,
}

#[derive(Debug, Clone)]
pub struct PositionAccount {
    pub lower_bin: i32,
    pub upper_bin: i32,
    pub last_updated_at: i64,
    pub owner: String,
}

#[async_trait]
pub trait PoolClient: Send + Sync {
    /// Bin step in basis points for `pool_id`, needed by callers that must
    /// convert a bin offset to a price without an extra round trip through
    /// `active_bin`. Every timeframe's pool can carry its own bin step, so
    /// this is keyed by pool, not fixed per adapter.
    fn bin_step_bps(&self, pool_id: &str) -> u32;

    async fn active_bin(&self, pool_id: &str) -> Result<ActiveBin>;

    /// Idempotent — initializing an already-initialized bin array is not an
    /// error (§4.3, §4.7 step 4).
    async fn ensure_bin_arrays(&self, pool_id: &str, min_bin: i32, max_bin: i32) -> Result<()>;

    async fn create_one_sided_position(
        &self,
        pool_id: &str,
        side: Side,
        amount_base: f64,
        amount_quote: f64,
        min_bin: i32,
        max_bin: i32,
        strategy: crate::types::StrategyType,
        slippage_pct: f64,
    ) -> Result<CreatePositionResult>;

    /// Returns one transaction signature per chunk the program split the
    /// removal into. "No liquidity to remove" is a success with an empty
    /// vec, not an error (§4.7 Phase 1).
    async fn remove_liquidity(
        &self,
        position_account: &str,
        from_bin: i32,
        to_bin: i32,
        bps: u32,
        should_claim_and_close: bool,
    ) -> Result<Vec<String>>;

    /// Zero-reward is a success with an empty vec, not an error (§4.7 Phase 2).
    async fn claim_all_rewards(&self, position_account: &str) -> Result<Vec<String>>;

    async fn close_position_account(&self, position_account: &str) -> Result<String>;

    async fn get_position(&self, position_account: &str) -> Result<PositionAccount>;

    async fn list_user_positions(&self, pool_id: &str) -> Result<Vec<String>>;
}

/// RPC-backed `PoolClient`. Every mutating call is routed through
/// `RpcExecutor::submit_instruction`, every read through
/// `RpcExecutor::read_account`.
pub struct RpcPoolClient {
    rpc: Arc<RpcExecutor>,
    bin_steps: HashMap<String, u32>,
}

/// Bin step used when a pool's step wasn't registered — should never happen
/// for a properly configured pool, kept only so a lookup miss degrades
/// instead of panicking.
const FALLBACK_BIN_STEP_BPS: u32 = 25;

impl RpcPoolClient {
    pub fn new(rpc: Arc<RpcExecutor>, bin_steps: HashMap<String, u32>) -> Self {
        Self { rpc, bin_steps }
    }

    /// Pure conversion, exposed directly so callers that already hold an
    /// `ActiveBin` reading don't need a round-trip through the trait object.
    pub fn bin_id_for_price(&self, pool_id: &str, price: f64, active: ActiveBin) -> i32 {
        bin_math::bin_id_for_price(price, active.bin_id, active.price, self.bin_step_bps(pool_id))
    }

    pub fn price_for_bin(&self, pool_id: &str, bin_id: i32, active: ActiveBin) -> f64 {
        bin_math::price_for_bin(bin_id, active.bin_id, active.price, self.bin_step_bps(pool_id))
    }
}

#[async_trait]
impl PoolClient for RpcPoolClient {
    fn bin_step_bps(&self, pool_id: &str) -> u32 {
        self.bin_steps.get(pool_id).copied().unwrap_or_else(|| {
            warn!(pool_id, "no bin step registered for pool — using fallback");
            FALLBACK_BIN_STEP_BPS
        })
    }

    #[instrument(skip(self), name = "pool::active_bin")]
    async fn active_bin(&self, pool_id: &str) -> Result<ActiveBin> {
        let account = self
            .rpc
            .read_account(pool_id)
            .await
            .context("failed to read pool state account")?;

        let bin_id = account["active_id"]
            .as_i64()
            .context("pool account missing active_id")? as i32;
        let price = account["active_price"]
            .as_f64()
            .context("pool account missing active_price")?;

        Ok(ActiveBin { bin_id, price })
    }

    #[instrument(skip(self), name = "pool::ensure_bin_arrays")]
    async fn ensure_bin_arrays(&self, pool_id: &str, min_bin: i32, max_bin: i32) -> Result<()> {
        let params = json!({ "pool_id": pool_id, "min_bin": min_bin, "max_bin": max_bin });
        match self.rpc.submit_instruction("ensure_bin_arrays", params).await {
            Ok(_) => Ok(()),
            Err(err) if is_already_initialized(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), name = "pool::create_one_sided_position")]
    async fn create_one_sided_position(
        &self,
        pool_id: &str,
        side: Side,
        amount_base: f64,
        amount_quote: f64,
        min_bin: i32,
        max_bin: i32,
        strategy: crate::types::StrategyType,
        slippage_pct: f64,
    ) -> Result<CreatePositionResult> {
        let params = json!({
            "pool_id": pool_id,
            "side": side.as_str(),
            "amount_base": amount_base,
            "amount_quote": amount_quote,
            "min_bin": min_bin,
            "max_bin": max_bin,
            "strategy": strategy.to_string(),
            "slippage_pct": slippage_pct,
        });
        let result = self
            .rpc
            .submit_instruction("create_one_sided_position", params)
            .await?;
        let position_account = result
            .get("position_account")
            .and_then(|v| v.as_str())
            .context("create_one_sided_position response missing position_account")?
            .to_string();
        let tx_signature = result
            .get("signature")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(CreatePositionResult { tx_signature, position_account })
    }

    #[instrument(skip(self), name = "pool::remove_liquidity")]
    async fn remove_liquidity(
        &self,
        position_account: &str,
        from_bin: i32,
        to_bin: i32,
        bps: u32,
        should_claim_and_close: bool,
    ) -> Result<Vec<String>> {
        let params = json!({
            "position_account": position_account,
            "from_bin": from_bin,
            "to_bin": to_bin,
            "bps": bps,
            "should_claim_and_close": should_claim_and_close,
        });
        match self.rpc.submit_instruction("remove_liquidity", params).await {
            Ok(result) => Ok(signatures_from(&result)),
            Err(err) if is_no_liquidity(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), name = "pool::claim_all_rewards")]
    async fn claim_all_rewards(&self, position_account: &str) -> Result<Vec<String>> {
        let params = json!({ "position_account": position_account });
        match self.rpc.submit_instruction("claim_all_rewards", params).await {
            Ok(result) => Ok(signatures_from(&result)),
            Err(err) if is_zero_reward(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), name = "pool::close_position_account")]
    async fn close_position_account(&self, position_account: &str) -> Result<String> {
        let params = json!({ "position_account": position_account });
        let result = self
            .rpc
            .submit_instruction("close_position_account", params)
            .await?;
        Ok(result
            .get("signature")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    #[instrument(skip(self), name = "pool::get_position")]
    async fn get_position(&self, position_account: &str) -> Result<PositionAccount> {
        let account = self
            .rpc
            .read_account(position_account)
            .await
            .context("failed to read position account")?;

        Ok(PositionAccount {
            lower_bin: account["lower_bin"].as_i64().unwrap_or(0) as i32,
            upper_bin: account["upper_bin"].as_i64().unwrap_or(0) as i32,
            last_updated_at: account["last_updated_at"].as_i64().unwrap_or(0),
            owner: account["owner"].as_str().unwrap_or_default().to_string(),
        })
    }

    #[instrument(skip(self), name = "pool::list_user_positions")]
    async fn list_user_positions(&self, pool_id: &str) -> Result<Vec<String>> {
        let account = self
            .rpc
            .read_account(&format!("{pool_id}:user_positions"))
            .await?;
        Ok(account
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn signatures_from(result: &serde_json::Value) -> Vec<String> {
    result
        .get("signatures")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn is_already_initialized(err: &anyhow::Error) -> bool {
    matches!(
        crate::error::classify(err),
        Some(crate::error::CoreError::OnChain(crate::error::OnChainError::Other(msg)))
            if msg.contains("already initialized")
    )
}

fn is_no_liquidity(err: &anyhow::Error) -> bool {
    matches!(
        crate::error::classify(err),
        Some(crate::error::CoreError::OnChain(crate::error::OnChainError::Other(msg)))
            if msg.contains("no liquidity")
    )
}

fn is_zero_reward(err: &anyhow::Error) -> bool {
    matches!(
        crate::error::classify(err),
        Some(crate::error::CoreError::OnChain(crate::error::OnChainError::Other(msg)))
            if msg.contains("zero reward") || msg.contains("no rewards")
    )
}
