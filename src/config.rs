// =============================================================================
// Config — typed configuration with a live-updatable subset (§4.9, §6.2)
// =============================================================================
//
// Static configuration (pool descriptors, token mints, wallet seed, strategy
// types) is sourced once from the environment at startup and never changes.
// The live-updatable subset (RSI thresholds, position factors, enabled
// timeframes, harvest toggles) lives behind a `RwLock` and persists with the
// same atomic tmp+rename pattern the teacher uses for `runtime_config.rs`, so
// it survives a restart and can be hot-patched via `update_config` (§6.1)
// without one.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{PoolDescriptor, StrategyType, Timeframe};

fn default_rsi_period() -> u32 {
    14
}
fn default_oversold() -> f64 {
    30.0
}
fn default_overbought() -> f64 {
    70.0
}
fn default_check_interval_secs() -> u64 {
    60
}
fn default_position_factors() -> HashMap<String, f64> {
    [
        ("1m".to_string(), 0.05),
        ("15m".to_string(), 0.10),
        ("1h".to_string(), 0.20),
        ("4h".to_string(), 0.30),
        ("1d".to_string(), 0.40),
    ]
    .into_iter()
    .collect()
}
fn default_enabled_timeframes() -> Vec<String> {
    Timeframe::ALL.iter().map(|t| t.as_str().to_string()).collect()
}
fn default_true() -> bool {
    true
}
fn default_harvest_min_bins() -> u32 {
    5
}
fn default_harvest_min_price_move() -> f64 {
    0.01
}

/// The hot-patchable subset of configuration (§6.1 `update_config`, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: u32,
    #[serde(default = "default_oversold")]
    pub oversold: f64,
    #[serde(default = "default_overbought")]
    pub overbought: f64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_position_factors")]
    pub position_factors: HashMap<String, f64>,
    #[serde(default = "default_enabled_timeframes")]
    pub enabled_timeframes: Vec<String>,
    #[serde(default = "default_true")]
    pub harvest_enabled: bool,
    #[serde(default = "default_harvest_min_bins")]
    pub harvest_min_bins: u32,
    #[serde(default = "default_harvest_min_price_move")]
    pub harvest_min_price_move: f64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            rsi_period: default_rsi_period(),
            oversold: default_oversold(),
            overbought: default_overbought(),
            check_interval_secs: default_check_interval_secs(),
            position_factors: default_position_factors(),
            enabled_timeframes: default_enabled_timeframes(),
            harvest_enabled: true,
            harvest_min_bins: default_harvest_min_bins(),
            harvest_min_price_move: default_harvest_min_price_move(),
        }
    }
}

/// A partial patch applied via `update_config` (§6.1) — every field optional
/// so only the supplied keys are overwritten.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveConfigPatch {
    pub rsi_period: Option<u32>,
    pub oversold: Option<f64>,
    pub overbought: Option<f64>,
    pub check_interval_secs: Option<u64>,
    pub position_factors: Option<HashMap<String, f64>>,
    pub enabled_timeframes: Option<Vec<String>>,
    pub harvest_enabled: Option<bool>,
    pub harvest_min_bins: Option<u32>,
    pub harvest_min_price_move: Option<f64>,
}

impl LiveConfig {
    /// Validate the ranges enumerated in §4.9. Returns the first violation
    /// found as a `Validation` message.
    pub fn validate(&self) -> Result<()> {
        if !(2..=100).contains(&self.rsi_period) {
            anyhow::bail!(crate::error::CoreError::Validation(format!(
                "rsi_period must be in [2,100], got {}",
                self.rsi_period
            )));
        }
        if !(1.0..=50.0).contains(&self.oversold) {
            anyhow::bail!(crate::error::CoreError::Validation(format!(
                "oversold must be in [1,50], got {}",
                self.oversold
            )));
        }
        if !(50.0..=99.0).contains(&self.overbought) {
            anyhow::bail!(crate::error::CoreError::Validation(format!(
                "overbought must be in [50,99], got {}",
                self.overbought
            )));
        }
        if self.check_interval_secs < 1 {
            anyhow::bail!(crate::error::CoreError::Validation(
                "check_interval must be >= 1s".to_string()
            ));
        }
        for (tf, factor) in &self.position_factors {
            if !(0.0..=1.0).contains(factor) {
                anyhow::bail!(crate::error::CoreError::Validation(format!(
                    "position_factor[{tf}] must be in [0,1], got {factor}"
                )));
            }
        }
        for tf in &self.enabled_timeframes {
            if Timeframe::from_str(tf).is_none() {
                anyhow::bail!(crate::error::CoreError::Validation(format!(
                    "unknown timeframe in enabled_timeframes: {tf}"
                )));
            }
        }
        Ok(())
    }

    /// Apply a partial patch in-place, then re-validate.
    pub fn apply_patch(&mut self, patch: LiveConfigPatch) -> Result<()> {
        let mut next = self.clone();
        if let Some(v) = patch.rsi_period {
            next.rsi_period = v;
        }
        if let Some(v) = patch.oversold {
            next.oversold = v;
        }
        if let Some(v) = patch.overbought {
            next.overbought = v;
        }
        if let Some(v) = patch.check_interval_secs {
            next.check_interval_secs = v;
        }
        if let Some(v) = patch.position_factors {
            next.position_factors = v;
        }
        if let Some(v) = patch.enabled_timeframes {
            next.enabled_timeframes = v;
        }
        if let Some(v) = patch.harvest_enabled {
            next.harvest_enabled = v;
        }
        if let Some(v) = patch.harvest_min_bins {
            next.harvest_min_bins = v;
        }
        if let Some(v) = patch.harvest_min_price_move {
            next.harvest_min_price_move = v;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn position_factor(&self, tf: Timeframe) -> f64 {
        self.position_factors
            .get(tf.as_str())
            .copied()
            .unwrap_or(0.0)
    }

    pub fn is_enabled(&self, tf: Timeframe) -> bool {
        self.enabled_timeframes.iter().any(|s| s == tf.as_str())
    }

    /// Load the live subset from a JSON file, falling back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read live config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse live config from {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "live config loaded");
        Ok(config)
    }

    /// Persist atomically (write to `.tmp`, then rename) — matches the
    /// teacher's `runtime_config.rs` save pattern.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize live config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "live config saved (atomic)");
        Ok(())
    }
}

/// Static, startup-only configuration sourced from the environment (§6.2).
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub trading_symbol: String,
    pub base_token_mint: String,
    pub base_token_symbol: String,
    pub base_token_decimals: u32,
    pub quote_token_mint: String,
    pub quote_token_symbol: String,
    pub quote_token_decimals: u32,
    pub pools: HashMap<Timeframe, PoolDescriptor>,
    pub transaction_timeout: Duration,
    pub transaction_max_retries: u32,
    pub transaction_skip_preflight: bool,
    /// BIP39 seed phrase — never logged, never serialized.
    pub wallet_seed_phrase: String,
    pub wallet_pubkey: String,
    pub market_data_base_url: String,
    pub rpc_url: String,
    pub data_dir: String,
}

impl StaticConfig {
    /// Build from environment variables per §6.2. Per-timeframe pool
    /// variables (`POOL_ID_<TF>`, `BIN_STEP_<TF>`, `BASE_FEE_<TF>`,
    /// `STRATEGY_TYPE_<TF>`) are read for every enabled timeframe; a missing
    /// pool for a timeframe is not fatal to the whole process — that
    /// timeframe is simply left out of `pools` and the caller disables it
    /// (§7, "Fatal ... that timeframe is disabled but others continue").
    pub fn from_env() -> Result<Self> {
        let trading_symbol = std::env::var("TRADING_SYMBOL").unwrap_or_else(|_| "SOL-USDC".into());
        let base_token_mint = std::env::var("BASE_TOKEN_MINT").unwrap_or_default();
        let base_token_symbol = std::env::var("BASE_TOKEN_SYMBOL").unwrap_or_else(|_| "SOL".into());
        let quote_token_mint = std::env::var("QUOTE_TOKEN_MINT").unwrap_or_default();
        let quote_token_symbol = std::env::var("QUOTE_TOKEN_SYMBOL").unwrap_or_else(|_| "USDC".into());

        let mut pools = HashMap::new();
        for tf in Timeframe::ALL {
            let suffix = tf.as_str().to_uppercase();
            let pool_id = std::env::var(format!("POOL_ID_{suffix}"));
            let bin_step = std::env::var(format!("BIN_STEP_{suffix}"))
                .ok()
                .and_then(|s| s.parse::<u32>().ok());
            let (pool_id, bin_step) = match (pool_id, bin_step) {
                (Ok(p), Some(b)) => (p, b),
                _ => {
                    warn!(timeframe = %tf, "no pool configured for timeframe — it will be disabled");
                    continue;
                }
            };
            let base_fee = std::env::var(format!("BASE_FEE_{suffix}"))
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(1);
            let max_fee = base_fee.saturating_mul(10).max(base_fee);
            let strategy_type = std::env::var(format!("STRATEGY_TYPE_{suffix}"))
                .ok()
                .and_then(|s| parse_strategy_type(&s))
                .unwrap_or(StrategyType::Spot);

            pools.insert(
                tf,
                PoolDescriptor {
                    pool_id,
                    bin_step_bps: bin_step,
                    base_fee_bps: base_fee,
                    max_fee_bps: max_fee,
                    strategy_type,
                },
            );
        }

        let transaction_timeout = Duration::from_millis(
            std::env::var("TRANSACTION_TIMEOUT")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(180_000),
        );
        let transaction_max_retries = std::env::var("TRANSACTION_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(5);
        let transaction_skip_preflight = std::env::var("TRANSACTION_SKIP_PREFLIGHT")
            .map(|s| s == "true" || s == "1")
            .unwrap_or(false);

        let wallet_seed_phrase = std::env::var("WALLET_SEED_PHRASE").unwrap_or_default();
        let wallet_pubkey = std::env::var("WALLET_PUBKEY").unwrap_or_default();

        let base_token_decimals = std::env::var("BASE_TOKEN_DECIMALS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(9);
        let quote_token_decimals = std::env::var("QUOTE_TOKEN_DECIMALS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(6);

        let market_data_base_url = std::env::var("MARKET_DATA_BASE_URL")
            .unwrap_or_else(|_| "https://api.example-vendor.com".to_string());
        let rpc_url = std::env::var("RPC_URL").unwrap_or_else(|_| "https://api.example-rpc.com".to_string());
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());

        Ok(Self {
            trading_symbol,
            base_token_mint,
            base_token_symbol,
            base_token_decimals,
            quote_token_mint,
            quote_token_symbol,
            quote_token_decimals,
            pools,
            transaction_timeout,
            transaction_max_retries,
            transaction_skip_preflight,
            wallet_seed_phrase,
            wallet_pubkey,
            market_data_base_url,
            rpc_url,
            data_dir,
        })
    }
}

impl std::fmt::Display for StaticConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticConfig")
            .field("trading_symbol", &self.trading_symbol)
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("wallet_seed_phrase", &"<redacted>")
            .finish()
    }
}

fn parse_strategy_type(s: &str) -> Option<StrategyType> {
    match s {
        "BidAsk" => Some(StrategyType::BidAsk),
        "Curve" => Some(StrategyType::Curve),
        "Spot" => Some(StrategyType::Spot),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_live_config_is_valid() {
        assert!(LiveConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_rsi_period_out_of_range() {
        let mut cfg = LiveConfig::default();
        cfg.rsi_period = 1;
        assert!(cfg.validate().is_err());
        cfg.rsi_period = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversold_overbought_out_of_range() {
        let mut cfg = LiveConfig::default();
        cfg.oversold = 0.0;
        assert!(cfg.validate().is_err());
        cfg.oversold = 30.0;
        cfg.overbought = 100.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_position_factor_out_of_range() {
        let mut cfg = LiveConfig::default();
        cfg.position_factors.insert("1h".to_string(), 1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_enabled_timeframe() {
        let mut cfg = LiveConfig::default();
        cfg.enabled_timeframes.push("3m".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn patch_rejects_invalid_result_and_leaves_original_untouched() {
        let mut cfg = LiveConfig::default();
        let original_period = cfg.rsi_period;
        let patch = LiveConfigPatch {
            rsi_period: Some(500),
            ..Default::default()
        };
        assert!(cfg.apply_patch(patch).is_err());
        assert_eq!(cfg.rsi_period, original_period);
    }

    #[test]
    fn patch_applies_valid_partial_update() {
        let mut cfg = LiveConfig::default();
        let patch = LiveConfigPatch {
            oversold: Some(25.0),
            ..Default::default()
        };
        cfg.apply_patch(patch).unwrap();
        assert_eq!(cfg.oversold, 25.0);
        assert_eq!(cfg.overbought, default_overbought());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = std::env::temp_dir().join(format!("bin-sentinel-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("live_config.json");
        let mut cfg = LiveConfig::default();
        cfg.oversold = 22.0;
        cfg.save(&path).unwrap();
        let loaded = LiveConfig::load(&path).unwrap();
        assert_eq!(loaded.oversold, 22.0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
