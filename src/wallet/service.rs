// =============================================================================
// WalletService — TTL-cached balance reads + hourly snapshot history (§4.5, C5)
// =============================================================================
//
// Balance reads are cached for 2 minutes; a fresh-read failure with a stale
// cache present degrades to the stale value with a warning rather than
// propagating the error — the same "serve what we have" posture the
// teacher's reconciliation loop takes toward balance drift (log, don't
// block). Snapshot history compresses anything older than 24h into one
// average per calendar day and keeps at most 54 entries, persisted with the
// teacher's atomic tmp+rename pattern.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::rpc::RpcExecutor;
use crate::types::BalanceSnapshot;

const BALANCE_CACHE_TTL: Duration = Duration::from_secs(120);
const SNAPSHOT_RETENTION: usize = 54;
const COMPRESSION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

struct CachedBalance {
    value: BalanceSnapshot,
    fetched_at: Instant,
}

pub struct WalletService {
    rpc: Arc<RpcExecutor>,
    wallet_pubkey: String,
    base_mint: String,
    quote_mint: String,
    base_decimals: u32,
    quote_decimals: u32,
    cache: Mutex<Option<CachedBalance>>,
    snapshots: Mutex<Vec<BalanceSnapshot>>,
    snapshot_path: PathBuf,
}

impl WalletService {
    pub fn new(
        rpc: Arc<RpcExecutor>,
        wallet_pubkey: impl Into<String>,
        base_mint: impl Into<String>,
        quote_mint: impl Into<String>,
        base_decimals: u32,
        quote_decimals: u32,
        snapshot_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            rpc,
            wallet_pubkey: wallet_pubkey.into(),
            base_mint: base_mint.into(),
            quote_mint: quote_mint.into(),
            base_decimals,
            quote_decimals,
            cache: Mutex::new(None),
            snapshots: Mutex::new(Vec::new()),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Load persisted snapshot history at startup.
    pub fn load_snapshots(&self) -> Result<()> {
        if !self.snapshot_path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.snapshot_path)
            .with_context(|| format!("failed to read {}", self.snapshot_path.display()))?;
        let snapshots: Vec<BalanceSnapshot> = serde_json::from_str(&content)
            .context("failed to parse balance snapshot history")?;
        *self.snapshots.lock() = snapshots;
        Ok(())
    }

    fn save_snapshots(&self, snapshots: &[BalanceSnapshot]) -> Result<()> {
        save_atomic(&self.snapshot_path, snapshots)
    }

    /// `balance() -> {base, quote, timestamp}` (§4.5). Cached for 2 minutes;
    /// falls back to the stale value (with a warning) if the fresh read
    /// fails and a prior value exists.
    #[instrument(skip(self))]
    pub async fn balance(&self) -> Result<BalanceSnapshot> {
        if let Some(fresh) = self.fresh_cached() {
            return Ok(fresh);
        }

        match self.fetch_balance().await {
            Ok(snapshot) => {
                *self.cache.lock() = Some(CachedBalance {
                    value: snapshot.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(snapshot)
            }
            Err(err) => {
                let stale = self.cache.lock().as_ref().map(|c| c.value.clone());
                if let Some(stale) = stale {
                    warn!(%err, "balance refresh failed — serving stale value");
                    Ok(stale)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Force a fresh read, bypassing the TTL cache, and repopulate it with
    /// the result. Used where two reads straddling the 120s TTL must not
    /// collapse to the same cached value — e.g. the before/after snapshot
    /// around a position close (§4.7 "balance delta").
    #[instrument(skip(self))]
    pub async fn balance_fresh(&self) -> Result<BalanceSnapshot> {
        let snapshot = self.fetch_balance().await?;
        *self.cache.lock() = Some(CachedBalance {
            value: snapshot.clone(),
            fetched_at: Instant::now(),
        });
        Ok(snapshot)
    }

    fn fresh_cached(&self) -> Option<BalanceSnapshot> {
        let cache = self.cache.lock();
        let entry = cache.as_ref()?;
        if entry.fetched_at.elapsed() < BALANCE_CACHE_TTL {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    async fn fetch_balance(&self) -> Result<BalanceSnapshot> {
        let base_account = self
            .rpc
            .read_account(&format!("{}:{}", self.wallet_pubkey, self.base_mint))
            .await
            .context("failed to read base token balance")?;
        let quote_account = self
            .rpc
            .read_account(&format!("{}:{}", self.wallet_pubkey, self.quote_mint))
            .await
            .context("failed to read quote token balance")?;

        let base_raw = base_account["amount"].as_f64().unwrap_or(0.0);
        let quote_raw = quote_account["amount"].as_f64().unwrap_or(0.0);

        let base_qty = base_raw / 10f64.powi(self.base_decimals as i32);
        let quote_qty = quote_raw / 10f64.powi(self.quote_decimals as i32);

        Ok(BalanceSnapshot {
            base_qty,
            quote_qty,
            timestamp: Utc::now().timestamp(),
            is_daily_average: false,
            original_count: None,
        })
    }

    /// Called by the 1-hour cron: force-fresh balance, append, compress
    /// (§4.5 `append_hourly_snapshot`).
    #[instrument(skip(self))]
    pub async fn append_hourly_snapshot(&self) -> Result<()> {
        let snapshot = self.balance_fresh().await?;

        let compressed = {
            let mut snapshots = self.snapshots.lock();
            snapshots.push(snapshot);
            let compressed = compress_history(&snapshots);
            *snapshots = compressed.clone();
            compressed
        };

        self.save_snapshots(&compressed)?;
        info!(count = compressed.len(), "hourly balance snapshot recorded");
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<BalanceSnapshot> {
        self.snapshots.lock().clone()
    }
}

/// Partition at `now-24h`, average older snapshots per calendar day, keep
/// recent ones verbatim, trim to `SNAPSHOT_RETENTION` (§4.5 `compress_history`).
fn compress_history(snapshots: &[BalanceSnapshot]) -> Vec<BalanceSnapshot> {
    let now = Utc::now().timestamp();
    let cutoff = now - COMPRESSION_WINDOW.as_secs() as i64;

    let (older, recent): (Vec<_>, Vec<_>) =
        snapshots.iter().cloned().partition(|s| s.timestamp < cutoff);

    let mut by_day: std::collections::BTreeMap<(i32, u32, u32), Vec<BalanceSnapshot>> =
        std::collections::BTreeMap::new();
    for s in older {
        let date = DateTime::<Utc>::from_timestamp(s.timestamp, 0).unwrap_or_else(Utc::now);
        by_day
            .entry((date.year(), date.month(), date.day()))
            .or_default()
            .push(s);
    }

    let mut compressed: Vec<BalanceSnapshot> = by_day
        .into_values()
        .map(|group| {
            let count = group.len() as u32;
            let base_avg = group.iter().map(|s| s.base_qty).sum::<f64>() / count as f64;
            let quote_avg = group.iter().map(|s| s.quote_qty).sum::<f64>() / count as f64;
            let max_ts = group.iter().map(|s| s.timestamp).max().unwrap_or(0);
            BalanceSnapshot {
                base_qty: base_avg,
                quote_qty: quote_avg,
                timestamp: max_ts,
                is_daily_average: true,
                original_count: Some(count),
            }
        })
        .collect();

    compressed.extend(recent);
    compressed.sort_by_key(|s| s.timestamp);

    if compressed.len() > SNAPSHOT_RETENTION {
        let drop = compressed.len() - SNAPSHOT_RETENTION;
        compressed.drain(0..drop);
    }

    compressed
}

fn save_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("failed to serialize")?;
    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp file to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(ts: i64, base: f64, quote: f64) -> BalanceSnapshot {
        BalanceSnapshot {
            base_qty: base,
            quote_qty: quote,
            timestamp: ts,
            is_daily_average: false,
            original_count: None,
        }
    }

    #[test]
    fn compress_history_keeps_recent_untouched() {
        let now = Utc::now().timestamp();
        let snapshots = vec![snap(now - 60, 1.0, 2.0), snap(now - 30, 1.1, 2.1)];
        let compressed = compress_history(&snapshots);
        assert_eq!(compressed.len(), 2);
        assert!(compressed.iter().all(|s| !s.is_daily_average));
    }

    #[test]
    fn compress_history_averages_older_snapshots_per_day() {
        let now = Utc::now().timestamp();
        let day_ago = now - 25 * 3600;
        let snapshots = vec![
            snap(day_ago, 1.0, 10.0),
            snap(day_ago + 60, 3.0, 20.0),
            snap(now - 60, 5.0, 5.0),
        ];
        let compressed = compress_history(&snapshots);
        let averaged = compressed.iter().find(|s| s.is_daily_average).unwrap();
        assert_eq!(averaged.original_count, Some(2));
        assert!((averaged.base_qty - 2.0).abs() < 1e-9);
        assert!((averaged.quote_qty - 15.0).abs() < 1e-9);
    }

    #[test]
    fn compress_history_trims_to_retention_limit() {
        let now = Utc::now().timestamp();
        let snapshots: Vec<BalanceSnapshot> =
            (0..100).map(|i| snap(now - i * 10, 1.0, 1.0)).collect();
        let compressed = compress_history(&snapshots);
        assert!(compressed.len() <= SNAPSHOT_RETENTION);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = std::env::temp_dir().join(format!("bin-sentinel-wallet-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snapshots.json");
        let snapshots = vec![snap(1_700_000_000, 1.0, 2.0)];
        save_atomic(&path, &snapshots).unwrap();
        let loaded: Vec<BalanceSnapshot> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
