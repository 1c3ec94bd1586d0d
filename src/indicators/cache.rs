// =============================================================================
// IndicatorCache — TTL cache + single-flight dedup in front of the RSI math
// and spot-price fetch (§4.2, C2)
// =============================================================================
//
// Every timeframe's RSI is cached with a TTL calibrated below its cron period
// (`Timeframe::rsi_ttl`) so a scheduled tick always sees a fresh value without
// the cache ever forcing two concurrent callers to both hit the upstream
// vendor. Concurrent callers for the same `(symbol, timeframe)` key while a
// fetch is in flight wait on the in-flight request's result instead of
// issuing a second one — the same one-fetch-per-key guarantee the teacher's
// rate limiter protects with atomic counters, done here with a registered
// `Notify` per key.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{instrument, warn};

use crate::market_data::MarketDataClient;
use crate::types::{RsiValue, Timeframe};

/// Extra candles fetched beyond `period` to seed the RSI calculation — enough
/// history for Wilder smoothing to stabilize past the seed window (§4.2 step 3).
const KLINE_FETCH_MARGIN: u32 = 50;
/// TTL for the spot-price cache (§4.2).
const SPOT_PRICE_TTL: Duration = Duration::from_secs(30);

struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
}

type RsiKey = (String, Timeframe);

pub struct IndicatorCache {
    market: Arc<MarketDataClient>,
    rsi_entries: Mutex<HashMap<RsiKey, CacheEntry<RsiValue>>>,
    rsi_inflight: Mutex<HashMap<RsiKey, Arc<Notify>>>,
    spot_entry: Mutex<Option<CacheEntry<f64>>>,
    spot_inflight: Mutex<Option<Arc<Notify>>>,
}

impl IndicatorCache {
    pub fn new(market: Arc<MarketDataClient>) -> Self {
        Self {
            market,
            rsi_entries: Mutex::new(HashMap::new()),
            rsi_inflight: Mutex::new(HashMap::new()),
            spot_entry: Mutex::new(None),
            spot_inflight: Mutex::new(None),
        }
    }

    /// Fetch (from cache, or upstream with single-flight dedup) the RSI for
    /// `symbol` at `timeframe`.
    #[instrument(skip(self), fields(symbol, %timeframe))]
    pub async fn get_rsi(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        period: u32,
        oversold: f64,
        overbought: f64,
    ) -> Result<RsiValue> {
        self.rsi_with(symbol, timeframe, period, oversold, overbought, false).await
    }

    /// Bypass the TTL cache and force a fresh fetch, still deduplicated
    /// against any concurrent caller for the same key. Used by the signal
    /// cron, which must never evaluate against a stale reading.
    #[instrument(skip(self), fields(symbol, %timeframe))]
    pub async fn refresh_rsi(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        period: u32,
        oversold: f64,
        overbought: f64,
    ) -> Result<RsiValue> {
        self.rsi_with(symbol, timeframe, period, oversold, overbought, true).await
    }

    async fn rsi_with(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        period: u32,
        oversold: f64,
        overbought: f64,
        force: bool,
    ) -> Result<RsiValue> {
        let key: RsiKey = (symbol.to_string(), timeframe);

        if !force {
            if let Some(value) = self.fresh_rsi(&key, timeframe) {
                return Ok(value);
            }
        }

        // Single-flight: if a fetch for this key is already running, wait on
        // it, then re-check the cache — whoever is running it will have
        // populated it (or left it empty on failure, in which case we fall
        // through and become the new leader).
        loop {
            let notify = {
                let mut inflight = self.rsi_inflight.lock();
                if let Some(existing) = inflight.get(&key) {
                    Some(existing.clone())
                } else {
                    inflight.insert(key.clone(), Arc::new(Notify::new()));
                    None
                }
            };

            if let Some(notify) = notify {
                notify.notified().await;
                if let Some(value) = self.fresh_rsi(&key, timeframe) {
                    return Ok(value);
                }
                // Leader's fetch failed and left the cache empty — try again,
                // possibly becoming the new leader.
                continue;
            }

            break;
        }

        let result = self.fetch_rsi(symbol, timeframe, period, oversold, overbought).await;

        if let Ok(value) = &result {
            self.rsi_entries.lock().insert(
                key.clone(),
                CacheEntry {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }

        let notify = self.rsi_inflight.lock().remove(&key);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }

        result
    }

    fn fresh_rsi(&self, key: &RsiKey, timeframe: Timeframe) -> Option<RsiValue> {
        let entries = self.rsi_entries.lock();
        let entry = entries.get(key)?;
        if entry.fetched_at.elapsed() < timeframe.rsi_ttl() {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    async fn fetch_rsi(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        period: u32,
        oversold: f64,
        overbought: f64,
    ) -> Result<RsiValue> {
        let candles = self
            .market
            .fetch_klines(symbol, timeframe, period + KLINE_FETCH_MARGIN)
            .await?;

        if candles.is_empty() {
            anyhow::bail!(crate::error::CoreError::Transient(
                "no candles returned".to_string()
            ));
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let series = super::rsi::calculate_rsi(&closes, period as usize);
        let value = *series
            .last()
            .ok_or_else(|| anyhow::anyhow!(crate::error::CoreError::Transient(
                "insufficient candle history for RSI".to_string()
            )))?;

        let signal = RsiValue::classify(value, oversold, overbought);
        let close_timestamp = candles.last().map(|c| c.close_time).unwrap_or(0);

        Ok(RsiValue {
            timeframe,
            value,
            signal,
            close_timestamp,
        })
    }

    /// Fan out RSI across every tracked timeframe, falling back to the
    /// neutral reading for any timeframe whose fetch fails (§4.2 `rsi_all`).
    /// Sequential, not concurrent — each call still respects the global
    /// market-data pacing gate.
    pub async fn rsi_all(
        &self,
        symbol: &str,
        period: u32,
        oversold: f64,
        overbought: f64,
        timeframes: &[Timeframe],
    ) -> Vec<RsiValue> {
        let mut out = Vec::with_capacity(timeframes.len());
        for &tf in timeframes {
            match self.get_rsi(symbol, tf, period, oversold, overbought).await {
                Ok(value) => out.push(value),
                Err(err) => {
                    warn!(timeframe = %tf, %err, "RSI fetch failed — using neutral fallback");
                    out.push(RsiValue::neutral_fallback(tf, 0));
                }
            }
        }
        out
    }

    /// Fetch (from cache, or upstream with single-flight dedup) the current
    /// spot price for `symbol` (§4.2).
    #[instrument(skip(self))]
    pub async fn get_spot_price(&self, symbol: &str) -> Result<f64> {
        if let Some(price) = self.fresh_spot_price() {
            return Ok(price);
        }

        loop {
            let notify = {
                let mut inflight = self.spot_inflight.lock();
                if let Some(existing) = inflight.as_ref() {
                    Some(existing.clone())
                } else {
                    *inflight = Some(Arc::new(Notify::new()));
                    None
                }
            };

            if let Some(notify) = notify {
                notify.notified().await;
                if let Some(price) = self.fresh_spot_price() {
                    return Ok(price);
                }
                continue;
            }

            break;
        }

        let result = self.market.fetch_spot_price(symbol).await;

        if let Ok(price) = result {
            *self.spot_entry.lock() = Some(CacheEntry {
                value: price,
                fetched_at: Instant::now(),
            });
        }

        let notify = self.spot_inflight.lock().take();
        if let Some(notify) = notify {
            notify.notify_waiters();
        }

        result
    }

    fn fresh_spot_price(&self) -> Option<f64> {
        let entry = self.spot_entry.lock();
        let entry = entry.as_ref()?;
        if entry.fetched_at.elapsed() < SPOT_PRICE_TTL {
            Some(entry.value)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache() -> IndicatorCache {
        IndicatorCache::new(Arc::new(MarketDataClient::new("http://127.0.0.1:9")))
    }

    #[tokio::test]
    async fn fresh_rsi_is_none_when_cache_empty() {
        let c = cache();
        assert!(c.fresh_rsi(&("X".into(), Timeframe::M1), Timeframe::M1).is_none());
    }

    #[tokio::test]
    async fn rsi_all_falls_back_to_neutral_on_fetch_failure() {
        // Unreachable base_url => every fetch fails => every entry neutral.
        let c = cache();
        let values = c
            .rsi_all("SOL-USDC", 14, 30.0, 70.0, &[Timeframe::M1, Timeframe::H1])
            .await;
        assert_eq!(values.len(), 2);
        for v in values {
            assert_eq!(v.signal, crate::types::RsiSignal::Neutral);
            assert_eq!(v.value, 50.0);
        }
    }

    #[tokio::test]
    async fn single_flight_dedups_concurrent_spot_price_waiters() {
        let c = Arc::new(cache());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let c = c.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                calls.fetch_add(1, Ordering::Relaxed);
                let _ = c.get_spot_price("SOL-USDC").await;
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        // Every caller ran, but only one at a time could hold the leader
        // slot — this asserts no panic/deadlock under concurrent access
        // rather than counting upstream calls directly (the fake endpoint
        // always fails fast, so true overlap is timing-dependent).
        assert_eq!(calls.load(Ordering::Relaxed), 5);
    }
}
