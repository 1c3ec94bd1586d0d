// =============================================================================
// MarketDataClient — polled candle/spot-price adapter (§4.1, C1)
// =============================================================================
//
// A thin reqwest adapter around the vendor's public market-data endpoints.
// Every call passes through a global pacing gate (>=300ms between requests,
// tracked with an atomic timestamp the way the teacher's `rate_limit.rs`
// tracks request weight) and a 3x exponential-backoff retry on transient
// faults. A non-2xx response is never retried as transient — it is surfaced
// immediately so the caller can decide.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::error::CoreError;
use crate::types::{Candle, Timeframe};

use super::types::interval_for;

/// Minimum spacing enforced between any two outbound requests (§4.1).
const MIN_REQUEST_SPACING_MS: u64 = 300;
/// Retry attempts on a transient fault before giving up.
const MAX_RETRIES: u32 = 3;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

/// Polled market-data adapter. Holds no API key — klines and spot price are
/// public endpoints (§1, "AMM SDK opaque" / no signed account access here).
pub struct MarketDataClient {
    base_url: String,
    client: reqwest::Client,
    last_request_ms: AtomicU64,
}

impl MarketDataClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("MarketDataClient initialised");

        Self {
            base_url: base_url.into(),
            client,
            last_request_ms: AtomicU64::new(0),
        }
    }

    /// Block until at least `MIN_REQUEST_SPACING_MS` has elapsed since the
    /// last outbound request, then claim the slot.
    async fn pace(&self) {
        loop {
            let now = now_ms();
            let last = self.last_request_ms.load(Ordering::Acquire);
            let elapsed = now.saturating_sub(last);
            if elapsed >= MIN_REQUEST_SPACING_MS {
                if self
                    .last_request_ms
                    .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            tokio::time::sleep(Duration::from_millis(MIN_REQUEST_SPACING_MS - elapsed)).await;
        }
    }

    /// Fetch the most recent `limit` candles for `symbol` at `timeframe`
    /// (§4.1 `fetch_klines`).
    #[instrument(skip(self), name = "market_data::fetch_klines")]
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let interval = interval_for(timeframe);
        self.with_retry(|| self.fetch_klines_once(symbol, interval, limit))
            .await
    }

    async fn fetch_klines_once(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        self.pace().await;

        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET klines request failed")?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_ms = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(CoreError::RateLimited { retry_after_ms }.into());
        }

        let body: serde_json::Value = resp.json().await.context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!(CoreError::Transient(format!(
                "klines request returned {status}: {body}"
            )));
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = parse_str_f64(&arr[1])?;
            let high = parse_str_f64(&arr[2])?;
            let low = parse_str_f64(&arr[3])?;
            let close = parse_str_f64(&arr[4])?;
            let volume = parse_str_f64(&arr[5])?;
            let close_time = arr[6].as_i64().unwrap_or(0);

            candles.push(Candle {
                open_time,
                close_time,
                open,
                high,
                low,
                close,
                volume,
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// Fetch the current spot price for `symbol` (§4.1 `fetch_spot_price`).
    #[instrument(skip(self), name = "market_data::fetch_spot_price")]
    pub async fn fetch_spot_price(&self, symbol: &str) -> Result<f64> {
        self.with_retry(|| self.fetch_spot_price_once(symbol)).await
    }

    async fn fetch_spot_price_once(&self, symbol: &str) -> Result<f64> {
        self.pace().await;

        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET ticker price request failed")?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(CoreError::RateLimited { retry_after_ms: None }.into());
        }

        let body: serde_json::Value = resp.json().await.context("failed to parse ticker response")?;

        if !status.is_success() {
            anyhow::bail!(CoreError::Transient(format!(
                "ticker price request returned {status}: {body}"
            )));
        }

        let price = parse_str_f64(&body["price"]).context("ticker response missing 'price'")?;
        Ok(price)
    }

    /// Retry a fallible async op up to `MAX_RETRIES` times with exponential
    /// backoff, only when the failure classifies as `Transient` or
    /// `RateLimited` (§4.1, §7).
    async fn with_retry<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(err) => {
                    let retriable = matches!(
                        crate::error::classify(&err),
                        Some(CoreError::Transient(_)) | Some(CoreError::RateLimited { .. })
                    );
                    attempt += 1;
                    if !retriable || attempt > MAX_RETRIES {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(2u64.pow(attempt - 1));
                    warn!(attempt, backoff_ms = backoff.as_millis() as u64, %err, "retrying market data request");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

impl std::fmt::Debug for MarketDataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_str_f64_handles_string_and_number() {
        assert_eq!(parse_str_f64(&serde_json::json!("1.5")).unwrap(), 1.5);
        assert_eq!(parse_str_f64(&serde_json::json!(2.5)).unwrap(), 2.5);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
    }

    #[tokio::test]
    async fn pacing_enforces_minimum_spacing() {
        let client = MarketDataClient::new("http://127.0.0.1:0");
        let start = std::time::Instant::now();
        client.pace().await;
        client.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(MIN_REQUEST_SPACING_MS));
    }
}
