// =============================================================================
// RpcExecutor — serialized RPC reads + transaction submission (§4.4, C4)
// =============================================================================
//
// Two responsibilities, same as the teacher's rate limiter splits "can I
// send" from "record that I sent": a paced, retried read path, and a
// submission path that refreshes the blockhash on every attempt. Wallet
// signing and the program's instruction/account wire format are out of scope
// (§1) — `submit_instruction` treats a logical instruction as an opaque
// label + JSON params and the node as a JSON-RPC endpoint, the same way the
// teacher's `BinanceClient` treats REST endpoints as opaque URLs.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, warn};

use crate::error::CoreError;

/// Minimum spacing between any two RPC reads (§4.4, §5).
const MIN_READ_SPACING_MS: u64 = 250;
/// Retry attempts for a single RPC read.
const READ_MAX_RETRIES: u32 = 5;
/// Retry attempts for transaction submission.
const SUBMIT_MAX_RETRIES: u32 = 5;
/// Default bounded confirmation timeout.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(180);

pub struct RpcExecutor {
    rpc_url: String,
    client: reqwest::Client,
    /// FIFO serialization point — holding this mutex across an await is the
    /// point: only one read/submit is ever in flight.
    fifo: AsyncMutex<()>,
}

impl RpcExecutor {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CONFIRM_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            rpc_url: rpc_url.into(),
            client,
            fifo: AsyncMutex::new(()),
        }
    }

    /// Serialized, paced, retried account read (§4.4 "Serialized RPC reads").
    #[instrument(skip(self), name = "rpc::read_account")]
    pub async fn read_account(&self, pubkey: &str) -> Result<Value> {
        let _lease = self.fifo.lock().await;
        tokio::time::sleep(Duration::from_millis(MIN_READ_SPACING_MS)).await;

        let mut attempt = 0;
        loop {
            match self.read_account_once(pubkey).await {
                Ok(v) => return Ok(v),
                Err(err) => {
                    let retriable = matches!(
                        crate::error::classify(&err),
                        Some(CoreError::Transient(_)) | Some(CoreError::RateLimited { .. })
                    );
                    attempt += 1;
                    if !retriable || attempt > READ_MAX_RETRIES {
                        return Err(err);
                    }
                    let backoff = backoff_for_attempt(attempt);
                    warn!(attempt, pubkey, backoff_ms = backoff.as_millis() as u64, %err, "retrying RPC read");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn read_account_once(&self, pubkey: &str) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getAccountInfo",
            "params": [pubkey],
        });

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(CoreError::Transient(e.to_string())))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(CoreError::RateLimited { retry_after_ms: None }.into());
        }
        if !status.is_success() {
            return Err(CoreError::Transient(format!("RPC read returned {status}")).into());
        }

        let value: Value = resp
            .json()
            .await
            .context("failed to parse RPC read response")?;

        if let Some(err) = value.get("error") {
            return Err(CoreError::Transient(format!("RPC error: {err}")).into());
        }

        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Submit a logical instruction with fresh-blockhash retry (§4.4
    /// "Transaction submission").
    #[instrument(skip(self, params), name = "rpc::submit_instruction")]
    pub async fn submit_instruction(&self, label: &str, params: Value) -> Result<Value> {
        let _lease = self.fifo.lock().await;

        for attempt in 1..=SUBMIT_MAX_RETRIES {
            let blockhash = self.fetch_latest_blockhash().await?;

            match self.send_and_confirm(label, &params, &blockhash).await {
                Ok(v) => return Ok(v),
                Err(err) => {
                    if is_retriable_submit_fault(&err) {
                        let wait = Duration::from_secs(attempt as u64 * 2);
                        warn!(attempt, label, wait_s = wait.as_secs(), %err, "retrying transaction submission");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(CoreError::Transient(format!(
            "submission '{label}' exhausted {SUBMIT_MAX_RETRIES} attempts"
        ))
        .into())
    }

    async fn fetch_latest_blockhash(&self) -> Result<String> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getLatestBlockhash",
            "params": [],
        });

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(CoreError::Transient(e.to_string())))?;

        let value: Value = resp
            .json()
            .await
            .context("failed to parse getLatestBlockhash response")?;

        value["result"]["value"]["blockhash"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| anyhow::anyhow!(CoreError::Transient("no blockhash in response".into())))
    }

    async fn send_and_confirm(&self, label: &str, params: &Value, blockhash: &str) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": label,
            "params": params,
            "blockhash": blockhash,
        });

        let resp = tokio::time::timeout(CONFIRM_TIMEOUT, self.client.post(&self.rpc_url).json(&body).send())
            .await
            .map_err(|_| anyhow::anyhow!(CoreError::Transient(format!("'{label}' confirmation timed out"))))?
            .map_err(|e| anyhow::anyhow!(CoreError::Transient(e.to_string())))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::Transient(format!("'{label}' returned {status}")).into());
        }

        let value: Value = resp
            .json()
            .await
            .context("failed to parse submission response")?;

        if let Some(err) = value.get("error") {
            return Err(classify_program_error(err));
        }

        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Exponential backoff capped at 30s, with +-10% jitter so a burst of reads
/// that all start retrying on the same tick don't all retry in lockstep.
fn backoff_for_attempt(attempt: u32) -> Duration {
    use rand::Rng;
    let secs = (2u64.saturating_pow(attempt) * 5).min(30) as f64;
    let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
    Duration::from_secs_f64((secs * (1.0 + jitter)).max(0.0))
}

fn classify_program_error(err: &Value) -> anyhow::Error {
    let message = err
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown program error")
        .to_string();

    if message.contains("0x178e") || message.contains("6030") || message.contains("NonEmptyPosition") {
        return CoreError::OnChain(crate::error::OnChainError::NonEmptyPosition).into();
    }
    if message.contains("slippage") {
        return CoreError::OnChain(crate::error::OnChainError::ExceededBinSlippageTolerance).into();
    }
    CoreError::OnChain(crate::error::OnChainError::Other(message)).into()
}

fn is_retriable_submit_fault(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    msg.contains("block height exceeded")
        || msg.contains("Blockhash not found")
        || msg.contains("confirmation timed out")
        || matches!(
            crate::error::classify(err),
            Some(CoreError::Transient(_)) | Some(CoreError::RateLimited { .. })
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_30s_within_jitter() {
        let within = |d: Duration, target: f64| {
            let secs = d.as_secs_f64();
            secs >= target * 0.9 && secs <= target * 1.1
        };
        assert!(within(backoff_for_attempt(1), 10.0));
        assert!(within(backoff_for_attempt(5), 30.0));
        assert!(within(backoff_for_attempt(10), 30.0));
    }

    #[test]
    fn classify_program_error_maps_non_empty_position() {
        let err = classify_program_error(&json!({ "message": "0x178e: position is not empty" }));
        assert!(matches!(
            crate::error::classify(&err),
            Some(CoreError::OnChain(crate::error::OnChainError::NonEmptyPosition))
        ));
    }

    #[test]
    fn classify_program_error_maps_slippage() {
        let err = classify_program_error(&json!({ "message": "exceeded bin slippage tolerance" }));
        assert!(matches!(
            crate::error::classify(&err),
            Some(CoreError::OnChain(crate::error::OnChainError::ExceededBinSlippageTolerance))
        ));
    }

    #[test]
    fn classify_program_error_falls_back_to_other() {
        let err = classify_program_error(&json!({ "message": "totally novel program fault" }));
        assert!(matches!(
            crate::error::classify(&err),
            Some(CoreError::OnChain(crate::error::OnChainError::Other(_)))
        ));
    }
}
