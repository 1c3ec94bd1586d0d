// =============================================================================
// Error taxonomy — classified kinds, not string compares (§7, §9)
// =============================================================================
//
// Every subsystem catches only the errors it can classify; anything else
// bubbles as a plain `anyhow::Error`. The boundary adapter downcasts to
// `CoreError` to pick an HTTP status; the Scheduler never lets a tick crash
// the process, logging and waiting for the next cron fire instead.
// =============================================================================

use thiserror::Error;

/// On-chain logical errors the AMM program can return, classified instead of
/// string-matched (§9 redesign flag: "Error 6030 / 0x178e pattern matching").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OnChainError {
    /// Position-creation slippage exceeded the configured bin tolerance —
    /// triggers the narrow-and-widen retry loop in `PositionManager::create`.
    #[error("exceeded bin slippage tolerance")]
    ExceededBinSlippageTolerance,

    /// Close attempted to close an account that still holds liquidity
    /// (program error 6030 / 0x178e) — triggers the close-phase re-widen
    /// fallback in `PositionManager::close`.
    #[error("position account is not empty")]
    NonEmptyPosition,

    /// Any other on-chain program error, retained verbatim for logging.
    #[error("on-chain error: {0}")]
    Other(String),
}

/// Top-level classified error kind (§7).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Rejected at a boundary; never retried, surfaced to the caller as-is.
    #[error("validation error: {0}")]
    Validation(String),

    /// Retriable with backoff; lets C2/C5 serve stale or neutral fallback
    /// data, and lets the boundary emit HTTP 429.
    #[error("rate limited{}", retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    /// Transient network fault or confirmation timeout, retried internally
    /// by C1/C4 up to their configured bounds.
    #[error("transient error: {0}")]
    Transient(String),

    /// A classified on-chain program error.
    #[error(transparent)]
    OnChain(#[from] OnChainError),

    /// Price range or bin bounds fell outside sanity limits; the position is
    /// eligible for immediate close and ineligible for harvesting.
    #[error("state corruption: {0}")]
    StateCorruption(String),

    /// Wallet/pool initialization failure. Fatal for the affected subsystem
    /// only — other timeframes/pools continue.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// HTTP status this error kind maps to at the boundary (§6.1, §7).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::RateLimited { .. } => 429,
            _ => 500,
        }
    }
}

/// Attempt to recover a `CoreError` from an opaque `anyhow::Error` chain.
///
/// Subsystems that internally use `anyhow` (matching the teacher's adapter
/// style) attach a `CoreError` as the root cause via `.context(..)`-free
/// `From` conversions; this helper lets the boundary classify the result
/// without resorting to string matching.
pub fn classify(err: &anyhow::Error) -> Option<&CoreError> {
    err.downcast_ref::<CoreError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(CoreError::Validation("x".into()).http_status(), 400);
        assert_eq!(
            CoreError::RateLimited { retry_after_ms: Some(1000) }.http_status(),
            429
        );
        assert_eq!(CoreError::Transient("x".into()).http_status(), 500);
        assert_eq!(
            CoreError::OnChain(OnChainError::NonEmptyPosition).http_status(),
            500
        );
        assert_eq!(CoreError::StateCorruption("x".into()).http_status(), 500);
        assert_eq!(CoreError::Fatal("x".into()).http_status(), 500);
    }

    #[test]
    fn classify_downcasts_through_anyhow() {
        let err: anyhow::Error = CoreError::OnChain(OnChainError::ExceededBinSlippageTolerance).into();
        match classify(&err) {
            Some(CoreError::OnChain(OnChainError::ExceededBinSlippageTolerance)) => {}
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_returns_none_for_unrelated_error() {
        let err = anyhow::anyhow!("some other failure");
        assert!(classify(&err).is_none());
    }
}
