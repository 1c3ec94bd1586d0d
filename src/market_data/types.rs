// =============================================================================
// Wire-adjacent types for the market data client (§4.1)
// =============================================================================

/// Kline interval strings accepted by the upstream vendor API, one per
/// tracked `Timeframe`.
pub fn interval_for(tf: crate::types::Timeframe) -> &'static str {
    match tf {
        crate::types::Timeframe::M1 => "1m",
        crate::types::Timeframe::M15 => "15m",
        crate::types::Timeframe::H1 => "1h",
        crate::types::Timeframe::H4 => "4h",
        crate::types::Timeframe::D1 => "1d",
    }
}
