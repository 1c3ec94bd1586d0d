// =============================================================================
// Shared types used across the bin-sentinel trading core
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The closed set of timeframes this engine trades.
///
/// Each timeframe carries its own cron cadence, RSI cache TTL, range-check
/// interval, range buffer, and harvest threshold — all fixed by the
/// specification (§3.1), not by user config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// All timeframes in ascending-cadence order.
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M1,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "15m" => Some(Self::M15),
            "1h" => Some(Self::H1),
            "4h" => Some(Self::H4),
            "1d" => Some(Self::D1),
            _ => None,
        }
    }

    /// The cron cadence at which the signal tick and range monitor fire.
    pub fn cron_period(&self) -> Duration {
        match self {
            Self::M1 => Duration::from_secs(60),
            Self::M15 => Duration::from_secs(15 * 60),
            Self::H1 => Duration::from_secs(60 * 60),
            Self::H4 => Duration::from_secs(4 * 60 * 60),
            Self::D1 => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// RSI cache TTL — calibrated below the cron period so a forced tick
    /// always produces a fresh datum (§4.2).
    pub fn rsi_ttl(&self) -> Duration {
        match self {
            Self::M1 => Duration::from_secs(45),
            Self::M15 => Duration::from_secs(10 * 60),
            Self::H1 => Duration::from_secs(50 * 60),
            Self::H4 => Duration::from_secs(3 * 60 * 60 + 20 * 60),
            Self::D1 => Duration::from_secs(23 * 60 * 60),
        }
    }

    /// Minimum interval between range re-checks — equal to the cron period
    /// (§3.1, §4.7 `is_in_valid_range`).
    pub fn range_check_min_interval(&self) -> Duration {
        self.cron_period()
    }

    /// Range buffer fraction applied on top of `[min, max]` when deciding
    /// whether current price is still "in range" (§3.1, §4.7).
    pub fn range_buffer_pct(&self) -> f64 {
        match self {
            Self::M1 => 0.02,
            Self::M15 => 0.05,
            Self::H1 => 0.08,
            Self::H4 => 0.12,
            Self::D1 => 0.20,
        }
    }

    /// Movement-through-range threshold that unlocks a harvest (§4.7).
    pub fn harvest_threshold_pct(&self) -> f64 {
        match self {
            Self::M1 => 0.05,
            Self::M15 => 0.08,
            Self::H1 => 0.10,
            Self::H4 => 0.12,
            Self::D1 => 0.15,
        }
    }

    /// Initial bin count used on the first `create` attempt (§4.7 step 3).
    pub fn initial_bin_count(&self) -> u32 {
        match self {
            Self::M1 => 45,
            Self::M15 => 55,
            Self::H1 | Self::H4 | Self::D1 => 60,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One-sided liquidity direction. BUY provides base-token liquidity above the
/// entry price; SELL provides quote-token liquidity below it (§3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal-or-not lifecycle state of a position (§3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Active,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// RSI momentum classification against configured thresholds (§3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RsiSignal {
    Oversold,
    Overbought,
    Neutral,
}

impl std::fmt::Display for RsiSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oversold => write!(f, "OVERSOLD"),
            Self::Overbought => write!(f, "OVERBOUGHT"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// A single RSI reading for one timeframe (§3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiValue {
    pub timeframe: Timeframe,
    pub value: f64,
    pub signal: RsiSignal,
    /// Close timestamp (unix seconds) of the candle that produced this value.
    pub close_timestamp: i64,
}

impl RsiValue {
    pub fn classify(value: f64, oversold: f64, overbought: f64) -> RsiSignal {
        if value < oversold {
            RsiSignal::Oversold
        } else if value > overbought {
            RsiSignal::Overbought
        } else {
            RsiSignal::Neutral
        }
    }

    /// The conventional neutral fallback used when a timeframe's RSI fetch
    /// fails (§4.2 `rsi_all`).
    pub fn neutral_fallback(timeframe: Timeframe, close_timestamp: i64) -> Self {
        Self {
            timeframe,
            value: 50.0,
            signal: RsiSignal::Neutral,
            close_timestamp,
        }
    }
}

/// A contiguous bin range, and the price bounds it maps to (§3.4).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BinRange {
    pub min_bin: i32,
    pub max_bin: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
    pub bin_range: BinRange,
}

/// A single tracked one-sided liquidity position (§3.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Stable identifier, equal to the on-chain account id in string form.
    pub id: String,
    pub pool_id: String,
    pub timeframe: Timeframe,
    pub side: Side,
    /// Base-token units if BUY, quote-token units if SELL.
    pub amount: f64,
    pub entry_price: f64,
    pub created_at: i64,
    pub status: PositionStatus,
    pub price_range: PriceRange,
    pub last_range_check: i64,
    #[serde(default)]
    pub has_been_harvested: bool,
    #[serde(default)]
    pub last_harvest_at: Option<i64>,
    #[serde(default)]
    pub closed_at: Option<i64>,
}

impl Position {
    /// Whether `price_range` is internally consistent (§7, "State corruption").
    pub fn range_is_sane(&self) -> bool {
        let r = &self.price_range;
        r.min > 1.0
            && r.max < 10_000.0
            && r.min <= r.max
            && r.bin_range.min_bin < r.bin_range.max_bin
    }
}

/// A wallet balance snapshot, possibly a compressed daily average (§3.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub base_qty: f64,
    pub quote_qty: f64,
    pub timestamp: i64,
    #[serde(default)]
    pub is_daily_average: bool,
    #[serde(default)]
    pub original_count: Option<u32>,
}

/// A single OHLC candle (§4.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// AMM strategy shape a pool was initialized with — opaque to this spec,
/// passed through to `PoolClient::create_one_sided_position` verbatim
/// (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyType {
    BidAsk,
    Curve,
    Spot,
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BidAsk => write!(f, "BidAsk"),
            Self::Curve => write!(f, "Curve"),
            Self::Spot => write!(f, "Spot"),
        }
    }
}

/// Immutable per-timeframe pool descriptor, loaded at startup (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDescriptor {
    pub pool_id: String,
    pub bin_step_bps: u32,
    pub base_fee_bps: u32,
    pub max_fee_bps: u32,
    pub strategy_type: StrategyType,
}
