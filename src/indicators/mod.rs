// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator math lives in `rsi`; the TTL/single-flight
// caching layer that sits in front of it lives in `cache`.

pub mod cache;
pub mod rsi;

pub use cache::IndicatorCache;
