//! Market Data Streaming Types
//!
//! Normalized quote records (ticks and candles) and the bounded per-feed
//! history cache. These types are wire-agnostic: the Deriv adapter converts
//! its JSON shapes into them.

mod cache;

pub use cache::{DEFAULT_MAX_CACHE_TICKS, FeedCache, FeedShape, MergeOutcome};

use serde::{Deserialize, Serialize};

// =============================================================================
// Quote Records
// =============================================================================

/// A single spot-price observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Observation time (unix seconds).
    pub epoch: i64,
    /// Spot price.
    pub quote: f64,
}

/// An aggregated open-high-low-close bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time (unix seconds).
    pub epoch: i64,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
}

/// A normalized quote record handed to chart consumers.
///
/// Serializes without a tag, so a tick is `{"epoch":1,"quote":10.0}` and a
/// candle is `{"epoch":60,"open":..,"high":..,"low":..,"close":..}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quote {
    /// Raw tick.
    Tick(Tick),
    /// OHLC bar.
    Candle(Candle),
}

impl Quote {
    /// Epoch used for ordering (tick time or candle open time).
    #[must_use]
    pub const fn epoch(&self) -> i64 {
        match self {
            Self::Tick(tick) => tick.epoch,
            Self::Candle(candle) => candle.epoch,
        }
    }

    /// Whether this record is a tick.
    #[must_use]
    pub const fn is_tick(&self) -> bool {
        matches!(self, Self::Tick(_))
    }
}

impl From<Tick> for Quote {
    fn from(tick: Tick) -> Self {
        Self::Tick(tick)
    }
}

impl From<Candle> for Quote {
    fn from(candle: Candle) -> Self {
        Self::Candle(candle)
    }
}
