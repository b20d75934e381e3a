//! Subscription Domain Types
//!
//! Identity and lifecycle types for chart feed subscriptions.
//!
//! # Design
//!
//! - A feed is identified by its [`FeedKey`] (`"{symbol}-{granularity}"`);
//!   every consumer of the same key shares one upstream subscription.
//! - Each time a feed is (re)created it receives a fresh [`Generation`], so
//!   late completions and late events of a torn-down feed can be told apart
//!   from the feed that replaced it.
//! - A chart subscription moves through [`Phase`]:
//!   `Idle → Fetching → Streaming ⇄ Paused → Forgotten`.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Candle width in seconds; `0` means raw ticks.
pub type Granularity = u32;

/// A symbol string (e.g. `R_100`, `frxEURUSD`).
pub type Symbol = String;

/// Identifies one logical feed: a symbol at a granularity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedKey(String);

impl FeedKey {
    /// Build the key for a symbol and optional granularity.
    ///
    /// ```rust
    /// use quote_stream_mux::domain::subscription::FeedKey;
    ///
    /// assert_eq!(FeedKey::new("R_100", None).as_str(), "R_100-0");
    /// assert_eq!(FeedKey::new("R_100", Some(60)).as_str(), "R_100-60");
    /// ```
    #[must_use]
    pub fn new(symbol: &str, granularity: Option<Granularity>) -> Self {
        Self(format!("{symbol}-{}", granularity.unwrap_or(0)))
    }

    /// Key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic tag for one incarnation of a feed.
///
/// The default is [`Generation::UNTRACKED`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Generation(u64);

impl Generation {
    /// Placeholder for ids whose feed incarnation is unknown.
    pub const UNTRACKED: Self = Self(0);

    /// Wrap a raw generation value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The generation after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a chart asks for: a symbol, a granularity and a history window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuoteRequest {
    /// Symbol to stream.
    pub symbol: Symbol,
    /// Candle width in seconds; `None` or `0` for ticks.
    pub granularity: Option<Granularity>,
    /// Number of historical points to fetch.
    pub count: Option<u32>,
    /// History start (unix seconds).
    pub start: Option<i64>,
    /// History end (unix seconds); `None` means latest.
    pub end: Option<i64>,
}

impl QuoteRequest {
    /// Request for a symbol at a granularity, with no history window.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, granularity: Granularity) -> Self {
        Self {
            symbol: symbol.into(),
            granularity: (granularity > 0).then_some(granularity),
            ..Self::default()
        }
    }

    /// Feed key of this request.
    #[must_use]
    pub fn feed_key(&self) -> FeedKey {
        FeedKey::new(&self.symbol, self.granularity)
    }

    /// Effective granularity (`0` for ticks).
    #[must_use]
    pub fn granularity_or_ticks(&self) -> Granularity {
        self.granularity.unwrap_or(0)
    }

    /// Copy of this request resuming from `start`.
    #[must_use]
    pub fn starting_at(&self, start: i64) -> Self {
        Self {
            start: Some(start),
            ..self.clone()
        }
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Lifecycle phase of a chart subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Created, nothing requested yet.
    Idle,
    /// History fetch in flight.
    Fetching,
    /// History delivered, live events flowing.
    Streaming,
    /// Live callback dropped; can be resumed.
    Paused,
    /// Terminal.
    Forgotten,
}

/// Inputs that move a subscription between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// A history fetch was started.
    FetchStarted,
    /// The fetch delivered history.
    FetchSucceeded,
    /// The fetch failed.
    FetchFailed,
    /// The live stream was paused.
    Paused,
    /// The subscription was forgotten.
    Forgotten,
}

impl Phase {
    /// Phase after `event`, or `None` if the event is not valid here.
    ///
    /// ```rust
    /// use quote_stream_mux::domain::subscription::{Phase, PhaseEvent};
    ///
    /// assert_eq!(Phase::Idle.on(PhaseEvent::FetchStarted), Some(Phase::Fetching));
    /// assert_eq!(Phase::Streaming.on(PhaseEvent::FetchStarted), None);
    /// assert_eq!(Phase::Forgotten.on(PhaseEvent::Forgotten), None);
    /// ```
    #[must_use]
    pub const fn on(self, event: PhaseEvent) -> Option<Self> {
        match (self, event) {
            (Self::Idle | Self::Paused, PhaseEvent::FetchStarted) => Some(Self::Fetching),
            (Self::Fetching, PhaseEvent::FetchSucceeded) => Some(Self::Streaming),
            (Self::Fetching, PhaseEvent::FetchFailed) | (_, PhaseEvent::Forgotten)
                if !matches!(self, Self::Forgotten) =>
            {
                Some(Self::Forgotten)
            }
            (Self::Streaming, PhaseEvent::Paused) => Some(Self::Paused),
            _ => None,
        }
    }

    /// Whether a fetch is in flight or live events are flowing.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Fetching | Self::Streaming)
    }
}

// =============================================================================
// History Count Rule
// =============================================================================

/// Contract context a chart may be showing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractInfo {
    /// Whether the contract has its own tick stream.
    pub has_tick_stream: bool,
    /// Number of ticks in the contract, when tick based.
    pub tick_count: Option<u32>,
    /// Latest spot time (unix seconds).
    pub current_spot_time: Option<i64>,
    /// Contract start (unix seconds).
    pub date_start: Option<i64>,
}

impl ContractInfo {
    /// Elapsed contract time in seconds, or 0 when unknown.
    #[must_use]
    pub fn elapsed_secs(&self) -> i64 {
        match (self.current_spot_time, self.date_start) {
            (Some(spot), Some(start)) => spot - start,
            _ => 0,
        }
    }
}

/// Decides how many history points an initial fetch asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCountRule {
    /// Floor used with a tick-stream contract.
    pub default_count: u32,
    /// Floor used otherwise.
    pub min_tick_count: u32,
}

impl Default for HistoryCountRule {
    fn default() -> Self {
        Self {
            default_count: 1000,
            min_tick_count: 1000,
        }
    }
}

impl HistoryCountRule {
    /// History count for a chart.
    ///
    /// A tick-stream contract with a known tick count (and no forced history
    /// fetch) asks for `max(tick_count, default_count)`. Anything else asks
    /// for `max(elapsed contract seconds, min_tick_count)`.
    #[must_use]
    pub fn count(&self, contract: Option<&ContractInfo>, should_fetch_tick_history: bool) -> u32 {
        if let Some(info) = contract
            && !should_fetch_tick_history
            && info.has_tick_stream
            && let Some(tick_count) = info.tick_count
        {
            return tick_count.max(self.default_count);
        }

        let elapsed = contract.map_or(0, ContractInfo::elapsed_secs);
        u32::try_from(elapsed)
            .unwrap_or(if elapsed < 0 { 0 } else { u32::MAX })
            .max(self.min_tick_count)
    }
}

// =============================================================================
// Tests
// =============================================================================
