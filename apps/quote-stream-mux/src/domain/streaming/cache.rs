//! Bounded Feed Cache
//!
//! Holds the recent history of one feed, either as parallel tick arrays
//! (`times`, `prices`) or as a candle list. The shape is fixed at creation
//! from the feed granularity.
//!
//! # Merge rules
//!
//! - Ticks are appended. A tick older than the last cached tick is the one
//!   exception: it is reported as [`MergeOutcome::Stale`] and not cached,
//!   where a plain append-only cache would store it out of order.
//! - A candle whose epoch equals the last cached candle's epoch replaces it
//!   (in-progress bar); otherwise it is appended.
//! - Candles older than the last cached epoch are discarded too, so epochs
//!   stay non-decreasing for both shapes.
//! - After every append the oldest entries are dropped until the cache holds
//!   at most `capacity` entries.

use std::collections::VecDeque;

use super::{Candle, Quote, Tick};

/// Default bound on cached entries per feed.
pub const DEFAULT_MAX_CACHE_TICKS: usize = 5000;

/// Which history shape a feed caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedShape {
    /// Raw ticks (granularity 0).
    Ticks,
    /// OHLC candles (granularity > 0).
    Candles,
}

impl FeedShape {
    /// Shape for a feed granularity; `0` means raw ticks.
    #[must_use]
    pub const fn for_granularity(granularity: u32) -> Self {
        if granularity == 0 {
            Self::Ticks
        } else {
            Self::Candles
        }
    }

    /// Whether a quote record fits this shape.
    #[must_use]
    pub const fn accepts(self, quote: &Quote) -> bool {
        matches!(
            (self, quote),
            (Self::Ticks, Quote::Tick(_)) | (Self::Candles, Quote::Candle(_))
        )
    }
}

/// Result of merging one record into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Record was appended.
    Appended,
    /// Record replaced the last candle.
    Replaced,
    /// Record was older than the cached tail and dropped.
    Stale,
    /// Record shape does not match the cache shape.
    WrongShape,
}

#[derive(Debug, Clone, PartialEq)]
enum History {
    Ticks {
        times: VecDeque<i64>,
        prices: VecDeque<f64>,
    },
    Candles(VecDeque<Candle>),
}

/// Bounded, ordered history of a single feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedCache {
    history: History,
    capacity: usize,
}

impl FeedCache {
    /// Create an empty cache. A zero capacity is treated as one.
    #[must_use]
    pub fn new(shape: FeedShape, capacity: usize) -> Self {
        let history = match shape {
            FeedShape::Ticks => History::Ticks {
                times: VecDeque::new(),
                prices: VecDeque::new(),
            },
            FeedShape::Candles => History::Candles(VecDeque::new()),
        };

        Self {
            history,
            capacity: capacity.max(1),
        }
    }

    /// Seed a cache from formatted history.
    ///
    /// Returns `None` if any record does not match `shape`.
    #[must_use]
    pub fn from_quotes(shape: FeedShape, quotes: &[Quote], capacity: usize) -> Option<Self> {
        let mut cache = Self::new(shape, capacity);
        for quote in quotes {
            if cache.merge(quote) == MergeOutcome::WrongShape {
                return None;
            }
        }
        Some(cache)
    }

    /// Merge one record following the cache merge rules.
    pub fn merge(&mut self, quote: &Quote) -> MergeOutcome {
        let outcome = match (&mut self.history, quote) {
            (History::Ticks { times, prices }, Quote::Tick(tick)) => {
                if times.back().is_some_and(|last| tick.epoch < *last) {
                    MergeOutcome::Stale
                } else {
                    times.push_back(tick.epoch);
                    prices.push_back(tick.quote);
                    MergeOutcome::Appended
                }
            }
            (History::Candles(candles), Quote::Candle(candle)) => match candles.back_mut() {
                Some(last) if last.epoch == candle.epoch => {
                    *last = *candle;
                    MergeOutcome::Replaced
                }
                Some(last) if candle.epoch < last.epoch => MergeOutcome::Stale,
                _ => {
                    candles.push_back(*candle);
                    MergeOutcome::Appended
                }
            },
            _ => MergeOutcome::WrongShape,
        };

        if outcome == MergeOutcome::Appended {
            self.trim();
        }
        outcome
    }

    fn trim(&mut self) {
        match &mut self.history {
            History::Ticks { times, prices } => {
                while times.len() > self.capacity {
                    times.pop_front();
                    prices.pop_front();
                }
            }
            History::Candles(candles) => {
                while candles.len() > self.capacity {
                    candles.pop_front();
                }
            }
        }
    }

    /// Cache shape.
    #[must_use]
    pub const fn shape(&self) -> FeedShape {
        match self.history {
            History::Ticks { .. } => FeedShape::Ticks,
            History::Candles(_) => FeedShape::Candles,
        }
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.history {
            History::Ticks { times, .. } => times.len(),
            History::Candles(candles) => candles.len(),
        }
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Epoch of the newest entry.
    #[must_use]
    pub fn last_epoch(&self) -> Option<i64> {
        match &self.history {
            History::Ticks { times, .. } => times.back().copied(),
            History::Candles(candles) => candles.back().map(|c| c.epoch),
        }
    }

    /// Owned copy of the cached records, oldest first.
    #[must_use]
    pub fn quotes(&self) -> Vec<Quote> {
        match &self.history {
            History::Ticks { times, prices } => times
                .iter()
                .zip(prices)
                .map(|(&epoch, &quote)| Quote::Tick(Tick { epoch, quote }))
                .collect(),
            History::Candles(candles) => candles.iter().copied().map(Quote::Candle).collect(),
        }
    }

    /// Owned copy of the tick times (empty for candle caches).
    #[must_use]
    pub fn times(&self) -> Vec<i64> {
        match &self.history {
            History::Ticks { times, .. } => times.iter().copied().collect(),
            History::Candles(_) => Vec::new(),
        }
    }

    /// Owned copy of the tick prices (empty for candle caches).
    #[must_use]
    pub fn prices(&self) -> Vec<f64> {
        match &self.history {
            History::Ticks { prices, .. } => prices.iter().copied().collect(),
            History::Candles(_) => Vec::new(),
        }
    }

    /// Owned copy of the candles (empty for tick caches).
    #[must_use]
    pub fn candles(&self) -> Vec<Candle> {
        match &self.history {
            History::Ticks { .. } => Vec::new(),
            History::Candles(candles) => candles.iter().copied().collect(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn tick(epoch: i64, quote: f64) -> Quote {
        Quote::Tick(Tick { epoch, quote })
    }

    fn candle(epoch: i64, close: f64) -> Quote {
        Quote::Candle(Candle {
            epoch,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
        })
    }

    #[test]
    fn shape_follows_granularity() {
        assert_eq!(FeedShape::for_granularity(0), FeedShape::Ticks);
        assert_eq!(FeedShape::for_granularity(60), FeedShape::Candles);
    }

    #[test]
    fn ticks_append_in_parallel_arrays() {
        let mut cache = FeedCache::new(FeedShape::Ticks, 10);
        assert_eq!(cache.merge(&tick(1, 10.0)), MergeOutcome::Appended);
        assert_eq!(cache.merge(&tick(2, 11.0)), MergeOutcome::Appended);

        assert_eq!(cache.times(), vec![1, 2]);
        assert_eq!(cache.prices(), vec![10.0, 11.0]);
        assert!(cache.candles().is_empty());
    }

    #[test]
    fn older_tick_is_not_cached() {
        let mut cache = FeedCache::new(FeedShape::Ticks, 10);
        cache.merge(&tick(5, 10.0));
        assert_eq!(cache.merge(&tick(3, 9.0)), MergeOutcome::Stale);
        assert_eq!(cache.merge(&tick(5, 10.5)), MergeOutcome::Appended);

        assert_eq!(cache.times(), vec![5, 5]);
    }

    #[test]
    fn same_epoch_candle_replaces_last() {
        let mut cache = FeedCache::new(FeedShape::Candles, 10);
        cache.merge(&candle(60, 1.0));
        assert_eq!(cache.merge(&candle(60, 1.7)), MergeOutcome::Replaced);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.candles()[0].close, 1.7);
    }

    #[test]
    fn increasing_epoch_candles_append() {
        let mut cache = FeedCache::new(FeedShape::Candles, 10);
        cache.merge(&candle(60, 1.0));
        cache.merge(&candle(120, 1.1));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.last_epoch(), Some(120));
    }

    #[test]
    fn older_records_are_discarded() {
        let mut cache = FeedCache::new(FeedShape::Candles, 10);
        cache.merge(&candle(120, 1.0));
        assert_eq!(cache.merge(&candle(60, 9.0)), MergeOutcome::Stale);
        assert_eq!(cache.len(), 1);

        let mut ticks = FeedCache::new(FeedShape::Ticks, 10);
        ticks.merge(&tick(5, 1.0));
        assert_eq!(ticks.merge(&tick(4, 1.0)), MergeOutcome::Stale);
        // Equal epochs are allowed for ticks
        assert_eq!(ticks.merge(&tick(5, 1.1)), MergeOutcome::Appended);
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let mut cache = FeedCache::new(FeedShape::Ticks, 10);
        assert_eq!(cache.merge(&candle(60, 1.0)), MergeOutcome::WrongShape);
        assert!(cache.is_empty());

        assert!(FeedCache::from_quotes(FeedShape::Candles, &[tick(1, 1.0)], 10).is_none());
    }

    #[test]
    fn replacing_does_not_trim() {
        let mut cache = FeedCache::new(FeedShape::Candles, 2);
        cache.merge(&candle(60, 1.0));
        cache.merge(&candle(120, 1.0));
        cache.merge(&candle(120, 2.0));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.candles()[0].epoch, 60);
    }

    #[test]
    fn seeding_respects_capacity() {
        let quotes: Vec<_> = (0..10).map(|i| tick(i, 1.0)).collect();
        let cache = FeedCache::from_quotes(FeedShape::Ticks, &quotes, 4).unwrap();
        assert_eq!(cache.times(), vec![6, 7, 8, 9]);
    }

    #[test]
    fn copies_are_detached_from_cache() {
        let mut cache = FeedCache::new(FeedShape::Ticks, 10);
        cache.merge(&tick(1, 10.0));
        let snapshot = cache.quotes();
        cache.merge(&tick(2, 11.0));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn default_bound_keeps_latest_five_thousand() {
        let mut cache = FeedCache::new(FeedShape::Ticks, DEFAULT_MAX_CACHE_TICKS);
        for epoch in 0..5_250 {
            cache.merge(&tick(epoch, 1.0));
        }

        let times = cache.times();
        assert_eq!(times.len(), DEFAULT_MAX_CACHE_TICKS);
        assert_eq!(times.first(), Some(&250));
        assert_eq!(times.last(), Some(&5_249));
    }

    proptest! {
        #[test]
        fn tick_cache_holds_most_recent_entries(
            count in 1usize..400,
            capacity in 1usize..100,
        ) {
            let mut cache = FeedCache::new(FeedShape::Ticks, capacity);
            for epoch in 0..count {
                cache.merge(&tick(i64::try_from(epoch).unwrap(), 1.0));
            }

            let times = cache.times();
            prop_assert_eq!(times.len(), count.min(capacity));
            prop_assert_eq!(cache.prices().len(), times.len());
            prop_assert!(times.windows(2).all(|w| w[0] <= w[1]));
            prop_assert_eq!(*times.last().unwrap(), i64::try_from(count - 1).unwrap());
        }

        #[test]
        fn candle_cache_never_holds_equal_epochs(
            epochs in proptest::collection::vec(0i64..50, 1..200),
        ) {
            let mut cache = FeedCache::new(FeedShape::Candles, 64);
            for epoch in epochs {
                cache.merge(&candle(epoch, 1.0));
            }

            let candles = cache.candles();
            prop_assert!(candles.len() <= 64);
            prop_assert!(candles.windows(2).all(|w| w[0].epoch < w[1].epoch));
        }
    }
}
