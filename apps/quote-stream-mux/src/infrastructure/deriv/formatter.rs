//! Quote Formatter
//!
//! Pure conversion from Deriv wire shapes to normalized [`Quote`] records.
//! Nothing here holds state; formatting the same input twice yields equal
//! output.
//!
//! Numbers sent as strings are coerced. A coercion failure shows up as a
//! `NaN` price and is passed through untouched.

use super::messages::{CandlePayload, HistoryPayload, StreamEvent, TicksHistoryResponse};
use crate::domain::streaming::{Candle, Quote, Tick};

/// Stateless formatter for history responses and live events.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuoteFormatter;

impl QuoteFormatter {
    /// Format a history response into an ordered list of records.
    ///
    /// Candles win over ticks when both are present. Returns `None` when
    /// neither shape is present, when the tick arrays are missing or ragged,
    /// or when an epoch is not a number.
    #[must_use]
    pub fn format_history(response: &TicksHistoryResponse) -> Option<Vec<Quote>> {
        if let Some(candles) = &response.candles {
            return candles.iter().map(Self::format_candle).collect();
        }

        response.history.as_ref().and_then(Self::format_ticks)
    }

    /// Format a live event into exactly one record.
    ///
    /// A tick keeps its own epoch; a candle is keyed by `open_time`.
    /// Returns `None` when the event carries neither payload.
    #[must_use]
    pub fn format_tick(event: &StreamEvent) -> Option<Quote> {
        if let Some(tick) = &event.tick {
            return Some(Quote::Tick(Tick {
                epoch: tick.epoch,
                quote: tick.quote.as_f64(),
            }));
        }

        event.ohlc.as_ref().map(|ohlc| {
            Quote::Candle(Candle {
                epoch: ohlc.open_time,
                open: ohlc.open.as_f64(),
                high: ohlc.high.as_f64(),
                low: ohlc.low.as_f64(),
                close: ohlc.close.as_f64(),
            })
        })
    }

    /// Epoch of the newest record in a history response.
    #[must_use]
    pub fn latest_epoch(response: &TicksHistoryResponse) -> Option<i64> {
        if let Some(candles) = &response.candles {
            return candles.last().and_then(|c| c.epoch.as_epoch());
        }

        response
            .history
            .as_ref()
            .and_then(|h| h.times.as_ref())
            .and_then(|times| times.last())
            .and_then(|t| t.as_epoch())
    }

    fn format_candle(candle: &CandlePayload) -> Option<Quote> {
        Some(Quote::Candle(Candle {
            epoch: candle.epoch.as_epoch()?,
            open: candle.open.as_f64(),
            high: candle.high.as_f64(),
            low: candle.low.as_f64(),
            close: candle.close.as_f64(),
        }))
    }

    fn format_ticks(history: &HistoryPayload) -> Option<Vec<Quote>> {
        let times = history.times.as_ref()?;
        let prices = history.prices.as_ref()?;
        if times.len() != prices.len() {
            return None;
        }

        times
            .iter()
            .zip(prices)
            .map(|(time, price)| {
                Some(Quote::Tick(Tick {
                    epoch: time.as_epoch()?,
                    quote: price.as_f64(),
                }))
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
