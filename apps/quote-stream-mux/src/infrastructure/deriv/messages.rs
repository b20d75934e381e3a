//! Deriv WebSocket Message Types
//!
//! Wire format types for the `ticks_history` request, its history/candles
//! response, and the `tick` / `ohlc` push events of a live subscription.
//!
//! # Message Types
//!
//! ## Requests
//! - `TicksHistoryRequest`: history fetch, optionally with `subscribe: 1`
//! - `ForgetRequest`: cancel a live subscription by id
//!
//! ## Responses
//! - `TicksHistoryResponse`: `history` (ticks) or `candles`, or `error`
//!
//! ## Push Events
//! - `StreamEvent`: `msg_type` `tick` or `ohlc`, echoing the request
//!
//! Numbers are not always numbers on this wire: OHLC prices arrive as
//! strings. Price fields therefore use [`WireNumber`], which keeps whatever
//! was sent and coerces on demand.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::subscription::{FeedKey, Generation, Granularity};

// =============================================================================
// Wire Numbers
// =============================================================================

/// A numeric field that may be sent as a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireNumber {
    /// Plain JSON number.
    Number(f64),
    /// String-encoded number, e.g. `"1234.56"`.
    Text(String),
}

impl WireNumber {
    /// Coerce to `f64`. Unparseable text yields `NaN`.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse().unwrap_or(f64::NAN),
        }
    }

    /// Coerce to whole unix seconds, if the value is a finite number.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_epoch(&self) -> Option<i64> {
        let value = self.as_f64();
        value.is_finite().then(|| value.trunc() as i64)
    }
}

impl From<f64> for WireNumber {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for WireNumber {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

// =============================================================================
// Requests
// =============================================================================

/// History style requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStyle {
    /// Raw ticks, answered with `history`.
    Ticks,
    /// OHLC bars, answered with `candles`.
    Candles,
}

/// Opaque data echoed back on every response and push of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passthrough {
    /// Feed generation that issued the request.
    pub generation: Generation,
}

/// `ticks_history` request.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "ticks_history": "R_100",
///   "style": "candles",
///   "granularity": 60,
///   "count": 1000,
///   "end": "latest",
///   "adjust_start_time": 1,
///   "subscribe": 1
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TicksHistoryRequest {
    /// Symbol.
    pub ticks_history: String,

    /// Shift start back to cover market closures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjust_start_time: Option<u8>,

    /// Number of points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,

    /// End time: epoch seconds as a string, or `"latest"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,

    /// Candle width in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,

    /// Start time (epoch seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,

    /// Ticks or candles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<HistoryStyle>,

    /// `1` to keep streaming after the history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<u8>,

    /// Echoed back on the response and on every push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passthrough: Option<Passthrough>,
}

impl TicksHistoryRequest {
    /// Feed key of this request.
    #[must_use]
    pub fn feed_key(&self) -> FeedKey {
        FeedKey::new(&self.ticks_history, self.granularity)
    }

    /// Whether this request asks for a live stream.
    #[must_use]
    pub fn is_subscribe(&self) -> bool {
        self.subscribe == Some(1)
    }
}

/// `forget` request.
///
/// # Wire Format (JSON)
/// ```json
/// {"forget": "d1ee7d0d-3ca9-fbb4-720b-5312d487185b"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgetRequest {
    /// Subscription id to cancel.
    pub forget: String,
}

impl ForgetRequest {
    /// Forget the subscription `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { forget: id.into() }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Error payload carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Machine-readable code (e.g. `InvalidSymbol`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Subscription information attached to streamed messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Subscription id, used by `forget`.
    pub id: String,
}

/// Tick history arrays; `prices[i]` was observed at `times[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPayload {
    /// Prices.
    #[serde(default)]
    pub prices: Option<Vec<WireNumber>>,
    /// Epoch seconds.
    #[serde(default)]
    pub times: Option<Vec<WireNumber>>,
}

/// One historical candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandlePayload {
    /// Open time (epoch seconds).
    pub epoch: WireNumber,
    /// Open price.
    pub open: WireNumber,
    /// High price.
    pub high: WireNumber,
    /// Low price.
    pub low: WireNumber,
    /// Close price.
    pub close: WireNumber,
}

/// Response to `ticks_history`.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "msg_type": "history",
///   "echo_req": {"ticks_history": "R_100", "subscribe": 1},
///   "history": {"prices": [10, 11, 12], "times": [1, 2, 3]},
///   "pip_size": 2
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicksHistoryResponse {
    /// `"history"` or `"candles"`.
    #[serde(default)]
    pub msg_type: Option<String>,

    /// The request as the server saw it.
    #[serde(default)]
    pub echo_req: Value,

    /// Tick history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryPayload>,

    /// Candle history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candles: Option<Vec<CandlePayload>>,

    /// Decimal places of the symbol's prices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pip_size: Option<f64>,

    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,

    /// Present when the request subscribed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionInfo>,
}

// =============================================================================
// Push Events
// =============================================================================

/// Live tick.
///
/// # Wire Format (JSON)
/// ```json
/// {"epoch": 4, "quote": 13, "symbol": "R_100", "id": "abc", "pip_size": 2}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickPayload {
    /// Observation time (epoch seconds).
    pub epoch: i64,
    /// Spot price.
    pub quote: WireNumber,
    /// Subscription id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Decimal places.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pip_size: Option<f64>,
}

/// Live candle update.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "open": "10.5", "high": "11.0", "low": "10.1", "close": "10.9",
///   "open_time": 1700000040, "epoch": 1700000071,
///   "granularity": 60, "symbol": "R_100", "id": "abc"
/// }
/// ```
///
/// `epoch` is the time of the update; the bar is identified by `open_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcPayload {
    /// Open price.
    pub open: WireNumber,
    /// High price.
    pub high: WireNumber,
    /// Low price.
    pub low: WireNumber,
    /// Close price.
    pub close: WireNumber,
    /// Bar open time (epoch seconds).
    pub open_time: i64,
    /// Update time (epoch seconds).
    pub epoch: i64,
    /// Candle width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    /// Symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Subscription id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A pushed `tick` or `ohlc` message of a live subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// `"tick"` or `"ohlc"`.
    pub msg_type: String,

    /// The subscribing request, echoed.
    #[serde(default)]
    pub echo_req: Value,

    /// Tick payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<TickPayload>,

    /// Candle payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ohlc: Option<OhlcPayload>,

    /// Subscription information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionInfo>,

    /// Top-level copy of the request passthrough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passthrough: Option<Passthrough>,
}

impl StreamEvent {
    /// Feed key derived from the echoed request.
    #[must_use]
    pub fn feed_key(&self) -> Option<FeedKey> {
        let symbol = self
            .echo_req
            .get("ticks_history")
            .or_else(|| self.echo_req.get("symbol"))
            .and_then(Value::as_str)?;

        let granularity = self.echo_req.get("granularity").and_then(|g| {
            g.as_u64()
                .or_else(|| g.as_str().and_then(|s| s.parse().ok()))
                .and_then(|g| Granularity::try_from(g).ok())
        });

        Some(FeedKey::new(symbol, granularity))
    }

    /// Feed generation that subscribed, if it was echoed.
    #[must_use]
    pub fn generation(&self) -> Option<Generation> {
        self.passthrough.map(|p| p.generation).or_else(|| {
            self.echo_req
                .get("passthrough")
                .and_then(|p| p.get("generation"))
                .and_then(Value::as_u64)
                .map(Generation::new)
        })
    }

    /// Subscription id carried by this event.
    #[must_use]
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription
            .as_ref()
            .map(|s| s.id.as_str())
            .or_else(|| self.tick.as_ref().and_then(|t| t.id.as_deref()))
            .or_else(|| self.ohlc.as_ref().and_then(|o| o.id.as_deref()))
    }

    /// Epoch used to resume this feed: tick epoch or candle open time.
    #[must_use]
    pub fn epoch(&self) -> Option<i64> {
        self.tick
            .as_ref()
            .map(|t| t.epoch)
            .or_else(|| self.ohlc.as_ref().map(|o| o.open_time))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_serialize_subscribe_request() {
        let request = TicksHistoryRequest {
            ticks_history: "R_100".to_string(),
            style: Some(HistoryStyle::Candles),
            granularity: Some(60),
            count: Some(1000),
            end: Some("latest".to_string()),
            adjust_start_time: Some(1),
            subscribe: Some(1),
            passthrough: Some(Passthrough {
                generation: Generation::new(7),
            }),
            ..TicksHistoryRequest::default()
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["style"], "candles");
        assert_eq!(value["passthrough"]["generation"], 7);
        assert!(value.get("start").is_none());
        assert_eq!(request.feed_key().as_str(), "R_100-60");
        assert!(request.is_subscribe());
    }

    #[test]
    fn test_deserialize_history_response() {
        let response: TicksHistoryResponse = serde_json::from_value(json!({
            "msg_type": "history",
            "echo_req": {"ticks_history": "R_100"},
            "history": {"prices": [10, "11.5"], "times": [1, 2]}
        }))
        .unwrap();

        let history = response.history.unwrap();
        let prices = history.prices.unwrap();
        assert_eq!(prices[1].as_f64(), 11.5);
        assert!(response.error.is_none());
    }

    #[test]
    fn test_deserialize_error_response() {
        let response: TicksHistoryResponse = serde_json::from_value(json!({
            "msg_type": "ticks_history",
            "error": {"code": "InvalidSymbol", "message": "Symbol FOO is invalid."}
        }))
        .unwrap();

        assert_eq!(response.error.unwrap().code, "InvalidSymbol");
    }

    #[test]
    fn test_deserialize_ohlc_event() {
        let event: StreamEvent = serde_json::from_value(json!({
            "msg_type": "ohlc",
            "echo_req": {
                "ticks_history": "R_100",
                "granularity": 60,
                "passthrough": {"generation": 3}
            },
            "ohlc": {
                "open": "10.5", "high": "11.0", "low": "10.1", "close": "10.9",
                "open_time": 1_700_000_040, "epoch": 1_700_000_071, "id": "abc"
            },
            "subscription": {"id": "abc"}
        }))
        .unwrap();

        assert_eq!(event.feed_key().unwrap().as_str(), "R_100-60");
        assert_eq!(event.generation(), Some(Generation::new(3)));
        assert_eq!(event.subscription_id(), Some("abc"));
        assert_eq!(event.epoch(), Some(1_700_000_040));
    }

    #[test]
    fn test_tick_event_id_falls_back_to_payload() {
        let event: StreamEvent = serde_json::from_value(json!({
            "msg_type": "tick",
            "echo_req": {"ticks_history": "R_50"},
            "tick": {"epoch": 4, "quote": 13, "id": "t-1"}
        }))
        .unwrap();

        assert_eq!(event.feed_key().unwrap().as_str(), "R_50-0");
        assert_eq!(event.subscription_id(), Some("t-1"));
        assert_eq!(event.generation(), None);
        assert_eq!(event.epoch(), Some(4));
    }

    #[test]
    fn test_wire_number_coercion() {
        assert_eq!(WireNumber::from("12.5").as_f64(), 12.5);
        assert!(WireNumber::from("n/a").as_f64().is_nan());
        assert_eq!(WireNumber::from(60.0).as_epoch(), Some(60));
        assert_eq!(WireNumber::from("oops").as_epoch(), None);
    }
}
