//! Shared fixtures for the integration tests.
//!
//! `FakeTransport` records every request and answers `ticks_history` from a
//! per-symbol script. Replies and forget acks can be held back and released
//! later to exercise in-flight states.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use quote_stream_mux::application::ports::{ResponseFuture, Transport, TransportError};
use quote_stream_mux::{FeedKey, StreamEvent};

/// How the fake answers a `ticks_history` for one symbol.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer at once.
    Ready(Value),
    /// Fail at once.
    Fail(TransportError),
    /// Keep the request pending until released.
    Hold,
}

struct Held {
    request: Value,
    tx: oneshot::Sender<Result<Value, TransportError>>,
}

/// Recording transport with scripted replies.
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<Value>>,
    replies: Mutex<HashMap<String, Reply>>,
    hold_forgets: Mutex<bool>,
    held: Mutex<Vec<Held>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the reply for every `ticks_history` of `symbol`.
    pub fn reply(&self, symbol: &str, reply: Reply) {
        self.replies.lock().insert(symbol.to_string(), reply);
    }

    /// Keep forget acks pending until released.
    pub fn hold_forgets(&self) {
        *self.hold_forgets.lock() = true;
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// Ids of every forget sent so far, in order.
    pub fn forgets(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|r| r.get("forget").and_then(Value::as_str).map(String::from))
            .collect()
    }

    /// `ticks_history` requests carrying `subscribe: 1`.
    pub fn subscribes(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.get("ticks_history").is_some() && r["subscribe"] == 1)
            .cloned()
            .collect()
    }

    /// `ticks_history` requests without `subscribe`.
    pub fn history_requests(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.get("ticks_history").is_some() && r.get("subscribe").is_none())
            .cloned()
            .collect()
    }

    /// Number of requests waiting for a release.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Answer the oldest held request accepted by `matches`.
    pub fn release(&self, matches: impl Fn(&Value) -> bool, reply: Result<Value, TransportError>) {
        let held = {
            let mut held = self.held.lock();
            let index = held
                .iter()
                .position(|h| matches(&h.request))
                .expect("no matching held request");
            held.remove(index)
        };
        let _ = held.tx.send(reply);
    }

    fn hold(&self, request: Value) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        self.held.lock().push(Held { request, tx });
        rx.map(|reply| reply.unwrap_or(Err(TransportError::ConnectionClosed)))
            .boxed()
    }
}

impl Transport for FakeTransport {
    fn send(&self, request: Value) -> ResponseFuture {
        self.sent.lock().push(request.clone());

        if request.get("forget").is_some() {
            if *self.hold_forgets.lock() {
                return self.hold(request);
            }
            return future::ready(Ok(json!({"msg_type": "forget", "forget": 1}))).boxed();
        }

        let symbol = request["ticks_history"].as_str().unwrap_or_default().to_string();
        let reply = self
            .replies
            .lock()
            .get(&symbol)
            .cloned()
            .unwrap_or_else(|| Reply::Ready(tick_history(&[(1_700_000_000, 100.0)])));

        match reply {
            Reply::Ready(value) => future::ready(Ok(value)).boxed(),
            Reply::Fail(error) => future::ready(Err(error)).boxed(),
            Reply::Hold => self.hold(request),
        }
    }
}

/// A tick `history` response.
pub fn tick_history(points: &[(i64, f64)]) -> Value {
    let times: Vec<i64> = points.iter().map(|(t, _)| *t).collect();
    let prices: Vec<f64> = points.iter().map(|(_, p)| *p).collect();
    json!({
        "msg_type": "history",
        "history": {"times": times, "prices": prices},
        "pip_size": 2
    })
}

/// A `candles` response of flat bars.
pub fn candle_history(epochs: &[i64], price: f64) -> Value {
    let candles: Vec<Value> = epochs
        .iter()
        .map(|epoch| {
            json!({
                "epoch": epoch, "open": price, "high": price, "low": price, "close": price
            })
        })
        .collect();
    json!({"msg_type": "candles", "candles": candles})
}

/// A live tick for `symbol`, echoing `generation`.
pub fn tick_event(symbol: &str, generation: u64, epoch: i64, quote: f64, id: &str) -> StreamEvent {
    serde_json::from_value(json!({
        "msg_type": "tick",
        "echo_req": {
            "ticks_history": symbol,
            "subscribe": 1,
            "passthrough": {"generation": generation}
        },
        "tick": {"epoch": epoch, "quote": quote, "symbol": symbol, "id": id},
        "subscription": {"id": id},
        "passthrough": {"generation": generation}
    }))
    .unwrap()
}

/// A live candle update for `symbol`, echoing `generation`.
pub fn ohlc_event(
    symbol: &str,
    granularity: u32,
    generation: u64,
    open_time: i64,
    close: &str,
    id: &str,
) -> StreamEvent {
    serde_json::from_value(json!({
        "msg_type": "ohlc",
        "echo_req": {
            "ticks_history": symbol,
            "granularity": granularity,
            "style": "candles",
            "subscribe": 1,
            "passthrough": {"generation": generation}
        },
        "ohlc": {
            "open": close, "high": close, "low": close, "close": close,
            "open_time": open_time, "epoch": open_time + 1,
            "granularity": granularity, "symbol": symbol, "id": id
        },
        "subscription": {"id": id},
        "passthrough": {"generation": generation}
    }))
    .unwrap()
}

/// Feed key of a tick feed.
pub fn ticks(symbol: &str) -> FeedKey {
    FeedKey::new(symbol, None)
}

/// Let spawned completions run.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
