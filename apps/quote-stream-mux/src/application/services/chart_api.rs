//! Chart API
//!
//! Request-building front door used by chart subscriptions. It turns a
//! [`QuoteRequest`] into a `ticks_history` wire request, fetches plain
//! history, attaches live feeds through the [`StreamManager`], and remembers
//! which live request belongs to which callback so it can be forgotten by
//! symbol and granularity later.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future;
use parking_lot::Mutex;

use super::stream_manager::{FeedCallback, StreamError, StreamManager};
use crate::application::ports::{ResponseFuture, Transport, TransportError};
use crate::domain::subscription::{FeedKey, QuoteRequest};
use crate::infrastructure::deriv::{
    ForgetRequest, HistoryStyle, TicksHistoryRequest, TicksHistoryResponse,
};
use crate::infrastructure::metrics::{self, ForgetReason};

/// History size asked for when a request has no count.
pub const DEFAULT_COUNT: u32 = 1000;

struct StreamRequest {
    request: TicksHistoryRequest,
    callback: FeedCallback,
}

/// History and live-feed access for charts.
pub struct ChartApi {
    transport: Arc<dyn Transport>,
    streams: StreamManager,
    default_count: u32,
    stream_requests: Mutex<HashMap<FeedKey, Vec<StreamRequest>>>,
}

impl ChartApi {
    /// Create an API over `transport`, attaching live feeds through `streams`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, streams: StreamManager) -> Self {
        Self {
            transport,
            streams,
            default_count: DEFAULT_COUNT,
            stream_requests: Mutex::new(HashMap::new()),
        }
    }

    /// Override the history size used when a request has no count.
    #[must_use]
    pub const fn with_default_count(mut self, default_count: u32) -> Self {
        self.default_count = default_count;
        self
    }

    /// The stream manager live feeds go through.
    #[must_use]
    pub const fn stream_manager(&self) -> &StreamManager {
        &self.streams
    }

    /// Build the `ticks_history` request for `quote`.
    ///
    /// Candles when a granularity is set, ticks otherwise. `end` defaults to
    /// `"latest"` and `count` to the default count; a `start` drops `count`.
    ///
    /// ```rust
    /// # use std::sync::Arc;
    /// # use quote_stream_mux::application::ports::{ResponseFuture, Transport, TransportError};
    /// # use quote_stream_mux::application::services::{ChartApi, StreamManager, StreamManagerConfig};
    /// # use quote_stream_mux::domain::subscription::QuoteRequest;
    /// # use futures::FutureExt;
    /// # struct Offline;
    /// # impl Transport for Offline {
    /// #     fn send(&self, _: serde_json::Value) -> ResponseFuture {
    /// #         futures::future::ready(Err(TransportError::ConnectionClosed)).boxed()
    /// #     }
    /// # }
    /// # let transport: Arc<dyn Transport> = Arc::new(Offline);
    /// # let streams = StreamManager::new(Arc::clone(&transport), StreamManagerConfig::default());
    /// let api = ChartApi::new(transport, streams);
    ///
    /// let request = api.create_tick_history_request(&QuoteRequest::new("R_100", 60), true);
    /// let wire = serde_json::to_value(&request).unwrap();
    /// assert_eq!(wire["style"], "candles");
    /// assert_eq!(wire["count"], 1000);
    /// assert_eq!(wire["end"], "latest");
    /// assert_eq!(wire["subscribe"], 1);
    /// ```
    #[must_use]
    pub fn create_tick_history_request(
        &self,
        quote: &QuoteRequest,
        subscribe: bool,
    ) -> TicksHistoryRequest {
        let granularity = quote.granularity.filter(|g| *g > 0);
        let start = quote.start.filter(|s| *s > 0);

        TicksHistoryRequest {
            ticks_history: quote.symbol.clone(),
            style: Some(if granularity.is_some() {
                HistoryStyle::Candles
            } else {
                HistoryStyle::Ticks
            }),
            granularity,
            end: Some(
                quote
                    .end
                    .map_or_else(|| "latest".to_string(), |end| end.to_string()),
            ),
            count: if start.is_some() {
                None
            } else {
                Some(quote.count.filter(|c| *c > 0).unwrap_or(self.default_count))
            },
            start,
            adjust_start_time: Some(1),
            subscribe: subscribe.then_some(1),
            passthrough: None,
        }
    }

    /// Fetch history without subscribing.
    ///
    /// # Errors
    ///
    /// - [`StreamError::Transport`] if the send fails or the server answers
    ///   with an `error` payload
    /// - [`StreamError::MalformedResponse`] if the answer cannot be decoded
    pub async fn ticks_history(
        &self,
        quote: &QuoteRequest,
    ) -> Result<TicksHistoryResponse, StreamError> {
        let request = self.create_tick_history_request(quote, false);
        let payload =
            serde_json::to_value(&request).map_err(|e| StreamError::Encode(e.to_string()))?;

        let value = self.transport.send(payload).await?;
        let response: TicksHistoryResponse =
            serde_json::from_value(value).map_err(|_| StreamError::MalformedResponse)?;

        if let Some(error) = response.error {
            return Err(StreamError::Transport(TransportError::Rejected {
                code: error.code,
                message: error.message,
            }));
        }
        Ok(response)
    }

    /// Attach `callback` to the live feed of `quote` and remember it.
    ///
    /// # Errors
    ///
    /// Propagates [`StreamManager::subscribe`] failures.
    pub fn subscribe_ticks_history(
        &self,
        quote: &QuoteRequest,
        callback: FeedCallback,
    ) -> Result<(), StreamError> {
        let request = self.create_tick_history_request(quote, true);
        self.streams.subscribe(&request, Arc::clone(&callback))?;

        self.stream_requests
            .lock()
            .entry(quote.feed_key())
            .or_default()
            .push(StreamRequest { request, callback });
        Ok(())
    }

    /// Detach `callback` from the live feed of `quote`.
    ///
    /// A request that was never subscribed, or already forgotten, is a
    /// no-op. Returns whether anything was detached.
    pub fn forget(&self, quote: &QuoteRequest, callback: &FeedCallback) -> bool {
        let entry = {
            let key = quote.feed_key();
            let mut requests = self.stream_requests.lock();
            let Some(entries) = requests.get_mut(&key) else {
                return false;
            };
            let Some(index) = entries
                .iter()
                .position(|entry| Arc::ptr_eq(&entry.callback, callback))
            else {
                return false;
            };
            let entry = entries.remove(index);
            if entries.is_empty() {
                requests.remove(&key);
            }
            entry
        };

        self.streams.forget(&entry.request, &entry.callback)
    }

    /// Wait for the first response of the live feed of `quote`.
    ///
    /// # Errors
    ///
    /// Propagates [`StreamManager::ready`] failures, including a rejected
    /// subscribe.
    pub async fn stream_ready(&self, quote: &QuoteRequest) -> Result<(), StreamError> {
        let request = self.create_tick_history_request(quote, true);
        self.streams.ready(&request).await
    }

    /// Forget a server-side subscription by id.
    pub fn forget_stream(&self, subscription_id: &str) -> ResponseFuture {
        tracing::debug!(subscription_id, "Forgetting stream by id");
        let payload = match serde_json::to_value(ForgetRequest::new(subscription_id)) {
            Ok(payload) => payload,
            Err(error) => return future::ready(Err(TransportError::Send(error.to_string()))).boxed(),
        };
        metrics::record_forget(ForgetReason::DestroyedChart);
        self.transport.send(payload)
    }

    /// Number of live requests currently remembered.
    #[must_use]
    pub fn tracked_requests(&self) -> usize {
        self.stream_requests.lock().values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for ChartApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChartApi")
            .field("default_count", &self.default_count)
            .field("tracked_requests", &self.tracked_requests())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
