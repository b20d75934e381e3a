//! Stream Manager
//!
//! De-duplicates live feed subscriptions, keeps the bounded history cache of
//! every feed, and cleans up server-side subscriptions that lost their local
//! bookkeeping.
//!
//! # Design
//!
//! - One feed per [`FeedKey`]: the first `subscribe` sends the network
//!   subscribe, later ones only attach a callback to the feed's [`Stream`].
//! - The first response seeds the [`FeedCache`]; an `error` payload or a
//!   malformed history tears the feed down instead.
//! - When a feed's last callback leaves, the feed is torn down: stream
//!   destroyed, cache evicted, and a `forget` sent if the subscription id is
//!   known. The id only ever arrives on the first live event.
//! - Every feed incarnation carries a [`Generation`], echoed by the server in
//!   `passthrough`. Completions and late events are checked against it, so
//!   a re-subscribe during an in-flight forget is never clobbered.
//! - A connection close retires every generation issued so far. Late events
//!   of a retired generation are dropped, never forgotten as orphans.
//!
//! # Locking
//!
//! All state sits behind one mutex. It is never held while a subscriber
//! callback or no-subscriber hook runs, nor across an `.await`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Transport, TransportError, TransportEvent};
use crate::domain::streaming::{DEFAULT_MAX_CACHE_TICKS, FeedCache, FeedShape, MergeOutcome};
use crate::domain::subscription::{FeedKey, Generation};
use crate::infrastructure::broadcast::{Callback, Stream};
use crate::infrastructure::deriv::{
    ForgetRequest, Passthrough, QuoteFormatter, StreamEvent, TicksHistoryRequest,
    TicksHistoryResponse,
};
use crate::infrastructure::metrics::{self, ForgetReason};

// =============================================================================
// Types
// =============================================================================

/// Callback attached to a feed; receives every live event of that feed.
pub type FeedCallback = Callback<StreamEvent>;

type FirstResponse = Shared<BoxFuture<'static, Result<(), StreamError>>>;

/// Stream manager failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The history response had neither candles nor a well-formed history.
    #[error("Malformed history response")]
    MalformedResponse,

    /// The transport failed or the server rejected the request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No feed exists for the key.
    #[error("No active feed for {0}")]
    NotSubscribed(FeedKey),

    /// The feed was torn down while the caller waited on it.
    #[error("Feed {0} was torn down")]
    TornDown(FeedKey),

    /// The request could not be encoded.
    #[error("Failed to encode request: {0}")]
    Encode(String),
}

/// Stream manager settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamManagerConfig {
    /// Maximum cached entries per feed.
    pub max_cache_ticks: usize,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            max_cache_ticks: DEFAULT_MAX_CACHE_TICKS,
        }
    }
}

// =============================================================================
// State
// =============================================================================

struct Feed {
    generation: Generation,
    shape: FeedShape,
    stream: Arc<Stream<StreamEvent>>,
    cache: Option<FeedCache>,
    pending: Option<FirstResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedId {
    generation: Generation,
    id: String,
}

#[derive(Default)]
struct ManagerState {
    feeds: HashMap<FeedKey, Feed>,
    subscription_ids: HashMap<FeedKey, TrackedId>,
    being_forgotten: HashSet<(FeedKey, Generation)>,
    last_generation: Generation,
    closed_through: Option<Generation>,
}

impl ManagerState {
    fn allocate_generation(&mut self) -> Generation {
        self.last_generation = self.last_generation.next();
        self.last_generation
    }

    /// An unknown generation matches any in-flight forget for the key.
    fn is_being_forgotten(&self, key: &FeedKey, generation: Option<Generation>) -> bool {
        match generation {
            Some(generation) => self.being_forgotten.contains(&(key.clone(), generation)),
            None => self.being_forgotten.iter().any(|(k, _)| k == key),
        }
    }

    /// Whether `generation` belonged to a connection that has closed.
    fn is_retired(&self, generation: Option<Generation>) -> bool {
        generation
            .zip(self.closed_through)
            .is_some_and(|(generation, closed)| generation <= closed)
    }

    fn track_id(&mut self, key: &FeedKey, generation: Generation, id: Option<&str>) {
        if let Some(id) = id {
            self.subscription_ids.insert(
                key.clone(),
                TrackedId {
                    generation,
                    id: id.to_string(),
                },
            );
        }
    }
}

enum Route {
    Emit(Arc<Stream<StreamEvent>>),
    Orphan { generation: Generation, id: String },
    Drop,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: StreamManagerConfig,
    state: Mutex<ManagerState>,
}

// =============================================================================
// Stream Manager
// =============================================================================

/// Shares one network subscription per feed between any number of callbacks.
///
/// Cloning is cheap and yields a handle to the same manager.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl StreamManager {
    /// Create a manager sending through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: StreamManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Attach `callback` to the feed of `request`, creating the feed first
    /// if needed.
    ///
    /// Creating a feed sends the request with `subscribe: 1` and starts
    /// waiting for its first response in the background.
    ///
    /// # Errors
    ///
    /// - [`StreamError::Encode`] if the request cannot be serialized
    /// - [`StreamError::TornDown`] if the feed died before the callback
    ///   could be attached
    pub fn subscribe(
        &self,
        request: &TicksHistoryRequest,
        callback: FeedCallback,
    ) -> Result<(), StreamError> {
        let key = request.feed_key();
        let stream = self.inner.open_feed(request)?;

        if !stream.on_stream(callback) && stream.is_destroyed() {
            return Err(StreamError::TornDown(key));
        }
        Ok(())
    }

    /// Create the feed of `request` without attaching a callback.
    ///
    /// The feed stays up until a callback attaches and later leaves, or the
    /// connection closes.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Encode`] if the request cannot be serialized.
    pub fn prime(&self, request: &TicksHistoryRequest) -> Result<(), StreamError> {
        self.inner.open_feed(request).map(|_| ())
    }

    /// Detach `callback` from the feed of `request`.
    ///
    /// Teardown happens through the feed's no-subscriber hook when this was
    /// the last callback. Returns whether the callback was attached.
    pub fn forget(&self, request: &TicksHistoryRequest, callback: &FeedCallback) -> bool {
        let stream = {
            let state = self.inner.state.lock();
            state
                .feeds
                .get(&request.feed_key())
                .map(|feed| Arc::clone(&feed.stream))
        };

        stream.is_some_and(|stream| stream.off_stream(callback))
    }

    /// Copy of the cached history of the feed of `request`.
    ///
    /// Waits for the first response when the cache is not seeded yet.
    ///
    /// # Errors
    ///
    /// - [`StreamError::NotSubscribed`] if there is no feed for the key
    /// - the first response's error if it failed
    /// - [`StreamError::TornDown`] if the feed went away while waiting
    pub async fn tick_history(&self, request: &TicksHistoryRequest) -> Result<FeedCache, StreamError> {
        self.read_seeded(request, FeedCache::clone).await
    }

    /// Wait until the feed of `request` has its first response.
    ///
    /// # Errors
    ///
    /// Same as [`StreamManager::tick_history`].
    pub async fn ready(&self, request: &TicksHistoryRequest) -> Result<(), StreamError> {
        self.read_seeded(request, |_| ()).await
    }

    async fn read_seeded<T>(
        &self,
        request: &TicksHistoryRequest,
        read: impl Fn(&FeedCache) -> T,
    ) -> Result<T, StreamError> {
        let key = request.feed_key();
        let (generation, pending) = {
            let state = self.inner.state.lock();
            let feed = state
                .feeds
                .get(&key)
                .ok_or_else(|| StreamError::NotSubscribed(key.clone()))?;
            if let Some(cache) = &feed.cache {
                return Ok(read(cache));
            }
            (feed.generation, feed.pending.clone())
        };

        if let Some(pending) = pending {
            pending.await?;
        }

        let state = self.inner.state.lock();
        state
            .feeds
            .get(&key)
            .filter(|feed| feed.generation == generation)
            .and_then(|feed| feed.cache.as_ref())
            .map(read)
            .ok_or(StreamError::TornDown(key))
    }

    /// Route one live event to its feed.
    pub fn handle_event(&self, event: &StreamEvent) {
        self.inner.handle_event(event);
    }

    /// Handle loss of the connection.
    ///
    /// Clears every known subscription id and destroys each feed that still
    /// has callbacks. No forget is sent.
    pub fn handle_connection_closed(&self) {
        self.inner.handle_connection_closed();
    }

    /// Drain transport events in order until the channel ends or `cancel`
    /// fires.
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!("Stream manager cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Live(event)) => self.handle_event(&event),
                    Some(TransportEvent::Closed) => self.handle_connection_closed(),
                    None => {
                        tracing::info!("Transport event channel closed");
                        break;
                    }
                }
            }
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Keys of all live feeds, sorted.
    #[must_use]
    pub fn active_feeds(&self) -> Vec<FeedKey> {
        let mut keys: Vec<_> = self.inner.state.lock().feeds.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of callbacks attached to a feed.
    #[must_use]
    pub fn subscriber_count(&self, key: &FeedKey) -> usize {
        let stream = {
            let state = self.inner.state.lock();
            state.feeds.get(key).map(|feed| Arc::clone(&feed.stream))
        };
        stream.map_or(0, |stream| stream.subscriber_count())
    }

    /// Copy of a feed's cache, if seeded.
    #[must_use]
    pub fn cached(&self, key: &FeedKey) -> Option<FeedCache> {
        self.inner
            .state
            .lock()
            .feeds
            .get(key)
            .and_then(|feed| feed.cache.clone())
    }

    /// Subscription id known for a key.
    #[must_use]
    pub fn subscription_id(&self, key: &FeedKey) -> Option<String> {
        self.inner
            .state
            .lock()
            .subscription_ids
            .get(key)
            .map(|tracked| tracked.id.clone())
    }

    /// Whether a forget for any incarnation of the key is in flight.
    #[must_use]
    pub fn is_being_forgotten(&self, key: &FeedKey) -> bool {
        self.inner.state.lock().is_being_forgotten(key, None)
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StreamManager")
            .field("feeds", &state.feeds.len())
            .field("subscription_ids", &state.subscription_ids.len())
            .field("being_forgotten", &state.being_forgotten.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Internals
// =============================================================================

impl Inner {
    /// Existing stream for the key, or a freshly subscribed one.
    fn open_feed(
        self: &Arc<Self>,
        request: &TicksHistoryRequest,
    ) -> Result<Arc<Stream<StreamEvent>>, StreamError> {
        let key = request.feed_key();
        let mut state = self.state.lock();
        if let Some(feed) = state.feeds.get(&key) {
            return Ok(Arc::clone(&feed.stream));
        }

        let generation = state.allocate_generation();
        let wire = TicksHistoryRequest {
            subscribe: Some(1),
            passthrough: Some(Passthrough { generation }),
            ..request.clone()
        };
        let payload = serde_json::to_value(&wire).map_err(|e| StreamError::Encode(e.to_string()))?;

        let stream = Arc::new(Stream::new());
        let weak = Arc::downgrade(self);
        let hook_key = key.clone();
        stream.set_on_no_subscriber(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.forget_stream(&hook_key, generation);
            }
        }));

        let shape = FeedShape::for_granularity(request.granularity.unwrap_or(0));
        let response = self.transport.send(payload);
        let pending = first_response(Arc::downgrade(self), key.clone(), generation, response)
            .boxed()
            .shared();

        state.feeds.insert(
            key.clone(),
            Feed {
                generation,
                shape,
                stream: Arc::clone(&stream),
                cache: None,
                pending: Some(pending.clone()),
            },
        );
        metrics::set_active_feeds(state.feeds.len());
        drop(state);

        tracing::info!(key = %key, generation = %generation, "Feed subscribed");
        drive(pending.map(|_| ()));
        Ok(stream)
    }

    /// Seed the cache from the first response, or tear the feed down.
    fn complete_first_response(
        self: &Arc<Self>,
        key: &FeedKey,
        generation: Generation,
        outcome: Result<Value, TransportError>,
    ) -> Result<(), StreamError> {
        let shape = {
            let state = self.state.lock();
            match state.feeds.get(key) {
                Some(feed) if feed.generation == generation => feed.shape,
                _ => return Err(StreamError::TornDown(key.clone())),
            }
        };

        let seeded = outcome
            .map_err(StreamError::from)
            .and_then(|value| self.seed_cache(shape, value));

        match seeded {
            Ok(cache) => {
                let mut state = self.state.lock();
                let Some(feed) = state
                    .feeds
                    .get_mut(key)
                    .filter(|feed| feed.generation == generation)
                else {
                    return Err(StreamError::TornDown(key.clone()));
                };
                tracing::debug!(key = %key, entries = cache.len(), "Feed cache seeded");
                feed.cache = Some(cache);
                feed.pending = None;
                Ok(())
            }
            Err(error) => {
                tracing::warn!(key = %key, generation = %generation, error = %error, "Feed subscribe failed");
                metrics::record_subscribe_failure();
                self.forget_stream(key, generation);
                Err(error)
            }
        }
    }

    fn seed_cache(&self, shape: FeedShape, value: Value) -> Result<FeedCache, StreamError> {
        let response: TicksHistoryResponse =
            serde_json::from_value(value).map_err(|_| StreamError::MalformedResponse)?;

        if let Some(error) = response.error {
            return Err(StreamError::Transport(TransportError::Rejected {
                code: error.code,
                message: error.message,
            }));
        }

        let quotes =
            QuoteFormatter::format_history(&response).ok_or(StreamError::MalformedResponse)?;
        FeedCache::from_quotes(shape, &quotes, self.config.max_cache_ticks)
            .ok_or(StreamError::MalformedResponse)
    }

    /// Tear down one feed incarnation.
    fn forget_stream(self: &Arc<Self>, key: &FeedKey, generation: Generation) {
        let (stream, id, remaining) = {
            let mut state = self.state.lock();
            if !state
                .feeds
                .get(key)
                .is_some_and(|feed| feed.generation == generation)
            {
                return;
            }
            let Some(feed) = state.feeds.remove(key) else {
                return;
            };

            let id = state
                .subscription_ids
                .get(key)
                .filter(|tracked| tracked.generation == generation)
                .map(|tracked| tracked.id.clone());
            if id.is_some() {
                state.being_forgotten.insert((key.clone(), generation));
            }
            (feed.stream, id, state.feeds.len())
        };

        stream.destroy();
        metrics::set_active_feeds(remaining);
        tracing::info!(
            key = %key,
            generation = %generation,
            subscription_id = id.as_deref().unwrap_or("unknown"),
            "Feed torn down"
        );

        if let Some(id) = id {
            self.send_forget(key, generation, id, ForgetReason::Teardown);
        }
    }

    /// Send a forget and clear this incarnation's bookkeeping on completion.
    ///
    /// Cleanup runs whether the forget succeeds or not.
    fn send_forget(self: &Arc<Self>, key: &FeedKey, generation: Generation, id: String, reason: ForgetReason) {
        let payload = match serde_json::to_value(ForgetRequest::new(&id)) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(key = %key, subscription_id = %id, error = %error, "Forget not encoded");
                self.complete_forget(key, generation);
                return;
            }
        };
        metrics::record_forget(reason);
        let ack = self.transport.send(payload);
        let weak = Arc::downgrade(self);
        let key = key.clone();

        drive(async move {
            if let Err(error) = ack.await {
                tracing::debug!(key = %key, subscription_id = %id, error = %error, "Forget not acknowledged");
            }
            if let Some(inner) = weak.upgrade() {
                inner.complete_forget(&key, generation);
            }
        });
    }

    fn complete_forget(&self, key: &FeedKey, generation: Generation) {
        let mut state = self.state.lock();
        state.being_forgotten.remove(&(key.clone(), generation));
        if state
            .subscription_ids
            .get(key)
            .is_some_and(|tracked| tracked.generation == generation)
        {
            state.subscription_ids.remove(key);
        }
    }

    fn handle_event(self: &Arc<Self>, event: &StreamEvent) {
        metrics::record_event_received(&event.msg_type);
        let Some(key) = event.feed_key() else {
            tracing::debug!(msg_type = %event.msg_type, "Event without a feed key");
            return;
        };

        // A first response that already arrived settles before its events
        self.settle_pending(&key);

        let event_generation = event.generation();
        let id = event.subscription_id();

        let route = {
            let mut state = self.state.lock();
            let current = state
                .feeds
                .get(&key)
                .map(|feed| (feed.generation, feed.cache.is_some()));

            match current {
                Some((generation, seeded))
                    if event_generation.is_none_or(|g| g == generation) =>
                {
                    state.track_id(&key, generation, id);
                    if seeded {
                        let feed = state.feeds.get_mut(&key);
                        feed.map_or(Route::Drop, |feed| merge_event(&key, feed, event))
                    } else {
                        tracing::debug!(key = %key, "Event before first response, dropped");
                        Route::Drop
                    }
                }
                _ => {
                    let generation = event_generation.unwrap_or(Generation::UNTRACKED);
                    match id {
                        Some(_) if state.is_retired(event_generation) => {
                            tracing::debug!(key = %key, generation = %generation, "Event from closed connection, dropped");
                            Route::Drop
                        }
                        Some(id) if !state.is_being_forgotten(&key, event_generation) => {
                            state.being_forgotten.insert((key.clone(), generation));
                            Route::Orphan {
                                generation,
                                id: id.to_string(),
                            }
                        }
                        _ => Route::Drop,
                    }
                }
            }
        };

        match route {
            Route::Emit(stream) => {
                stream.emit(event);
            }
            Route::Orphan { generation, id } => {
                tracing::warn!(
                    key = %key,
                    generation = %generation,
                    subscription_id = %id,
                    "Orphan subscription, forgetting"
                );
                self.send_forget(&key, generation, id, ForgetReason::Orphan);
            }
            Route::Drop => {}
        }
    }

    fn settle_pending(&self, key: &FeedKey) {
        let pending = {
            let state = self.state.lock();
            state
                .feeds
                .get(key)
                .filter(|feed| feed.cache.is_none())
                .and_then(|feed| feed.pending.clone())
        };
        if let Some(pending) = pending {
            let _ = pending.now_or_never();
        }
    }

    fn handle_connection_closed(&self) {
        let (streams, remaining) = {
            let mut state = self.state.lock();
            state.subscription_ids.clear();
            state.closed_through = Some(state.last_generation);

            let dead: Vec<FeedKey> = state
                .feeds
                .iter()
                .filter(|(_, feed)| feed.stream.subscriber_count() > 0)
                .map(|(key, _)| key.clone())
                .collect();
            let streams: Vec<_> = dead
                .iter()
                .filter_map(|key| state.feeds.remove(key))
                .map(|feed| feed.stream)
                .collect();
            (streams, state.feeds.len())
        };

        tracing::warn!(destroyed = streams.len(), remaining, "Connection closed, feeds dropped");
        metrics::set_active_feeds(remaining);
        for stream in streams {
            stream.destroy();
        }
    }
}

fn merge_event(key: &FeedKey, feed: &mut Feed, event: &StreamEvent) -> Route {
    if let (Some(cache), Some(quote)) = (feed.cache.as_mut(), QuoteFormatter::format_tick(event)) {
        match cache.merge(&quote) {
            MergeOutcome::Appended | MergeOutcome::Replaced => {}
            MergeOutcome::Stale => {
                tracing::debug!(key = %key, epoch = quote.epoch(), "Stale record not cached");
            }
            MergeOutcome::WrongShape => {
                tracing::warn!(key = %key, msg_type = %event.msg_type, "Record shape does not match feed");
            }
        }
    }
    Route::Emit(Arc::clone(&feed.stream))
}

async fn first_response(
    inner: Weak<Inner>,
    key: FeedKey,
    generation: Generation,
    response: crate::application::ports::ResponseFuture,
) -> Result<(), StreamError> {
    let outcome = response.await;
    match inner.upgrade() {
        Some(inner) => inner.complete_first_response(&key, generation, outcome),
        None => Err(StreamError::TornDown(key)),
    }
}

/// Run a detached completion on the current runtime.
fn drive<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::warn!("No tokio runtime, completion left undriven"),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future;
    use serde_json::json;

    use super::*;
    use crate::application::ports::MockTransport;

    fn request(symbol: &str, granularity: Option<u32>) -> TicksHistoryRequest {
        TicksHistoryRequest {
            ticks_history: symbol.to_string(),
            granularity,
            count: Some(3),
            end: Some("latest".to_string()),
            ..TicksHistoryRequest::default()
        }
    }

    fn ready(value: Value) -> crate::application::ports::ResponseFuture {
        future::ready(Ok(value)).boxed()
    }

    fn history() -> Value {
        json!({
            "msg_type": "history",
            "history": {"times": [1, 2, 3], "prices": [10, 11, 12]}
        })
    }

    fn tick(symbol: &str, generation: u64, epoch: i64, quote: f64, id: &str) -> StreamEvent {
        serde_json::from_value(json!({
            "msg_type": "tick",
            "echo_req": {
                "ticks_history": symbol,
                "subscribe": 1,
                "passthrough": {"generation": generation}
            },
            "tick": {"epoch": epoch, "quote": quote, "id": id},
            "subscription": {"id": id}
        }))
        .unwrap()
    }

    fn counting() -> (FeedCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let callback: FeedCallback = Arc::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    fn is_forget(request: &Value) -> bool {
        request.get("forget").is_some()
    }

    #[tokio::test]
    async fn concurrent_subscribers_share_one_feed() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|r| r["subscribe"] == 1 && r["passthrough"]["generation"] == 1)
            .times(1)
            .returning(|_| ready(history()));
        let manager = StreamManager::new(Arc::new(transport), StreamManagerConfig::default());

        let (a, a_count) = counting();
        let (b, b_count) = counting();
        manager.subscribe(&request("R_100", None), a).unwrap();
        manager.subscribe(&request("R_100", None), b).unwrap();

        let cache = manager.tick_history(&request("R_100", None)).await.unwrap();
        assert_eq!(cache.times(), vec![1, 2, 3]);

        manager.handle_event(&tick("R_100", 1, 4, 13.0, "abc"));
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);

        let key = FeedKey::new("R_100", None);
        assert_eq!(manager.cached(&key).unwrap().prices(), vec![10.0, 11.0, 12.0, 13.0]);
        assert_eq!(manager.subscription_id(&key).as_deref(), Some("abc"));
        assert_eq!(manager.subscriber_count(&key), 2);
    }

    #[tokio::test]
    async fn rejected_first_response_tears_feed_down() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(1).returning(|_| {
            ready(json!({"error": {"code": "InvalidSymbol", "message": "Unknown symbol"}}))
        });
        let manager = StreamManager::new(Arc::new(transport), StreamManagerConfig::default());

        let (callback, _) = counting();
        manager.subscribe(&request("FOO", None), callback).unwrap();

        let result = manager.tick_history(&request("FOO", None)).await;
        assert_eq!(
            result,
            Err(StreamError::Transport(TransportError::Rejected {
                code: "InvalidSymbol".to_string(),
                message: "Unknown symbol".to_string(),
            }))
        );
        assert!(manager.active_feeds().is_empty());
    }

    #[tokio::test]
    async fn malformed_first_response_tears_feed_down() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| ready(json!({"history": {"times": [1, 2], "prices": [1]}})));
        let manager = StreamManager::new(Arc::new(transport), StreamManagerConfig::default());

        let (callback, _) = counting();
        manager.subscribe(&request("R_50", None), callback).unwrap();

        assert_eq!(
            manager.tick_history(&request("R_50", None)).await,
            Err(StreamError::MalformedResponse)
        );
        assert!(manager.active_feeds().is_empty());
    }

    #[tokio::test]
    async fn last_forget_tears_down_with_one_network_forget() {
        let forgets = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&forgets);
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|r| !is_forget(r))
            .times(1)
            .returning(|_| ready(history()));
        transport
            .expect_send()
            .withf(|r| r["forget"] == "abc")
            .times(1)
            .returning(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                ready(json!({"forget": 1}))
            });
        let manager = StreamManager::new(Arc::new(transport), StreamManagerConfig::default());
        let req = request("R_100", None);

        let (a, _) = counting();
        let (b, _) = counting();
        manager.subscribe(&req, Arc::clone(&a)).unwrap();
        manager.subscribe(&req, Arc::clone(&b)).unwrap();
        manager.tick_history(&req).await.unwrap();
        manager.handle_event(&tick("R_100", 1, 4, 13.0, "abc"));

        assert!(manager.forget(&req, &a));
        assert_eq!(manager.active_feeds().len(), 1);
        assert!(manager.forget(&req, &b));

        assert!(manager.active_feeds().is_empty());
        assert!(manager.cached(&req.feed_key()).is_none());
        assert_eq!(forgets.load(Ordering::SeqCst), 1);
        assert!(!manager.forget(&req, &b));
    }

    #[tokio::test]
    async fn event_for_removed_feed_is_forgotten_once() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|r| r["forget"] == "late")
            .times(1)
            .returning(|_| future::pending().boxed());
        let manager = StreamManager::new(Arc::new(transport), StreamManagerConfig::default());

        manager.handle_event(&tick("R_10", 5, 1, 1.0, "late"));
        manager.handle_event(&tick("R_10", 5, 2, 1.0, "late"));

        let key = FeedKey::new("R_10", None);
        assert!(manager.is_being_forgotten(&key));
        assert!(manager.active_feeds().is_empty());
    }

    #[tokio::test]
    async fn stale_generation_event_does_not_touch_new_feed() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|r| !is_forget(r))
            .times(1)
            .returning(|_| ready(history()));
        transport
            .expect_send()
            .withf(|r| r["forget"] == "old")
            .times(1)
            .returning(|_| ready(json!({"forget": 1})));
        let manager = StreamManager::new(Arc::new(transport), StreamManagerConfig::default());
        let req = request("R_100", None);

        let (callback, count) = counting();
        manager.subscribe(&req, callback).unwrap();
        manager.tick_history(&req).await.unwrap();

        // Generation 0 never existed in this manager
        manager.handle_event(&tick("R_100", 0, 9, 99.0, "old"));

        let key = req.feed_key();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(manager.cached(&key).unwrap().len(), 3);
        assert_eq!(manager.subscription_id(&key), None);
    }

    #[tokio::test]
    async fn events_before_first_response_are_dropped() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| future::pending().boxed());
        let manager = StreamManager::new(Arc::new(transport), StreamManagerConfig::default());
        let req = request("R_25", None);

        let (callback, count) = counting();
        manager.subscribe(&req, callback).unwrap();
        manager.handle_event(&tick("R_25", 1, 1, 1.0, "early"));

        let key = req.feed_key();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(manager.active_feeds(), vec![key.clone()]);
        assert_eq!(manager.subscription_id(&key).as_deref(), Some("early"));
    }

    #[tokio::test]
    async fn connection_close_drops_only_subscribed_feeds() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|r| !is_forget(r))
            .times(2)
            .returning(|_| ready(history()));
        transport.expect_send().withf(is_forget).times(0);
        let manager = StreamManager::new(Arc::new(transport), StreamManagerConfig::default());

        let watched = request("R_100", None);
        let idle = request("R_50", None);
        let (callback, count) = counting();
        manager.subscribe(&watched, callback).unwrap();
        manager.prime(&idle).unwrap();
        manager.tick_history(&watched).await.unwrap();
        manager.handle_event(&tick("R_100", 1, 4, 13.0, "abc"));

        manager.handle_connection_closed();

        assert_eq!(manager.active_feeds(), vec![idle.feed_key()]);
        assert_eq!(manager.subscription_id(&watched.feed_key()), None);

        manager.handle_event(&tick("R_100", 1, 5, 14.0, "abc"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tick_history_without_feed_is_not_subscribed() {
        let manager = StreamManager::new(
            Arc::new(MockTransport::new()),
            StreamManagerConfig::default(),
        );
        let req = request("R_75", Some(60));
        assert_eq!(
            manager.tick_history(&req).await,
            Err(StreamError::NotSubscribed(req.feed_key()))
        );
    }

    #[tokio::test]
    async fn run_pumps_events_until_cancelled() {
        let mut transport = MockTransport::new();
        transport.expect_send().returning(|_| ready(history()));
        let manager = StreamManager::new(Arc::new(transport), StreamManagerConfig::default());
        let req = request("R_100", None);
        let (callback, count) = counting();
        manager.subscribe(&req, callback).unwrap();
        manager.tick_history(&req).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let pump = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.run(rx, cancel).await })
        };

        tx.send(TransportEvent::Live(Box::new(tick("R_100", 1, 4, 13.0, "abc"))))
            .await
            .unwrap();
        tx.send(TransportEvent::Closed).await.unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(manager.active_feeds().is_empty());
        assert!(!cancel.is_cancelled());
    }
}
