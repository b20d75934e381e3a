//! Chart Subscription
//!
//! One chart's view of one feed: fetch history, follow the live stream,
//! pause when the connection drops, resume from the last seen epoch, and
//! forget.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ─initial_fetch─▶ Fetching ─ok─▶ Streaming ─pause─▶ Paused
//!                          │                ▲               │
//!                          │                └────resume─────┘
//!                          └─err─▶ Forgotten ◀─forget─ (any)
//! ```
//!
//! How history is fetched and whether a live feed is attached is decided by
//! a [`FeedStrategy`]: [`RealtimeStrategy`] for live charts and
//! [`StaticStrategy`] for fixed history windows.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future;
use parking_lot::Mutex;

use super::chart_api::ChartApi;
use super::stream_manager::{FeedCallback, StreamError};
use crate::application::ports::{ChartState, TransportError};
use crate::domain::streaming::Quote;
use crate::domain::subscription::{HistoryCountRule, Phase, PhaseEvent, QuoteRequest};
use crate::infrastructure::broadcast::{Callback, Stream};
use crate::infrastructure::deriv::{QuoteFormatter, StreamEvent, TicksHistoryResponse};

// =============================================================================
// Error Type
// =============================================================================

/// Subscription failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// History response had neither candles nor a well-formed history.
    #[error("Malformed history response")]
    MalformedResponse,

    /// The transport failed or the server rejected the request.
    #[error("Transport rejected request: {0}")]
    TransportRejection(TransportError),

    /// The fetch failed and the subscription forgot itself.
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(Box<SubscriptionError>),

    /// `resume` or `initial_fetch` while a fetch or stream is active.
    #[error("Cannot resume an active stream")]
    AlreadyActive,

    /// The subscription was forgotten.
    #[error("Subscription was forgotten")]
    Forgotten,

    /// Any other stream manager failure.
    #[error(transparent)]
    Stream(StreamError),
}

impl From<StreamError> for SubscriptionError {
    fn from(error: StreamError) -> Self {
        match error {
            StreamError::MalformedResponse => Self::MalformedResponse,
            StreamError::Transport(error) => Self::TransportRejection(error),
            other => Self::Stream(other),
        }
    }
}

// =============================================================================
// Types
// =============================================================================

/// Chart data listener; receives one or more records per call.
pub type ChartDataCallback = Callback<Vec<Quote>>;

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotesResult {
    /// Formatted history.
    pub quotes: Vec<Quote>,
    /// The raw history response.
    pub response: TicksHistoryResponse,
}

/// A live feed attached by a strategy.
#[derive(Clone)]
pub struct LiveFeed {
    /// Request the feed was attached with.
    pub request: QuoteRequest,
    /// Callback attached to the feed.
    pub callback: FeedCallback,
}

impl std::fmt::Debug for LiveFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveFeed")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// What a strategy hands back after starting a feed.
#[derive(Debug, Clone)]
pub struct StartedFeed {
    /// Formatted history.
    pub quotes: Vec<Quote>,
    /// The raw history response.
    pub response: TicksHistoryResponse,
    /// Live feed, if one was attached.
    pub live: Option<LiveFeed>,
}

// =============================================================================
// Strategy
// =============================================================================

/// What a strategy may use to start a feed.
pub struct FeedContext {
    api: Arc<ChartApi>,
    chart: Arc<dyn ChartState>,
    count_rule: HistoryCountRule,
    core: Weak<Core>,
}

impl FeedContext {
    /// Chart API.
    #[must_use]
    pub fn api(&self) -> &Arc<ChartApi> {
        &self.api
    }

    /// Chart context.
    #[must_use]
    pub fn chart(&self) -> &Arc<dyn ChartState> {
        &self.chart
    }

    /// History count for this chart.
    #[must_use]
    pub fn history_count(&self) -> u32 {
        self.count_rule.count(
            self.chart.contract_info().as_ref(),
            self.chart.should_fetch_tick_history(),
        )
    }

    /// A fresh live-event callback feeding this subscription.
    ///
    /// Only the most recently created callback delivers; older ones go
    /// quiet. On a destroyed chart, a tick carrying an id is forgotten by id
    /// instead of being processed.
    #[must_use]
    pub fn tick_callback(&self) -> FeedCallback {
        let core = Weak::clone(&self.core);
        let token = core.upgrade().map_or(0, |core| core.begin_attachment());
        let api = Arc::downgrade(&self.api);
        let chart = Arc::clone(&self.chart);

        Arc::new(move |event: &StreamEvent| {
            if chart.is_destroyed()
                && let Some(id) = event.tick.as_ref().and_then(|tick| tick.id.as_deref())
            {
                if let Some(api) = api.upgrade() {
                    // Dispatch is synchronous; the ack is not awaited
                    drop(api.forget_stream(id));
                }
                return;
            }

            if let Some(core) = core.upgrade() {
                core.on_tick(token, event);
            }
        })
    }
}

/// How a subscription fetches history and attaches to live data.
#[async_trait]
pub trait FeedStrategy: Send + Sync {
    /// Start the feed for `request`.
    ///
    /// On failure the strategy must leave nothing attached.
    async fn start_subscribe(
        &self,
        ctx: &FeedContext,
        request: &QuoteRequest,
    ) -> Result<StartedFeed, SubscriptionError>;
}

/// Live charts: attach the live feed, then fetch history.
///
/// Attaching first means no tick is lost between the history snapshot and
/// the live stream. The feed's own first response must succeed as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealtimeStrategy;

#[async_trait]
impl FeedStrategy for RealtimeStrategy {
    async fn start_subscribe(
        &self,
        ctx: &FeedContext,
        request: &QuoteRequest,
    ) -> Result<StartedFeed, SubscriptionError> {
        let sized = QuoteRequest {
            count: Some(ctx.history_count()),
            ..request.clone()
        };
        let callback = ctx.tick_callback();
        ctx.api()
            .subscribe_ticks_history(&sized, Arc::clone(&callback))?;

        let formatted = future::try_join(
            ctx.api().stream_ready(&sized),
            ctx.api().ticks_history(&sized),
        )
        .await
        .map_err(SubscriptionError::from)
        .and_then(|((), response)| {
            QuoteFormatter::format_history(&response)
                .map(|quotes| (quotes, response))
                .ok_or(SubscriptionError::MalformedResponse)
        });

        match formatted {
            Ok((quotes, response)) => Ok(StartedFeed {
                quotes,
                response,
                live: Some(LiveFeed {
                    request: sized,
                    callback,
                }),
            }),
            Err(error) => {
                ctx.api().forget(&sized, &callback);
                Err(error)
            }
        }
    }
}

/// Fixed history windows: fetch history only.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticStrategy;

#[async_trait]
impl FeedStrategy for StaticStrategy {
    async fn start_subscribe(
        &self,
        ctx: &FeedContext,
        request: &QuoteRequest,
    ) -> Result<StartedFeed, SubscriptionError> {
        let response = ctx.api().ticks_history(request).await?;
        let quotes =
            QuoteFormatter::format_history(&response).ok_or(SubscriptionError::MalformedResponse)?;

        Ok(StartedFeed {
            quotes,
            response,
            live: None,
        })
    }
}

// =============================================================================
// Subscription
// =============================================================================

struct CoreState {
    phase: Phase,
    last_stream_epoch: Option<i64>,
    live: Option<LiveFeed>,
    attachment: u64,
}

struct Core {
    state: Mutex<CoreState>,
    chart_data: Stream<Vec<Quote>>,
}

impl Core {
    fn begin_attachment(&self) -> u64 {
        let mut state = self.state.lock();
        state.attachment += 1;
        state.attachment
    }

    fn on_tick(&self, token: u64, event: &StreamEvent) {
        {
            let mut state = self.state.lock();
            if token != state.attachment || !state.phase.is_active() {
                return;
            }
            // Recorded before formatting so resume has a start even if emit fails
            if let Some(epoch) = event.epoch() {
                state.last_stream_epoch = Some(epoch);
            }
        }

        if let Some(quote) = QuoteFormatter::format_tick(event) {
            self.chart_data.emit(&vec![quote]);
        }
    }
}

/// One chart's subscription to one feed.
pub struct Subscription {
    request: QuoteRequest,
    ctx: FeedContext,
    strategy: Box<dyn FeedStrategy>,
    core: Arc<Core>,
}

impl Subscription {
    /// Subscription with a custom strategy.
    #[must_use]
    pub fn new(
        request: QuoteRequest,
        api: Arc<ChartApi>,
        chart: Arc<dyn ChartState>,
        strategy: Box<dyn FeedStrategy>,
    ) -> Self {
        let core = Arc::new(Core {
            state: Mutex::new(CoreState {
                phase: Phase::Idle,
                last_stream_epoch: None,
                live: None,
                attachment: 0,
            }),
            chart_data: Stream::new(),
        });

        Self {
            request,
            ctx: FeedContext {
                api,
                chart,
                count_rule: HistoryCountRule::default(),
                core: Arc::downgrade(&core),
            },
            strategy,
            core,
        }
    }

    /// Live subscription.
    #[must_use]
    pub fn realtime(request: QuoteRequest, api: Arc<ChartApi>, chart: Arc<dyn ChartState>) -> Self {
        Self::new(request, api, chart, Box::new(RealtimeStrategy))
    }

    /// History-only subscription.
    #[must_use]
    pub fn static_history(
        request: QuoteRequest,
        api: Arc<ChartApi>,
        chart: Arc<dyn ChartState>,
    ) -> Self {
        Self::new(request, api, chart, Box::new(StaticStrategy))
    }

    /// Replace the history count rule.
    #[must_use]
    pub const fn with_count_rule(mut self, rule: HistoryCountRule) -> Self {
        self.ctx.count_rule = rule;
        self
    }

    /// The request this subscription was created for.
    #[must_use]
    pub const fn request(&self) -> &QuoteRequest {
        &self.request
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.core.state.lock().phase
    }

    /// Epoch of the most recent processed event or history record.
    #[must_use]
    pub fn last_stream_epoch(&self) -> Option<i64> {
        self.core.state.lock().last_stream_epoch
    }

    /// Listen for chart data. Returns `false` if already listening.
    pub fn on_chart_data(&self, callback: ChartDataCallback) -> bool {
        self.core.chart_data.on_stream(callback)
    }

    /// Stop listening for chart data.
    pub fn off_chart_data(&self, callback: &ChartDataCallback) -> bool {
        self.core.chart_data.off_stream(callback)
    }

    /// Fetch history and start streaming.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::AlreadyActive`] unless the subscription is idle
    /// - [`SubscriptionError::Forgotten`] after `forget`
    /// - [`SubscriptionError::SubscriptionFailed`] if the fetch failed; the
    ///   subscription has then forgotten itself
    pub async fn initial_fetch(&self) -> Result<QuotesResult, SubscriptionError> {
        {
            let mut state = self.core.state.lock();
            if !matches!(state.phase, Phase::Idle | Phase::Forgotten) {
                return Err(SubscriptionError::AlreadyActive);
            }
            state.phase = state
                .phase
                .on(PhaseEvent::FetchStarted)
                .ok_or(SubscriptionError::Forgotten)?;
        }

        self.fetch(&self.request).await
    }

    /// Stop delivering live events without a network forget.
    ///
    /// The live callback stays attached but goes quiet; `resume` swaps it
    /// for a new one and `forget` detaches it. Returns whether the
    /// subscription was streaming.
    pub fn pause(&self) -> bool {
        let mut state = self.core.state.lock();
        let Some(next) = state.phase.on(PhaseEvent::Paused) else {
            return false;
        };
        state.phase = next;
        drop(state);

        tracing::debug!(symbol = %self.request.symbol, "Subscription paused");
        true
    }

    /// Refetch from the last seen epoch and stream again.
    ///
    /// Without a recorded epoch nothing is fetched and `Ok(None)` is
    /// returned.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::AlreadyActive`] while fetching or streaming
    /// - [`SubscriptionError::Forgotten`] after `forget`
    /// - [`SubscriptionError::SubscriptionFailed`] if the refetch failed
    pub async fn resume(&self) -> Result<Option<QuotesResult>, SubscriptionError> {
        let start = {
            let mut state = self.core.state.lock();
            if state.phase.is_active() {
                return Err(SubscriptionError::AlreadyActive);
            }
            let next = state
                .phase
                .on(PhaseEvent::FetchStarted)
                .ok_or(SubscriptionError::Forgotten)?;

            let Some(start) = state.last_stream_epoch else {
                tracing::warn!(
                    symbol = %self.request.symbol,
                    granularity = self.request.granularity_or_ticks(),
                    "Resume without a stream epoch, nothing fetched"
                );
                return Ok(None);
            };
            state.phase = next;
            start
        };

        self.fetch(&self.request.starting_at(start)).await.map(Some)
    }

    /// Forget the subscription.
    ///
    /// Detaches the live callback, paused or not, and drops every
    /// chart-data listener. Calling it again does nothing.
    pub fn forget(&self) {
        self.forget_on(PhaseEvent::Forgotten);
    }

    fn forget_on(&self, event: PhaseEvent) {
        let live = {
            let mut state = self.core.state.lock();
            let Some(next) = state.phase.on(event) else {
                return;
            };
            state.phase = next;
            state.last_stream_epoch = None;
            state.live.take()
        };

        if let Some(live) = live {
            self.ctx.api().forget(&live.request, &live.callback);
        }
        self.core.chart_data.clear();
        tracing::debug!(symbol = %self.request.symbol, "Subscription forgotten");
    }

    async fn fetch(&self, request: &QuoteRequest) -> Result<QuotesResult, SubscriptionError> {
        let started = match self.strategy.start_subscribe(&self.ctx, request).await {
            Ok(started) => started,
            Err(error) => {
                tracing::warn!(
                    symbol = %request.symbol,
                    granularity = request.granularity_or_ticks(),
                    error = %error,
                    "Subscription fetch failed"
                );
                self.forget_on(PhaseEvent::FetchFailed);
                return Err(SubscriptionError::SubscriptionFailed(Box::new(error)));
            }
        };

        let latest = QuoteFormatter::latest_epoch(&started.response);
        let mut state = self.core.state.lock();
        let Some(next) = state.phase.on(PhaseEvent::FetchSucceeded) else {
            drop(state);
            if let Some(live) = started.live {
                self.ctx.api().forget(&live.request, &live.callback);
            }
            return Err(SubscriptionError::Forgotten);
        };

        state.phase = next;
        state.last_stream_epoch = state.last_stream_epoch.max(latest);
        let replaced = started.live.and_then(|live| state.live.replace(live));
        drop(state);

        // Callback from before a pause, if its feed still holds it
        if let Some(previous) = replaced {
            self.ctx.api().forget(&previous.request, &previous.callback);
        }

        Ok(QuotesResult {
            quotes: started.quotes,
            response: started.response,
        })
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Subscription")
            .field("request", &self.request)
            .field("phase", &state.phase)
            .field("last_stream_epoch", &state.last_stream_epoch)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
