//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `StreamManager`: one network subscription per feed, feed caches,
//!   teardown and orphan cleanup
//! - `ChartApi`: history requests and the live request registry
//! - `Subscription`: a chart's fetch/stream/pause/resume/forget lifecycle

mod chart_api;
mod stream_manager;
mod subscription;

pub use chart_api::{ChartApi, DEFAULT_COUNT};
pub use stream_manager::{FeedCallback, StreamError, StreamManager, StreamManagerConfig};
pub use subscription::{
    ChartDataCallback, FeedContext, FeedStrategy, LiveFeed, QuotesResult, RealtimeStrategy,
    StartedFeed, StaticStrategy, Subscription, SubscriptionError,
};
