#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Quote Stream Mux - Tick/Candle Subscription Multiplexer
//!
//! Shares one upstream `ticks_history` subscription per (symbol,
//! granularity) between any number of chart consumers. Each feed keeps a
//! bounded cache of recent ticks or candles so late joiners can be served
//! history without another round trip.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Core streaming logic and data types
//!   - `streaming`: Tick/candle records and the bounded feed cache
//!   - `subscription`: Feed keys, generations, request and phase types
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport and chart-state contracts
//!   - `services`: Stream manager, chart API, chart subscriptions
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `deriv`: Wire types, quote formatter and WebSocket transport
//!   - `broadcast`: Per-feed callback fan-out
//!   - `config`: Environment configuration
//!   - `metrics`, `telemetry`: Prometheus metrics and tracing
//!
//! # Data Flow
//!
//! ```text
//!                  ticks_history / forget
//!  Subscription ──► ChartApi ──► StreamManager ──► DerivTransport ──► WS
//!       ▲                             │                   │
//!       │     Stream<StreamEvent>     │   TransportEvent  │
//!       └──── tick callback ◄─────────┴◄──────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{Candle, FeedCache, Quote, Tick};
pub use domain::subscription::{FeedKey, Generation, HistoryCountRule, Phase, QuoteRequest};

// Ports
pub use application::ports::{ChartState, StandaloneChart, Transport, TransportError, TransportEvent};

// Services
pub use application::services::{
    ChartApi, StreamError, StreamManager, StreamManagerConfig, Subscription, SubscriptionError,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, MuxConfig};

// Deriv adapter
pub use infrastructure::deriv::{DerivTransport, DerivTransportConfig, StreamEvent};

// Health and metrics
pub use infrastructure::health::{HealthServer, HealthServerState};
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
