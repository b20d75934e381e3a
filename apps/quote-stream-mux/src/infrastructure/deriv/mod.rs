//! Deriv API Adapter
//!
//! Wire types, quote formatting and the WebSocket transport for the Deriv
//! `ticks_history` API.
//!
//! # Modules
//!
//! - `messages`: request, response and push-event types
//! - `formatter`: wire shapes to normalized quote records
//! - `transport`: WebSocket [`Transport`](crate::application::ports::Transport)

pub mod formatter;
pub mod messages;
pub mod transport;

pub use formatter::QuoteFormatter;
pub use messages::{
    ApiError, CandlePayload, ForgetRequest, HistoryPayload, HistoryStyle, OhlcPayload,
    Passthrough, StreamEvent, SubscriptionInfo, TickPayload, TicksHistoryRequest,
    TicksHistoryResponse, WireNumber,
};
pub use transport::{DEFAULT_WS_URL, DerivTransport, DerivTransportConfig};
