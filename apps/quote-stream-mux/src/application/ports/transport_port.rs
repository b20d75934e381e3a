//! Transport Port (Driven Port)
//!
//! The connection the core talks through. Request/response correlation,
//! handshakes and reconnects belong to the adapter; the core only needs:
//!
//! - `send`: dispatch a request now, receive its response later
//! - a [`TransportEvent`] stream carrying live pushes and one `Closed`
//!   notification per connection lifetime

use futures::future::BoxFuture;
use serde_json::Value;

use crate::infrastructure::deriv::StreamEvent;

/// Response to a request, resolved when the server answers.
pub type ResponseFuture = BoxFuture<'static, Result<Value, TransportError>>;

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server answered with an `error` payload.
    #[error("Request rejected: {code}: {message}")]
    Rejected {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
    },

    /// The connection closed before the response arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The request could not be written.
    #[error("Send failed: {0}")]
    Send(String),

    /// The response could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Inbound notification from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A `tick` or `ohlc` push.
    Live(Box<StreamEvent>),
    /// The connection is gone; fired at most once per connection.
    Closed,
}

/// Request/response half of the connection.
///
/// `send` must dispatch synchronously, so that requests leave in call
/// order. The returned future only waits for the answer and may be dropped
/// without cancelling the request.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Dispatch `request` and return a future for its response.
    fn send(&self, request: Value) -> ResponseFuture;
}
