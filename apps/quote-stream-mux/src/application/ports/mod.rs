//! Application Ports
//!
//! Contracts between the multiplexer core and its collaborators.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: request/response connection to the quote server, plus the
//!   push-event channel it feeds
//! - `ChartState`: read-only context of the chart that owns a subscription

mod chart_state_port;
mod transport_port;

pub use chart_state_port::{ChartState, StandaloneChart};
#[cfg(test)]
pub use chart_state_port::MockChartState;
pub use transport_port::{ResponseFuture, Transport, TransportError, TransportEvent};
#[cfg(test)]
pub use transport_port::MockTransport;
