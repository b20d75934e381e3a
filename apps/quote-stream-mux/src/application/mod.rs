//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the feed multiplexing services and the port
//! interfaces that define how they reach the transport and the chart.

/// Port interfaces for external systems (transport, chart context).
pub mod ports;

/// Application services: stream manager, chart API and subscriptions.
pub mod services;
