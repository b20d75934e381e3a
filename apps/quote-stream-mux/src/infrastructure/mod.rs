//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Deriv WebSocket adapter: wire types, quote formatting, transport.
pub mod deriv;

/// Per-feed callback fan-out.
pub mod broadcast;

/// Environment configuration.
pub mod config;

/// Health check and metrics HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing subscriber setup.
pub mod telemetry;
