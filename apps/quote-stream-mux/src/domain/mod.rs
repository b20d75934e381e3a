//! Domain Layer - Core quote and subscription types.
//!
//! Pure types with no I/O: quote records, the bounded feed cache, feed
//! identity and the chart subscription lifecycle.

/// Quote records and the bounded feed cache.
pub mod streaming;

/// Feed identity, subscription lifecycle and history count rule.
pub mod subscription;
