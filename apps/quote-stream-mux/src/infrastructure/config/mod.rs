//! Configuration Module
//!
//! Environment-driven configuration for the multiplexer binary.

mod settings;

pub use settings::{
    AppId, ConfigError, FeedSettings, HistorySettings, MuxConfig, ServerSettings,
    TransportSettings,
};
