//! Tracing Setup
//!
//! Configures `tracing-subscriber` with a formatted console layer and an
//! `EnvFilter`.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: extra filter directives, merged over the defaults
//! - `QUOTE_MUX_LOG_FORMAT`: `json` for JSON lines, anything else for text
//!
//! # Usage
//!
//! ```ignore
//! use quote_stream_mux::infrastructure::telemetry;
//!
//! // Initialize at startup (returns guard that must be kept alive)
//! let _guard = telemetry::init();
//! tracing::info!("ready");
//! ```

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Directives applied before `RUST_LOG`.
const DEFAULT_DIRECTIVES: &[&str] = &["quote_stream_mux=info", "tungstenite=warn", "rustls=warn"];

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable text.
    Text,
    /// One JSON object per line.
    Json,
}

/// Guard held for the lifetime of the program.
///
/// Dropping it logs a final line so shutdown is visible in the output.
#[derive(Debug)]
pub struct TelemetryGuard {
    initialized: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.initialized {
            tracing::debug!("Telemetry shut down");
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Output format.
    pub format: LogFormat,
    /// Whether to include the event target.
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let format = match lookup("QUOTE_MUX_LOG_FORMAT") {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        Self {
            format,
            ..Self::default()
        }
    }
}

/// Initialize tracing with configuration from the environment.
///
/// Returns a guard that must be kept alive for the duration of the program.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(&TelemetryConfig::from_env())
}

/// Initialize tracing with custom configuration.
///
/// A subscriber installed earlier (tests, embedding) wins; the call then
/// returns an inert guard.
#[must_use]
pub fn init_with_config(config: &TelemetryConfig) -> TelemetryGuard {
    let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref());

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(config.with_target)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target),
            )
            .try_init(),
    };

    TelemetryGuard {
        initialized: result.is_ok(),
    }
}

fn build_filter(rust_log: Option<&str>) -> EnvFilter {
    let mut filter = EnvFilter::new(DEFAULT_DIRECTIVES.join(","));
    for directive in rust_log
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
    {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring invalid RUST_LOG directive {directive:?}: {e}"),
        }
    }
    filter
}

// =============================================================================
// Tests
// =============================================================================
