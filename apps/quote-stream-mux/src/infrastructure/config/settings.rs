//! Multiplexer Configuration Settings
//!
//! Configuration types for the quote stream multiplexer, loaded from
//! environment variables. Numeric settings that are unset or unparseable
//! fall back to their defaults.

use std::time::Duration;

use crate::application::services::{DEFAULT_COUNT, StreamManagerConfig};
use crate::domain::streaming::DEFAULT_MAX_CACHE_TICKS;
use crate::domain::subscription::{Granularity, HistoryCountRule, QuoteRequest, Symbol};
use crate::infrastructure::deriv::{DEFAULT_WS_URL, DerivTransportConfig};

/// Registered Deriv application id.
#[derive(Clone)]
pub struct AppId(String);

impl AppId {
    /// Wrap an application id.
    #[must_use]
    pub const fn new(app_id: String) -> Self {
        Self(app_id)
    }

    /// Get the application id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AppId").field(&"[REDACTED]").finish()
    }
}

/// WebSocket transport settings.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Endpoint URL without query string.
    pub url: String,
    /// Capacity of the transport event channel.
    pub event_buffer: usize,
    /// Keep-alive ping interval.
    pub ping_interval: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            event_buffer: 1024,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// History sizing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistorySettings {
    /// Bound on cached entries per feed.
    pub max_cache_ticks: usize,
    /// History size when a request has no count.
    pub default_count: u32,
    /// Floor for history size when no tick count is known.
    pub min_tick_count: u32,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_cache_ticks: DEFAULT_MAX_CACHE_TICKS,
            default_count: DEFAULT_COUNT,
            min_tick_count: 1000,
        }
    }
}

/// Feeds the binary follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSettings {
    /// Symbols to subscribe to.
    pub symbols: Vec<Symbol>,
    /// Granularity for every symbol; 0 for ticks.
    pub granularity: Granularity,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            symbols: vec!["R_100".to_string()],
            granularity: 0,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health and metrics port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Complete multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Deriv application id.
    pub app_id: AppId,
    /// Transport settings.
    pub transport: TransportSettings,
    /// History settings.
    pub history: HistorySettings,
    /// Followed feeds.
    pub feeds: FeedSettings,
    /// HTTP server settings.
    pub server: ServerSettings,
}

impl MuxConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingEnvVar`] if `DERIV_APP_ID` is unset
    /// - [`ConfigError::EmptyValue`] if `DERIV_APP_ID` is empty
    /// - [`ConfigError::InvalidValue`] if `QUOTE_MUX_SYMBOLS` names no symbol
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let app_id = lookup("DERIV_APP_ID")
            .ok_or_else(|| ConfigError::MissingEnvVar("DERIV_APP_ID".to_string()))?;
        if app_id.trim().is_empty() {
            return Err(ConfigError::EmptyValue("DERIV_APP_ID".to_string()));
        }

        let transport_defaults = TransportSettings::default();
        let transport = TransportSettings {
            url: lookup("DERIV_WS_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(transport_defaults.url),
            event_buffer: parse_or(
                &lookup,
                "QUOTE_MUX_EVENT_BUFFER",
                transport_defaults.event_buffer,
            ),
            ping_interval: parse_duration_secs(
                &lookup,
                "QUOTE_MUX_PING_INTERVAL_SECS",
                transport_defaults.ping_interval,
            ),
        };

        let history_defaults = HistorySettings::default();
        let history = HistorySettings {
            max_cache_ticks: parse_or(
                &lookup,
                "QUOTE_MUX_MAX_CACHE_TICKS",
                history_defaults.max_cache_ticks,
            ),
            default_count: parse_or(
                &lookup,
                "QUOTE_MUX_DEFAULT_COUNT",
                history_defaults.default_count,
            ),
            min_tick_count: parse_or(
                &lookup,
                "QUOTE_MUX_MIN_TICK_COUNT",
                history_defaults.min_tick_count,
            ),
        };

        let feed_defaults = FeedSettings::default();
        let symbols = match lookup("QUOTE_MUX_SYMBOLS") {
            Some(raw) => {
                let symbols: Vec<Symbol> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect();
                if symbols.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: "QUOTE_MUX_SYMBOLS".to_string(),
                        value: raw,
                    });
                }
                symbols
            }
            None => feed_defaults.symbols,
        };
        let feeds = FeedSettings {
            symbols,
            granularity: parse_or(&lookup, "QUOTE_MUX_GRANULARITY", feed_defaults.granularity),
        };

        let server = ServerSettings {
            health_port: parse_or(
                &lookup,
                "QUOTE_MUX_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        Ok(Self {
            app_id: AppId::new(app_id),
            transport,
            history,
            feeds,
            server,
        })
    }

    /// Transport configuration.
    #[must_use]
    pub fn transport_config(&self) -> DerivTransportConfig {
        DerivTransportConfig {
            url: self.transport.url.clone(),
            app_id: self.app_id.as_str().to_string(),
            event_buffer: self.transport.event_buffer,
            ping_interval: self.transport.ping_interval,
        }
    }

    /// Stream manager configuration.
    #[must_use]
    pub const fn stream_manager_config(&self) -> StreamManagerConfig {
        StreamManagerConfig {
            max_cache_ticks: self.history.max_cache_ticks,
        }
    }

    /// History count rule.
    #[must_use]
    pub const fn count_rule(&self) -> HistoryCountRule {
        HistoryCountRule {
            default_count: self.history.default_count,
            min_tick_count: self.history.min_tick_count,
        }
    }

    /// One request per followed symbol.
    #[must_use]
    pub fn quote_requests(&self) -> Vec<QuoteRequest> {
        self.feeds
            .symbols
            .iter()
            .map(|symbol| QuoteRequest::new(symbol.clone(), self.feeds.granularity))
            .collect()
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map_or(default, Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_with_only_app_id() {
        let config = MuxConfig::from_lookup(lookup(&[("DERIV_APP_ID", "1089")])).unwrap();

        assert_eq!(config.app_id.as_str(), "1089");
        assert_eq!(config.transport.url, DEFAULT_WS_URL);
        assert_eq!(config.transport.event_buffer, 1024);
        assert_eq!(config.transport.ping_interval, Duration::from_secs(30));
        assert_eq!(config.history, HistorySettings::default());
        assert_eq!(config.history.max_cache_ticks, 5000);
        assert_eq!(config.feeds.symbols, vec!["R_100"]);
        assert_eq!(config.feeds.granularity, 0);
        assert_eq!(config.server.health_port, 8082);
    }

    #[test]
    fn missing_or_empty_app_id_is_rejected() {
        assert!(matches!(
            MuxConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingEnvVar(ref key)) if key == "DERIV_APP_ID"
        ));
        assert!(matches!(
            MuxConfig::from_lookup(lookup(&[("DERIV_APP_ID", "  ")])),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = MuxConfig::from_lookup(lookup(&[
            ("DERIV_APP_ID", "1089"),
            ("DERIV_WS_URL", "wss://example.test/ws"),
            ("QUOTE_MUX_MAX_CACHE_TICKS", "100"),
            ("QUOTE_MUX_DEFAULT_COUNT", "250"),
            ("QUOTE_MUX_MIN_TICK_COUNT", "300"),
            ("QUOTE_MUX_PING_INTERVAL_SECS", "10"),
            ("QUOTE_MUX_SYMBOLS", "R_100, R_50,,frxEURUSD"),
            ("QUOTE_MUX_GRANULARITY", "60"),
            ("QUOTE_MUX_HEALTH_PORT", "9100"),
        ]))
        .unwrap();

        assert_eq!(config.transport_config().endpoint(), "wss://example.test/ws?app_id=1089");
        assert_eq!(config.transport.ping_interval, Duration::from_secs(10));
        assert_eq!(config.stream_manager_config().max_cache_ticks, 100);
        assert_eq!(config.count_rule().default_count, 250);
        assert_eq!(config.count_rule().min_tick_count, 300);
        assert_eq!(config.server.health_port, 9100);

        let requests = config.quote_requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].feed_key().as_str(), "frxEURUSD-60");
    }

    #[test]
    fn unparseable_numbers_fall_back() {
        let config = MuxConfig::from_lookup(lookup(&[
            ("DERIV_APP_ID", "1089"),
            ("QUOTE_MUX_MAX_CACHE_TICKS", "lots"),
            ("QUOTE_MUX_PING_INTERVAL_SECS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.history.max_cache_ticks, DEFAULT_MAX_CACHE_TICKS);
        assert_eq!(config.transport.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn blank_symbol_list_is_invalid() {
        assert!(matches!(
            MuxConfig::from_lookup(lookup(&[("DERIV_APP_ID", "1"), ("QUOTE_MUX_SYMBOLS", " , ")])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn app_id_redacted_debug() {
        let debug = format!("{:?}", AppId::new("secret-app".to_string()));
        assert!(!debug.contains("secret-app"));
        assert!(debug.contains("[REDACTED]"));
    }
}
