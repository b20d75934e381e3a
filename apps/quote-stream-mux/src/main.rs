//! Quote Stream Mux Binary
//!
//! Connects to the Deriv WebSocket API, follows the configured feeds through
//! the multiplexer and logs every chart update.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quote-stream-mux
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `DERIV_APP_ID`: registered Deriv application id
//!
//! ## Optional
//! - `DERIV_WS_URL`: endpoint without query string (default: <wss://ws.derivws.com/websockets/v3>)
//! - `QUOTE_MUX_SYMBOLS`: comma separated symbols (default: `R_100`)
//! - `QUOTE_MUX_GRANULARITY`: candle seconds, 0 for ticks (default: 0)
//! - `QUOTE_MUX_EVENT_BUFFER`: transport event channel capacity (default: 1024)
//! - `QUOTE_MUX_PING_INTERVAL_SECS`: keep-alive interval (default: 30)
//! - `QUOTE_MUX_MAX_CACHE_TICKS`: per-feed cache bound (default: 5000)
//! - `QUOTE_MUX_DEFAULT_COUNT`: history size without a count (default: 1000)
//! - `QUOTE_MUX_MIN_TICK_COUNT`: history floor without a contract (default: 1000)
//! - `QUOTE_MUX_HEALTH_PORT`: health and metrics port (default: 8082)
//! - `QUOTE_MUX_LOG_FORMAT`: `json` or text (default: text)
//! - `RUST_LOG`: extra log filter directives

use std::sync::Arc;

use anyhow::Context;
use quote_stream_mux::application::ports::{ChartState, StandaloneChart, Transport};
use quote_stream_mux::application::services::{
    ChartApi, ChartDataCallback, StreamManager, Subscription,
};
use quote_stream_mux::infrastructure::config::MuxConfig;
use quote_stream_mux::infrastructure::deriv::DerivTransport;
use quote_stream_mux::infrastructure::health::{HealthServer, HealthServerState};
use quote_stream_mux::infrastructure::telemetry;
use quote_stream_mux::{Quote, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Quote Stream Mux");

    init_metrics().context("installing metrics recorder")?;

    let config = MuxConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let (transport, events) =
        DerivTransport::connect(&config.transport_config(), shutdown_token.clone())
            .await
            .context("connecting to Deriv")?;
    let transport: Arc<dyn Transport> = transport;

    let streams = StreamManager::new(Arc::clone(&transport), config.stream_manager_config());
    let api = Arc::new(
        ChartApi::new(Arc::clone(&transport), streams.clone())
            .with_default_count(config.history.default_count),
    );

    let pump = {
        let streams = streams.clone();
        let cancel = shutdown_token.clone();
        tokio::spawn(async move { streams.run(events, cancel).await })
    };

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        streams.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let chart: Arc<dyn ChartState> = Arc::new(StandaloneChart);
    let mut subscriptions = Vec::new();
    for request in config.quote_requests() {
        let subscription = Subscription::realtime(request, Arc::clone(&api), Arc::clone(&chart))
            .with_count_rule(config.count_rule());
        subscription.on_chart_data(chart_logger(subscription.request().symbol.clone()));

        match subscription.initial_fetch().await {
            Ok(result) => tracing::info!(
                symbol = %subscription.request().symbol,
                quotes = result.quotes.len(),
                "History loaded"
            ),
            Err(e) => tracing::error!(
                symbol = %subscription.request().symbol,
                error = %e,
                "Initial fetch failed"
            ),
        }
        subscriptions.push(subscription);
    }

    tracing::info!(feeds = ?streams.active_feeds(), "Quote stream mux ready");

    tokio::select! {
        () = await_shutdown() => {
            for subscription in &subscriptions {
                subscription.forget();
            }
        }
        _ = pump => {
            tracing::warn!("Connection lost, pausing subscriptions");
            for subscription in &subscriptions {
                subscription.pause();
            }
        }
    }

    shutdown_token.cancel();
    let _ = health_handle.await;
    tracing::info!("Quote stream mux stopped");
    Ok(())
}

fn chart_logger(symbol: String) -> ChartDataCallback {
    Arc::new(move |quotes: &Vec<Quote>| {
        if let Some(last) = quotes.last() {
            tracing::info!(
                symbol = %symbol,
                epoch = last.epoch(),
                count = quotes.len(),
                "Chart data"
            );
        }
    })
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &MuxConfig) {
    tracing::info!(
        symbols = ?config.feeds.symbols,
        granularity = config.feeds.granularity,
        max_cache_ticks = config.history.max_cache_ticks,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(url = %config.transport.url, "Deriv endpoint");
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
