//! Prometheus Metrics Module
//!
//! Feed multiplexer metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Events**: live pushes received, by message type
//! - **Feeds**: active feed count, subscribe failures
//! - **Forgets**: forgets issued, orphan forgets
//!
//! # Integration
//!
//! Recording functions go through the `metrics` facade and are no-ops until
//! [`init_metrics`] installs the recorder. The health server renders the
//! handle at `GET /metrics`.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Later calls return the handle installed by the first.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "quote_mux_events_received_total",
        "Live tick/ohlc events received from the transport"
    );
    describe_gauge!("quote_mux_active_feeds", "Feeds with a live stream");
    describe_counter!(
        "quote_mux_subscribe_failures_total",
        "Feeds torn down because their first response failed"
    );
    describe_counter!(
        "quote_mux_forgets_total",
        "Network forgets issued, by reason"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a forget was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgetReason {
    /// Last subscriber of a feed left.
    Teardown,
    /// Event for a feed with no local record.
    Orphan,
    /// Tick for a chart that no longer exists.
    DestroyedChart,
}

impl ForgetReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Teardown => "teardown",
            Self::Orphan => "orphan",
            Self::DestroyedChart => "destroyed_chart",
        }
    }
}

/// Record a live event received from the transport.
pub fn record_event_received(msg_type: &str) {
    let label = match msg_type {
        "tick" => "tick",
        "ohlc" => "ohlc",
        _ => "other",
    };
    counter!("quote_mux_events_received_total", "msg_type" => label).increment(1);
}

/// Record a forget issued.
pub fn record_forget(reason: ForgetReason) {
    counter!("quote_mux_forgets_total", "reason" => reason.as_str()).increment(1);
}

/// Record a feed whose first response failed.
pub fn record_subscribe_failure() {
    counter!("quote_mux_subscribe_failures_total").increment(1);
}

/// Update the active feed count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_feeds(count: usize) {
    gauge!("quote_mux_active_feeds").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_event_received("tick");
        record_event_received("proposal");
        record_forget(ForgetReason::Orphan);
        record_subscribe_failure();
        set_active_feeds(3);
    }

    #[test]
    fn forget_reason_labels() {
        assert_eq!(ForgetReason::Teardown.as_str(), "teardown");
        assert_eq!(ForgetReason::Orphan.as_str(), "orphan");
        assert_eq!(ForgetReason::DestroyedChart.as_str(), "destroyed_chart");
    }
}
