//! Chart State Port (Driven Port)
//!
//! What a subscription may ask about the chart it feeds.

use crate::domain::subscription::ContractInfo;

/// Read-only chart context.
#[cfg_attr(test, mockall::automock)]
pub trait ChartState: Send + Sync {
    /// Contract shown on the chart, if any.
    fn contract_info(&self) -> Option<ContractInfo>;

    /// Whether history must be fetched even for a tick-stream contract.
    fn should_fetch_tick_history(&self) -> bool;

    /// Whether the chart has been torn down.
    fn is_destroyed(&self) -> bool;
}

/// A chart with no contract that is never destroyed.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneChart;

impl ChartState for StandaloneChart {
    fn contract_info(&self) -> Option<ContractInfo> {
        None
    }

    fn should_fetch_tick_history(&self) -> bool {
        false
    }

    fn is_destroyed(&self) -> bool {
        false
    }
}
