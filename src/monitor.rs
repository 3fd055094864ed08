//! Observability: structured alert events (logged via `tracing`) and the
//! Prometheus metrics exposed on the node's `/metrics` endpoint.
//!
//! Alerts travel over `tracing` spans/events rather than a database
//! notification channel, since this crate runs standalone.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::node::MgmtbusStatus;

/// Alert event types for the polling/aggregation domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    /// An indicator's age-out deadline passed; it was withdrawn.
    IndicatorAgedOut,
    /// Sudden-death forced an indicator's immediate age-out.
    SuddenDeath,
    /// A polling pass failed and is being retried.
    PollingError,
    /// A polling pass recovered after a prior failure.
    PollingRecovered,
    /// The aggregator's output topology changed for a range.
    AggregatorRangeChanged,
}

impl AlertEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertEvent::IndicatorAgedOut => "indicator_aged_out",
            AlertEvent::SuddenDeath => "sudden_death",
            AlertEvent::PollingError => "polling_error",
            AlertEvent::PollingRecovered => "polling_recovered",
            AlertEvent::AggregatorRangeChanged => "aggregator_range_changed",
        }
    }
}

/// Emit a structured alert event at the appropriate `tracing` level.
pub fn emit_alert(event: AlertEvent, node_name: &str, extra: &str) {
    match event {
        AlertEvent::PollingError => {
            tracing::warn!(event = event.as_str(), node = node_name, extra, "node alert");
        }
        _ => {
            tracing::info!(event = event.as_str(), node = node_name, extra, "node alert");
        }
    }
}

/// Per-node Prometheus metrics, registered once at node construction.
pub struct NodeMetrics {
    pub polls_total: IntCounter,
    pub poll_errors_total: IntCounter,
    pub updates_emitted_total: IntCounter,
    pub withdraws_emitted_total: IntCounter,
    pub indicators_by_state: IntCounterVec,
    pub table_size: IntGauge,
}

impl NodeMetrics {
    pub fn new(registry: &Registry, node_name: &str) -> prometheus::Result<Self> {
        let polls_total = IntCounter::with_opts(
            Opts::new("threatmesh_polls_total", "Total polling passes attempted").const_label("node", node_name),
        )?;
        let poll_errors_total = IntCounter::with_opts(
            Opts::new("threatmesh_poll_errors_total", "Total polling passes that raised a retryable error")
                .const_label("node", node_name),
        )?;
        let updates_emitted_total = IntCounter::with_opts(
            Opts::new("threatmesh_updates_emitted_total", "Total update events emitted").const_label("node", node_name),
        )?;
        let withdraws_emitted_total = IntCounter::with_opts(
            Opts::new("threatmesh_withdraws_emitted_total", "Total withdraw events emitted").const_label("node", node_name),
        )?;
        let indicators_by_state = IntCounterVec::new(
            Opts::new("threatmesh_indicators_by_state_total", "Indicators classified per poll, by classifier state")
                .const_label("node", node_name),
            &["state"],
        )?;
        let table_size = IntGauge::with_opts(
            Opts::new("threatmesh_table_size", "Current number of indicators held in the table").const_label("node", node_name),
        )?;

        registry.register(Box::new(polls_total.clone()))?;
        registry.register(Box::new(poll_errors_total.clone()))?;
        registry.register(Box::new(updates_emitted_total.clone()))?;
        registry.register(Box::new(withdraws_emitted_total.clone()))?;
        registry.register(Box::new(indicators_by_state.clone()))?;
        registry.register(Box::new(table_size.clone()))?;

        Ok(NodeMetrics {
            polls_total,
            poll_errors_total,
            updates_emitted_total,
            withdraws_emitted_total,
            indicators_by_state,
            table_size,
        })
    }

    pub fn observe_status(&self, status: &MgmtbusStatus) {
        self.table_size.set(status.length as i64);
    }
}
