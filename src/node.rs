//! The `Node` and `Bus` trait surfaces: the narrow interfaces this
//! crate's engines are driven through and emit on, and the small lifecycle
//! enum the harness observes.
//!
//! Both traits are collaborator boundaries — the harness (lifecycle,
//! mgmtbus wiring) and the inter-node message bus live outside this crate.
//! What's here is the contract `PollerEngine` and `RangeAggregator`
//! are built against, plus an in-process `Bus` used by tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::NodeError;
use crate::record::IndicatorRecord;
use crate::table::{Index, Query};

/// Lifecycle states observable by the harness. The core engines only assert
/// behavior while `Started`; the rest exists so `mgmtbus_status` has
/// something honest to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Init,
    Configured,
    Idle,
    Started,
    Stopped,
    Error,
}

/// Status snapshot returned by [`Node::mgmtbus_status`].
#[derive(Debug, Clone)]
pub struct MgmtbusStatus {
    pub state: NodeState,
    pub last_run: Option<i64>,
    pub length: usize,
    pub statistics: BTreeMap<String, u64>,
}

/// Lifecycle and data-access surface exposed to the harness.
#[async_trait]
pub trait Node: Send + Sync {
    fn configure(&mut self) -> Result<(), NodeError>;
    async fn initialize(&mut self) -> Result<(), NodeError>;
    async fn rebuild(&mut self) -> Result<(), NodeError>;
    async fn reset(&mut self) -> Result<(), NodeError>;
    async fn start(&mut self) -> Result<(), NodeError>;
    async fn stop(&mut self) -> Result<(), NodeError>;

    /// External kick: force the current inter-poll sleep to end immediately.
    fn hup(&self, source: &str);

    fn length(&self, source: &str) -> usize;
    fn mgmtbus_status(&self) -> MgmtbusStatus;

    async fn filtered_update(&mut self, source: &str, indicator: &str, value: Value) -> Result<(), NodeError>;
    async fn filtered_withdraw(&mut self, source: &str, indicator: &str, value: Option<Value>) -> Result<(), NodeError>;

    fn get(&self, source: &str, indicator: &str) -> Option<IndicatorRecord>;
    fn get_all(&self, source: &str) -> Vec<(String, IndicatorRecord)>;
    fn get_range(&self, source: &str, index: Index, query: Query) -> Vec<(String, Option<IndicatorRecord>)>;
}

/// The inter-node emit surface, consumed narrowly: an update/withdraw
/// and an RPC escape hatch for less-common node-to-node calls.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn emit_update(&self, indicator: &str, value: Value);
    async fn emit_withdraw(&self, indicator: &str);
    async fn do_rpc(&self, target: &str, method: &str, args: Value) -> Result<Value, NodeError>;
}

/// In-process `Bus` that records every emit, for tests and for running a
/// node standalone without a real message-bus transport.
#[derive(Debug, Default)]
pub struct RecordingBus {
    pub updates: std::sync::Mutex<Vec<(String, Value)>>,
    pub withdraws: std::sync::Mutex<Vec<String>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for RecordingBus {
    async fn emit_update(&self, indicator: &str, value: Value) {
        self.updates.lock().expect("bus lock poisoned").push((indicator.to_string(), value));
    }

    async fn emit_withdraw(&self, indicator: &str) {
        self.withdraws.lock().expect("bus lock poisoned").push(indicator.to_string());
    }

    async fn do_rpc(&self, _target: &str, _method: &str, _args: Value) -> Result<Value, NodeError> {
        Ok(Value::Null)
    }
}
