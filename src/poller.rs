//! `PollerEngine`: the periodic polling loop, the age-out loop, and rebuild
//! emission, generalized over a [`FeedSource`] capability set instead of one
//! hard-coded feed protocol — a `Node` lifecycle wrapper around a
//! `PollerEngine<S>` parameterized by the driver that knows how to fetch and
//! decode one particular feed protocol.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

use crate::age_out::AgeOutPolicy;
use crate::classifier::{IndicatorState, PollAction};
use crate::error::{NodeError, RetryPolicy, RetryState};
use crate::monitor::{emit_alert, AlertEvent, NodeMetrics};
use crate::node::{Bus, NodeState};
use crate::record::{Attributes, IndicatorRecord};
use crate::table::{Index, IndicatorTable, Query};

/// Capability set a concrete protocol driver (e.g. [`crate::taxii::PullFeedDriver`])
/// provides to the generic engine: a way to fetch raw items for this pass,
/// and a way to decode one raw item into zero or more `(indicator, value)`
/// pairs.
#[async_trait]
pub trait FeedSource: Send + Sync {
    type Item: Send;

    async fn build_iterator(&self, now: i64) -> Result<Vec<Self::Item>, NodeError>;
    fn process_item(&self, item: Self::Item) -> Result<Vec<(String, Value)>, NodeError>;
}

/// Static polling configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub source_name: String,
    pub attributes_template: Attributes,
    pub interval: Duration,
    pub num_retries: u32,
    pub age_out: AgeOutPolicy,
}

/// Shared mutable state between the poll worker, the age-out worker, and
/// the `Node` lifecycle surface.
struct Shared {
    state: RwLock<NodeState>,
    last_run: RwLock<Option<i64>>,
    last_ageout_run: RwLock<Option<i64>>,
    rebuild: RwLock<bool>,
    stats: RwLock<BTreeMap<String, u64>>,
}

/// The engine: two cooperative tokio tasks (poll worker, age-out worker)
/// sharing a table, a bus, and lifecycle state.
pub struct PollerEngine<S: FeedSource> {
    source: Arc<S>,
    config: Arc<PollerConfig>,
    bus: Arc<dyn Bus>,
    table: Arc<RwLock<dyn IndicatorTable>>,
    shared: Arc<Shared>,
    hup_notify: Arc<Notify>,
    workers: Vec<JoinHandle<()>>,
    metrics: Option<Arc<NodeMetrics>>,
}

impl<S: FeedSource + 'static> PollerEngine<S> {
    pub fn new(source: S, config: PollerConfig, bus: Arc<dyn Bus>, table: Arc<RwLock<dyn IndicatorTable>>) -> Self {
        PollerEngine {
            source: Arc::new(source),
            config: Arc::new(config),
            bus,
            table,
            shared: Arc::new(Shared {
                state: RwLock::new(NodeState::Init),
                last_run: RwLock::new(None),
                last_ageout_run: RwLock::new(None),
                rebuild: RwLock::new(false),
                stats: RwLock::new(BTreeMap::new()),
            }),
            hup_notify: Arc::new(Notify::new()),
            workers: Vec::new(),
            metrics: None,
        }
    }

    /// Attach the Prometheus/alert surface the poll and age-out workers
    /// report through. Without this, the engine runs exactly as before —
    /// metrics are an opt-in observer, not a dependency.
    pub fn with_metrics(mut self, metrics: Arc<NodeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn state(&self) -> NodeState {
        *self.shared.state.read().await
    }

    pub async fn last_run(&self) -> Option<i64> {
        *self.shared.last_run.read().await
    }

    pub fn request_rebuild(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            *shared.rebuild.write().await = true;
        });
    }

    /// Force the current inter-poll sleep to end immediately.
    pub fn hup(&self) {
        self.hup_notify.notify_one();
    }

    async fn start_workers(&mut self) {
        {
            let mut state = self.shared.state.write().await;
            *state = NodeState::Started;
        }

        let ageout_handle = tokio::spawn(run_age_out_worker(
            self.table.clone(),
            self.shared.clone(),
            self.config.clone(),
        ));

        let poll_handle = tokio::spawn(run_poll_worker(
            self.source.clone(),
            self.table.clone(),
            self.bus.clone(),
            self.shared.clone(),
            self.config.clone(),
            self.hup_notify.clone(),
            self.metrics.clone(),
        ));

        self.workers = vec![ageout_handle, poll_handle];
    }

    async fn stop_workers(&mut self) {
        for handle in self.workers.drain(..) {
            handle.abort();
        }
        *self.shared.state.write().await = NodeState::Stopped;
    }
}

#[async_trait]
impl<S: FeedSource + 'static> crate::node::Node for PollerEngine<S> {
    fn configure(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), NodeError> {
        *self.shared.state.write().await = NodeState::Idle;
        Ok(())
    }

    async fn rebuild(&mut self) -> Result<(), NodeError> {
        *self.shared.rebuild.write().await = true;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), NodeError> {
        *self.shared.last_run.write().await = None;
        *self.shared.last_ageout_run.write().await = None;
        *self.shared.rebuild.write().await = false;
        let mut table = self.table.write().await;
        for (key, _) in table.query(Query::default()) {
            table.delete(&key);
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), NodeError> {
        self.start_workers().await;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        self.stop_workers().await;
        Ok(())
    }

    fn hup(&self, _source: &str) {
        self.hup_notify.notify_one();
    }

    fn length(&self, _source: &str) -> usize {
        self.table.try_read().map(|t| t.num_indicators()).unwrap_or(0)
    }

    fn mgmtbus_status(&self) -> crate::node::MgmtbusStatus {
        let state = self.shared.state.try_read().map(|s| *s).unwrap_or(NodeState::Error);
        let last_run = self.shared.last_run.try_read().map(|r| *r).unwrap_or(None);
        let length = self.length("");
        let statistics = self.shared.stats.try_read().map(|s| s.clone()).unwrap_or_default();
        crate::node::MgmtbusStatus { state, last_run, length, statistics }
    }

    async fn filtered_update(&mut self, _source: &str, indicator: &str, value: Value) -> Result<(), NodeError> {
        let now = now_ms();
        let in_feed_threshold = self.last_run().await.unwrap_or(now);
        let mut table = self.table.write().await;
        apply_observation(
            &mut *table,
            self.bus.as_ref(),
            &self.config,
            indicator,
            value,
            now,
            in_feed_threshold,
            self.metrics.as_deref(),
        )
        .await
    }

    async fn filtered_withdraw(&mut self, _source: &str, indicator: &str, _value: Option<Value>) -> Result<(), NodeError> {
        let now = now_ms();
        let mut table = self.table.write().await;
        if let Some(mut record) = table.get(indicator) {
            record.withdrawn = Some(now);
            table.put(indicator, record);
            self.bus.emit_withdraw(indicator).await;
        }
        Ok(())
    }

    fn get(&self, _source: &str, indicator: &str) -> Option<IndicatorRecord> {
        self.table.try_read().ok()?.get(indicator)
    }

    fn get_all(&self, _source: &str) -> Vec<(String, IndicatorRecord)> {
        let Ok(table) = self.table.try_read() else { return Vec::new() };
        table
            .query(Query { include_value: true, ..Default::default() })
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }

    fn get_range(&self, _source: &str, index: Index, query: Query) -> Vec<(String, Option<IndicatorRecord>)> {
        self.table.try_read().map(|t| t.query(Query { index: Some(index), ..query })).unwrap_or_default()
    }
}

async fn run_age_out_worker(table: Arc<RwLock<dyn IndicatorTable>>, shared: Arc<Shared>, config: Arc<PollerConfig>) {
    loop {
        {
            let state = shared.state.read().await;
            if *state != NodeState::Started {
                return;
            }
        }

        let now = now_ms();
        {
            let mut t = table.write().await;
            age_out_pass(&mut *t, now);
        }
        *shared.last_ageout_run.write().await = Some(now);

        tokio::time::sleep(config.age_out.interval).await;
    }
}

/// One age-out tick: withdraw every record whose deadline has passed.
fn age_out_pass(table: &mut dyn IndicatorTable, now: i64) {
    let due = table.query(Query {
        index: Some(Index::AgeOut),
        to_key: Some(now - 1),
        include_value: true,
        ..Default::default()
    });

    for (key, record) in due {
        let Some(mut record) = record else { continue };
        if record.withdrawn.is_some() {
            continue;
        }
        record.withdrawn = Some(now);
        table.put(&key, record);
    }
}

async fn run_poll_worker<S: FeedSource>(
    source: Arc<S>,
    table: Arc<RwLock<dyn IndicatorTable>>,
    bus: Arc<dyn Bus>,
    shared: Arc<Shared>,
    config: Arc<PollerConfig>,
    hup_notify: Arc<Notify>,
    metrics: Option<Arc<NodeMetrics>>,
) {
    // Wait for the age-out worker's first pass before polling.
    loop {
        if shared.last_ageout_run.read().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    loop {
        {
            let state = shared.state.read().await;
            if *state != NodeState::Started {
                return;
            }
        }

        let now = now_ms();
        let last_run = *shared.last_run.read().await;
        let rebuild = {
            let mut r = shared.rebuild.write().await;
            std::mem::replace(&mut *r, false)
        };

        let retry_policy = RetryPolicy { num_retries: config.num_retries };
        let mut retry_state = RetryState::new();
        if let Some(m) = &metrics {
            m.polls_total.inc();
        }
        loop {
            let result = {
                let mut t = table.write().await;
                run_poll_pass(source.as_ref(), &mut *t, bus.as_ref(), &config, now, last_run, rebuild, metrics.as_deref()).await
            };

            match result {
                Ok(()) => break,
                Err(err) if err.is_retryable() => {
                    *shared.stats.write().await.entry("error.polling".to_string()).or_insert(0) += 1;
                    if let Some(m) = &metrics {
                        m.poll_errors_total.inc();
                    }
                    emit_alert(AlertEvent::PollingError, &config.source_name, &err.to_string());
                    if !retry_state.record_failure(&retry_policy) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(retry_policy.backoff_delay_ms())).await;
                }
                Err(_) => break,
            }
        }

        *shared.last_run.write().await = Some(now);

        let interval_ms = config.interval.as_millis() as i64;
        let mut deltat = now + interval_ms - now_ms();
        while deltat < 0 {
            tracing::warn!(deltat, "polling pass overran its interval, scheduling next run immediately");
            deltat += interval_ms;
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(deltat.max(0) as u64)) => {}
            _ = hup_notify.notified() => {}
        }
    }
}

/// One polling pass: rebuild emission (if requested), classify-and-act over
/// the fetched feed items, sudden-death, garbage collection.
async fn run_poll_pass<S: FeedSource>(
    source: &S,
    table: &mut dyn IndicatorTable,
    bus: &dyn Bus,
    config: &PollerConfig,
    now: i64,
    last_run: Option<i64>,
    rebuild: bool,
    metrics: Option<&NodeMetrics>,
) -> Result<(), NodeError> {
    if rebuild {
        for (indicator, record) in table.query(Query { include_value: true, ..Default::default() }) {
            if let Some(record) = record {
                let value = serde_json::to_value(&record).map_err(|e| NodeError::Internal(e.to_string()))?;
                bus.emit_update(&indicator, value).await;
            }
        }
    }

    let in_feed_threshold = last_run.unwrap_or(now - config.interval.as_millis() as i64);

    let items = source.build_iterator(now).await?;
    for item in items {
        let pairs = match source.process_item(item) {
            Ok(pairs) => pairs,
            Err(NodeError::Parse(msg)) => {
                tracing::warn!(error = %msg, "skipping unparseable feed item");
                continue;
            }
            Err(NodeError::UnsupportedObservable(id)) => {
                tracing::warn!(indicator_id = %id, "skipping item with unsupported observable/TTP type");
                continue;
            }
            Err(other) => return Err(other),
        };

        for (indicator, observed) in pairs {
            apply_observation(table, bus, config, &indicator, observed, now, in_feed_threshold, metrics).await?;
        }
    }

    if config.age_out.sudden_death {
        if let Some(last_run) = last_run {
            let missed = table.query(Query {
                index: Some(Index::LastRun),
                to_key: Some(last_run),
                include_value: true,
                ..Default::default()
            });
            for (key, record) in missed {
                let Some(mut record) = record else { continue };
                record.age_out = last_run - 1;
                table.put(&key, record);
            }
        }
    }

    // Per the garbage-collection bound decision: evaluated against wall
    // clock at GC time, not the pass-start `lastrun`. Within one pass `now`
    // already is that wall clock.
    let garbage = table.query(Query {
        index: Some(Index::Withdrawn),
        to_key: Some(now - 1),
        include_value: false,
        ..Default::default()
    });
    for (key, _) in garbage {
        table.delete(&key);
    }

    Ok(())
}

async fn apply_observation(
    table: &mut dyn IndicatorTable,
    bus: &dyn Bus,
    config: &PollerConfig,
    indicator: &str,
    observed: Value,
    now: i64,
    in_feed_threshold: i64,
    metrics: Option<&NodeMetrics>,
) -> Result<(), NodeError> {
    let observed_attrs: Attributes = match observed {
        Value::Object(map) => map.into_iter().collect(),
        Value::Null => Attributes::new(),
        other => return Err(NodeError::Parse(format!("expected object attributes, got {other}"))),
    };

    let existing = table.get(indicator);
    let state = IndicatorState::classify(existing.as_ref(), now, in_feed_threshold);
    if let Some(m) = metrics {
        m.indicators_by_state.with_label_values(&[state.as_str()]).inc();
    }

    match state.poll_action() {
        PollAction::TreatAsFresh => {
            let mut attributes = config.attributes_template.clone();
            attributes.extend(observed_attrs);
            let mut record = IndicatorRecord {
                sources: vec![config.source_name.clone()],
                first_seen: now,
                last_seen: now,
                last_run: now,
                age_out: 0,
                withdrawn: None,
                attributes,
            };
            record.age_out = config.age_out.evaluate(&record);
            let value = serde_json::to_value(&record).map_err(|e| NodeError::Internal(e.to_string()))?;
            table.put(indicator, record);
            bus.emit_update(indicator, value).await;
            if let Some(m) = metrics {
                m.updates_emitted_total.inc();
            }
        }
        PollAction::MergeAndMaybeEmit => {
            let mut record = existing.ok_or_else(|| NodeError::Internal("DF state with no record".to_string()))?;
            let changed = observed_attrs.iter().any(|(k, v)| record.attributes.get(k) != Some(v));
            record.last_run = now;
            record.attributes.extend(observed_attrs);
            record.age_out = config.age_out.evaluate(&record);
            let value = serde_json::to_value(&record).map_err(|e| NodeError::Internal(e.to_string()))?;
            table.put(indicator, record);
            if changed {
                bus.emit_update(indicator, value).await;
                if let Some(m) = metrics {
                    m.updates_emitted_total.inc();
                }
            }
        }
        PollAction::RefreshLastRunOnly => {
            let mut record = existing.ok_or_else(|| NodeError::Internal("DFA state with no record".to_string()))?;
            record.last_run = now;
            table.put(indicator, record);
        }
        PollAction::RefreshLastRunAndWithdrawn => {
            let mut record = existing.ok_or_else(|| NodeError::Internal("DFW/DFAW state with no record".to_string()))?;
            record.last_run = now;
            record.withdrawn = Some(now);
            table.put(indicator, record);
        }
    }

    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
