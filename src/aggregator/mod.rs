//! `RangeAggregator`: merges IPv4 indicators from multiple overlapping
//! sources into a minimal set of maximal contiguous ranges, each annotated
//! with the union of contributing source ids, excluding whitelisted regions.

pub mod range;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::NodeError;
use crate::interval::{IntervalStore, MAX_LEVEL};
use crate::monitor::{emit_alert, AlertEvent, NodeMetrics};
use crate::node::{Bus, MgmtbusStatus, Node, NodeState};
use crate::record::{merge_attributes, AggregatorRecord, Attributes};
use crate::table::{Index, Query};
use range::{calc_ipranges, format_range, parse_ipv4_range, AggregatedRange};

/// Aggregator-specific configuration: which upstream sources'
/// contributions are whitelist (hole-punching) rather than ordinary.
#[derive(Debug, Clone, Default)]
pub struct RangeAggregatorConfig {
    pub whitelists: BTreeSet<String>,
}

/// A tracked contribution: the interval it occupies plus the aggregator
/// record carrying its attributes.
struct Entry {
    start: u32,
    end: u32,
    level: u32,
    record: AggregatorRecord,
}

/// The aggregator node. Owns the interval store and the per-(indicator,
/// source) aggregator records; emits through a [`Bus`].
pub struct RangeAggregator {
    config: RangeAggregatorConfig,
    bus: Arc<dyn Bus>,
    interval_store: Box<dyn IntervalStore + Send + Sync>,
    entries: BTreeMap<(String, String), Entry>,
    id_to_key: BTreeMap<[u8; 16], (String, String)>,
    state: NodeState,
    metrics: Option<Arc<NodeMetrics>>,
}

impl RangeAggregator {
    pub fn new(
        config: RangeAggregatorConfig,
        bus: Arc<dyn Bus>,
        interval_store: Box<dyn IntervalStore + Send + Sync>,
    ) -> Self {
        RangeAggregator {
            config,
            bus,
            interval_store,
            entries: BTreeMap::new(),
            id_to_key: BTreeMap::new(),
            state: NodeState::Init,
            metrics: None,
        }
    }

    /// Attach the Prometheus/alert surface `filtered_update`/`filtered_withdraw`
    /// report through. Opt-in, like `PollerEngine::with_metrics`.
    pub fn with_metrics(mut self, metrics: Arc<NodeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn search_window(&self, start: u32, end: u32) -> (u32, u32) {
        let rangestart = self
            .interval_store
            .query_endpoints(0, start.saturating_sub(1), true, true)
            .first()
            .copied()
            .unwrap_or(0);
        let rangestop = self
            .interval_store
            .query_endpoints(end.saturating_add(1), self.interval_store.max_endpoint(), false, true)
            .first()
            .copied()
            .unwrap_or_else(|| self.interval_store.max_endpoint());
        (rangestart, rangestop)
    }

    fn merged_value(&self, range: &AggregatedRange) -> Value {
        let records: Vec<&AggregatorRecord> = range
            .ids
            .iter()
            .filter_map(|id| self.id_to_key.get(id))
            .filter_map(|key| self.entries.get(key))
            .map(|entry| &entry.record)
            .collect();
        let attributes = merge_attributes(records);
        let mut value = serde_json::to_value(attributes).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.insert("type".to_string(), Value::String("IPv4".to_string()));
        }
        value
    }

    async fn emit_diff(&self, before: &[AggregatedRange], after: &[AggregatedRange]) {
        let before_set: BTreeSet<(u32, u32)> = before.iter().map(|r| (r.start, r.end)).collect();
        let after_set: BTreeSet<(u32, u32)> = after.iter().map(|r| (r.start, r.end)).collect();

        for range in before {
            if !after_set.contains(&(range.start, range.end)) {
                let indicator = format_range(range.start, range.end);
                self.bus.emit_withdraw(&indicator).await;
                if let Some(m) = &self.metrics {
                    m.withdraws_emitted_total.inc();
                }
                emit_alert(AlertEvent::AggregatorRangeChanged, "aggregator", &indicator);
            }
        }

        for range in after {
            let changed = match before.iter().find(|r| r.start == range.start && r.end == range.end) {
                None => true,
                Some(prior) => prior.ids != range.ids,
            };
            if changed || !before_set.contains(&(range.start, range.end)) {
                let indicator = format_range(range.start, range.end);
                let value = self.merged_value(range);
                self.bus.emit_update(&indicator, value).await;
                if let Some(m) = &self.metrics {
                    m.updates_emitted_total.inc();
                }
                emit_alert(AlertEvent::AggregatorRangeChanged, "aggregator", &indicator);
            }
        }
    }

    /// Insert or refresh an IPv4 contribution from `source`.
    pub async fn filtered_update(&mut self, source: &str, indicator: &str, value: Value) -> Result<(), NodeError> {
        let ty = value.get("type").and_then(Value::as_str);
        if ty != Some("IPv4") {
            return Ok(());
        }

        let (start, end) = parse_ipv4_range(indicator)?;
        let level = if self.config.whitelists.contains(source) { MAX_LEVEL } else { 1 };
        let key = (indicator.to_string(), source.to_string());
        let is_update = self.entries.contains_key(&key);

        let (rangestart, rangestop) = self.search_window(start, end);
        let before = calc_ipranges(self.interval_store.as_ref(), rangestart, rangestop);

        if let Some(old) = self.entries.get(&key) {
            let old_id = old.record.id;
            self.interval_store.delete(old_id, old.start, old.end, old.level);
        }

        if is_update && level != MAX_LEVEL {
            for range in &before {
                let v = self.merged_value(range);
                self.bus.emit_update(&format_range(range.start, range.end), v).await;
            }
        }

        let id = self
            .entries
            .get(&key)
            .map(|e| e.record.id)
            .unwrap_or_else(|| *Uuid::new_v4().as_bytes());

        let attributes: Attributes = match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => Attributes::new(),
        };

        let now = now_ms();
        let added = self.entries.get(&key).map(|e| e.record.added).unwrap_or(now);
        self.entries.insert(
            key.clone(),
            Entry { start, end, level, record: AggregatorRecord { id, added, updated: now, attributes } },
        );
        self.id_to_key.insert(id, key);

        self.interval_store.put(id, start, end, level);
        let after = calc_ipranges(self.interval_store.as_ref(), rangestart, rangestop);

        self.emit_diff(&before, &after).await;
        Ok(())
    }

    /// Remove a previously-inserted contribution. Unknown
    /// `(indicator, source)` pairs are silently ignored.
    pub async fn filtered_withdraw(&mut self, source: &str, indicator: &str) -> Result<(), NodeError> {
        let key = (indicator.to_string(), source.to_string());
        let Some(entry) = self.entries.remove(&key) else { return Ok(()) };
        self.id_to_key.remove(&entry.record.id);

        let (rangestart, rangestop) = self.search_window(entry.start, entry.end);
        let before = calc_ipranges(self.interval_store.as_ref(), rangestart, rangestop);

        self.interval_store.delete(entry.record.id, entry.start, entry.end, entry.level);

        let after = calc_ipranges(self.interval_store.as_ref(), rangestart, rangestop);
        self.emit_diff(&before, &after).await;
        Ok(())
    }

    pub fn num_contributions(&self) -> usize {
        self.entries.len()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl Node for RangeAggregator {
    fn configure(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    async fn initialize(&mut self) -> Result<(), NodeError> {
        self.state = NodeState::Idle;
        Ok(())
    }

    async fn rebuild(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), NodeError> {
        for entry in self.entries.values() {
            self.interval_store.delete(entry.record.id, entry.start, entry.end, entry.level);
        }
        self.entries.clear();
        self.id_to_key.clear();
        Ok(())
    }

    async fn start(&mut self) -> Result<(), NodeError> {
        self.state = NodeState::Started;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), NodeError> {
        self.state = NodeState::Stopped;
        Ok(())
    }

    fn hup(&self, _source: &str) {}

    fn length(&self, _source: &str) -> usize {
        self.entries.len()
    }

    fn mgmtbus_status(&self) -> MgmtbusStatus {
        MgmtbusStatus { state: self.state, last_run: None, length: self.entries.len(), statistics: BTreeMap::new() }
    }

    async fn filtered_update(&mut self, source: &str, indicator: &str, value: Value) -> Result<(), NodeError> {
        RangeAggregator::filtered_update(self, source, indicator, value).await
    }

    async fn filtered_withdraw(&mut self, source: &str, indicator: &str, _value: Option<Value>) -> Result<(), NodeError> {
        RangeAggregator::filtered_withdraw(self, source, indicator).await
    }

    fn get(&self, source: &str, indicator: &str) -> Option<crate::record::IndicatorRecord> {
        let entry = self.entries.get(&(indicator.to_string(), source.to_string()))?;
        Some(crate::record::IndicatorRecord {
            sources: vec![source.to_string()],
            first_seen: entry.record.added,
            last_seen: entry.record.updated,
            last_run: entry.record.updated,
            age_out: i64::MAX,
            withdrawn: None,
            attributes: entry.record.attributes.clone(),
        })
    }

    fn get_all(&self, source: &str) -> Vec<(String, crate::record::IndicatorRecord)> {
        self.entries
            .keys()
            .filter(|(_, s)| s == source)
            .filter_map(|(indicator, _)| self.get(source, indicator).map(|r| (indicator.clone(), r)))
            .collect()
    }

    fn get_range(&self, _source: &str, _index: Index, _query: Query) -> Vec<(String, Option<crate::record::IndicatorRecord>)> {
        Vec::new()
    }
}

// RwLock re-export kept for callers wiring this node alongside a PollerEngine
// behind a shared Arc<RwLock<dyn Node>>.
pub type SharedAggregator = Arc<RwLock<RangeAggregator>>;
