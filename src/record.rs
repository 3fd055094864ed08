//! Indicator and aggregator record types.
//!
//! Feed payloads mix "reserved" keys (prefixed `_`) with free-form per-feed
//! attributes in the same map. Here that is split into explicit fields for
//! the reserved timestamps/deadlines plus an opaque `attributes` map for
//! everything else.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Absolute millisecond deadline meaning "never age out" (`2^32-1` seconds).
pub const MAX_AGE_OUT: i64 = ((1u64 << 32) - 1) as i64 * 1000;

/// Arbitrary pass-through feed attributes, keyed by attribute name.
pub type Attributes = BTreeMap<String, Value>;

/// A single indicator record as stored in an [`crate::table::IndicatorTable`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub sources: Vec<String>,
    pub first_seen: i64,
    pub last_seen: i64,
    pub last_run: i64,
    pub age_out: i64,
    pub withdrawn: Option<i64>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl IndicatorRecord {
    /// The `type` attribute, if present and a string.
    pub fn indicator_type(&self) -> Option<&str> {
        self.attributes.get("type").and_then(Value::as_str)
    }

    /// Value of a reserved timestamp base (`first_seen` or `last_seen`) used
    /// by age-out expressions.
    pub fn base_timestamp(&self, base: AgeOutBase) -> i64 {
        match base {
            AgeOutBase::FirstSeen => self.first_seen,
            AgeOutBase::LastSeen => self.last_seen,
        }
    }
}

/// Base timestamp an age-out expression is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeOutBase {
    FirstSeen,
    LastSeen,
}

/// Aggregator record, keyed by `indicator_string + source_id`. Carries
/// a stable 16-byte id assigned on first insert and the latest attributes
/// observed from that (indicator, source) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorRecord {
    pub id: [u8; 16],
    pub added: i64,
    pub updated: i64,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Policy for combining a reserved attribute across multiple contributing
/// aggregator records, keyed by attribute name (e.g. `sources` -> set-union,
/// `confidence` -> max).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combiner {
    SetUnion,
    Max,
}

impl Combiner {
    pub fn combine(&self, acc: &Value, next: &Value) -> Value {
        match self {
            Combiner::SetUnion => {
                let mut set: BTreeSet<String> = acc
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
                    .unwrap_or_default();
                if let Some(arr) = next.as_array() {
                    set.extend(arr.iter().filter_map(|v| v.as_str().map(str::to_owned)));
                } else if let Some(s) = next.as_str() {
                    set.insert(s.to_owned());
                }
                Value::Array(set.into_iter().map(Value::String).collect())
            }
            Combiner::Max => {
                let a = acc.as_f64().unwrap_or(f64::MIN);
                let b = next.as_f64().unwrap_or(f64::MIN);
                if b > a { next.clone() } else { acc.clone() }
            }
        }
    }
}

/// The reserved-attribute combiner table. Attributes not listed here simply
/// overwrite on merge (latest write wins) — see the open-question decision
/// in DESIGN.md about why historical non-reserved attributes are not
/// preserved.
pub fn reserved_combiner(key: &str) -> Option<Combiner> {
    match key {
        "sources" => Some(Combiner::SetUnion),
        "confidence" => Some(Combiner::Max),
        _ => None,
    }
}

/// Merge a set of aggregator records' attributes into the value reported for
/// their combined range. The starting accumulator always has `sources = []`.
pub fn merge_attributes<'a>(records: impl IntoIterator<Item = &'a AggregatorRecord>) -> Attributes {
    let mut merged: Attributes = Attributes::new();
    merged.insert("sources".to_string(), Value::Array(Vec::new()));

    for record in records {
        for (k, v) in &record.attributes {
            match reserved_combiner(k) {
                Some(combiner) => {
                    let acc = merged.entry(k.clone()).or_insert_with(|| Value::Array(Vec::new()));
                    *acc = combiner.combine(acc, v);
                }
                None => {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
    }

    merged
}
