//! The `IndicatorTable` interface and a reference in-memory
//! implementation.
//!
//! A real deployment backs this with an on-disk indexed store; that store
//! is an external collaborator and out of scope here. This module provides
//! the trait the poller consumes plus an in-process implementation: typed
//! accessors over a keyed store, with named secondary indexes instead of
//! SQL indexes.

use std::collections::BTreeMap;

use crate::record::IndicatorRecord;

/// Which secondary index to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    AgeOut,
    Withdrawn,
    LastRun,
}

/// A range-scan query against a table index.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub index: Option<Index>,
    /// Inclusive lower bound on the index key.
    pub from_key: Option<i64>,
    /// Inclusive upper bound on the index key.
    pub to_key: Option<i64>,
    pub include_value: bool,
}

/// Keyed store of indicators with secondary indexes on age-out,
/// withdrawn-at, and last-run timestamps.
pub trait IndicatorTable: Send {
    fn get(&self, key: &str) -> Option<IndicatorRecord>;
    fn put(&mut self, key: &str, record: IndicatorRecord);
    fn delete(&mut self, key: &str);
    /// Range-scan by the given query, returning (key, Option<record>) pairs
    /// ordered by the scanned index's key. `include_value` controls whether
    /// the record is attached or omitted (a pure key scan).
    fn query(&self, query: Query) -> Vec<(String, Option<IndicatorRecord>)>;
    fn num_indicators(&self) -> usize;
}

/// Reference in-memory `IndicatorTable`. Indexes are maintained as sorted
/// `BTreeMap<i64, BTreeSet<String>>` keyed by the indexed timestamp, mirroring
/// the shape of a real range-scannable secondary index without requiring a
/// backing database.
#[derive(Debug, Default)]
pub struct InMemoryIndicatorTable {
    records: BTreeMap<String, IndicatorRecord>,
}

impl InMemoryIndicatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_key(record: &IndicatorRecord, index: Index) -> i64 {
        match index {
            Index::AgeOut => record.age_out,
            Index::Withdrawn => record.withdrawn.unwrap_or(i64::MAX),
            Index::LastRun => record.last_run,
        }
    }
}

impl IndicatorTable for InMemoryIndicatorTable {
    fn get(&self, key: &str) -> Option<IndicatorRecord> {
        self.records.get(key).cloned()
    }

    fn put(&mut self, key: &str, record: IndicatorRecord) {
        self.records.insert(key.to_string(), record);
    }

    fn delete(&mut self, key: &str) {
        self.records.remove(key);
    }

    fn query(&self, query: Query) -> Vec<(String, Option<IndicatorRecord>)> {
        let mut matches: Vec<(String, &IndicatorRecord)> = self
            .records
            .iter()
            .filter(|(_, record)| {
                let Some(index) = query.index else { return true };
                if index == Index::Withdrawn && record.withdrawn.is_none() {
                    return false;
                }
                let k = Self::index_key(record, index);
                query.from_key.is_none_or(|from| k >= from) && query.to_key.is_none_or(|to| k <= to)
            })
            .map(|(k, v)| (k.clone(), v))
            .collect();

        if let Some(index) = query.index {
            matches.sort_by_key(|(_, record)| Self::index_key(record, index));
        }

        matches
            .into_iter()
            .map(|(k, v)| (k, query.include_value.then(|| v.clone())))
            .collect()
    }

    fn num_indicators(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Attributes;

    fn rec(age_out: i64, last_run: i64, withdrawn: Option<i64>) -> IndicatorRecord {
        IndicatorRecord {
            sources: vec!["s1".into()],
            first_seen: 0,
            last_seen: 0,
            last_run,
            age_out,
            withdrawn,
            attributes: Attributes::new(),
        }
    }

    #[test]
    fn age_out_index_scans_in_order_and_respects_bound() {
        let mut t = InMemoryIndicatorTable::new();
        t.put("a", rec(100, 0, None));
        t.put("b", rec(50, 0, None));
        t.put("c", rec(200, 0, None));

        let results = t.query(Query {
            index: Some(Index::AgeOut),
            to_key: Some(100),
            include_value: false,
            ..Default::default()
        });
        let keys: Vec<_> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn withdrawn_index_only_matches_set_records() {
        let mut t = InMemoryIndicatorTable::new();
        t.put("a", rec(0, 0, Some(10)));
        t.put("b", rec(0, 0, None));

        let results = t.query(Query {
            index: Some(Index::Withdrawn),
            to_key: Some(100),
            include_value: false,
            ..Default::default()
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn delete_removes_from_all_indexes() {
        let mut t = InMemoryIndicatorTable::new();
        t.put("a", rec(0, 0, Some(10)));
        t.delete("a");
        assert_eq!(t.num_indicators(), 0);
        assert!(t.get("a").is_none());
    }
}
