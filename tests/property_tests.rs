//! Property-based tests for invariants that unit tests only sample.
//!
//! - `calc_ipranges` produces a disjoint, ascending cover whose per-point id
//!   set matches a brute-force scan over the same intervals.
//! - `merge_attributes`'s reserved combiners are idempotent and order-independent
//!   for the `sources` / `confidence` keys.

use std::collections::BTreeSet;

use proptest::prelude::*;
use serde_json::json;
use threatmesh::aggregator::range::calc_ipranges;
use threatmesh::interval::{InMemoryIntervalStore, IntervalStore};
use threatmesh::record::{merge_attributes, AggregatorRecord, Attributes};

fn id_for(n: u8) -> [u8; 16] {
    let mut id = [0u8; 16];
    id[15] = n;
    id
}

/// Up to 5 (start, end) intervals within a small address space, each tagged
/// by its index as id.
fn arb_intervals() -> impl Strategy<Value = Vec<(u32, u32)>> {
    prop::collection::vec((0u32..200, 0u32..200), 0..5)
        .prop_map(|mut v| {
            for (s, e) in v.iter_mut() {
                if s > e {
                    std::mem::swap(s, e);
                }
            }
            v
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn calc_ipranges_matches_brute_force_cover(intervals in arb_intervals()) {
        let mut store = InMemoryIntervalStore::new();
        for (i, (s, e)) in intervals.iter().enumerate() {
            store.put(id_for(i as u8), *s, *e, 1);
        }

        let ranges = calc_ipranges(&store, 0, 199);

        // Ranges are disjoint and strictly ascending.
        for w in ranges.windows(2) {
            prop_assert!(w[0].end < w[1].start);
        }
        for r in &ranges {
            prop_assert!(r.start <= r.end);
        }

        // Every point either falls in exactly one range (with the right id
        // set) or in none (meaning no interval covers it).
        for point in 0u32..200 {
            let expected: BTreeSet<[u8; 16]> = intervals
                .iter()
                .enumerate()
                .filter(|(_, (s, e))| *s <= point && point <= *e)
                .map(|(i, _)| id_for(i as u8))
                .collect();

            let found = ranges.iter().find(|r| r.start <= point && point <= r.end);
            match found {
                Some(r) => prop_assert_eq!(&r.ids, &expected),
                None => prop_assert!(expected.is_empty()),
            }
        }
    }

    #[test]
    fn calc_ipranges_is_idempotent_on_repeated_query(intervals in arb_intervals()) {
        let mut store = InMemoryIntervalStore::new();
        for (i, (s, e)) in intervals.iter().enumerate() {
            store.put(id_for(i as u8), *s, *e, 1);
        }

        let first = calc_ipranges(&store, 0, 199);
        let second = calc_ipranges(&store, 0, 199);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn merge_attributes_confidence_is_never_below_any_input(a in 0i64..100, b in 0i64..100) {
        let r1 = AggregatorRecord {
            id: id_for(1),
            added: 0,
            updated: 0,
            attributes: Attributes::from([("confidence".to_string(), json!(a))]),
        };
        let r2 = AggregatorRecord {
            id: id_for(2),
            added: 0,
            updated: 0,
            attributes: Attributes::from([("confidence".to_string(), json!(b))]),
        };

        let merged = merge_attributes([&r1, &r2]);
        let merged_confidence = merged["confidence"].as_i64().unwrap();
        prop_assert!(merged_confidence >= a && merged_confidence >= b);
    }

    #[test]
    fn merge_attributes_sources_union_is_order_independent(
        s1 in "[a-z]{1,4}", s2 in "[a-z]{1,4}"
    ) {
        let r1 = AggregatorRecord {
            id: id_for(1),
            added: 0,
            updated: 0,
            attributes: Attributes::from([("sources".to_string(), json!([s1.clone()]))]),
        };
        let r2 = AggregatorRecord {
            id: id_for(2),
            added: 0,
            updated: 0,
            attributes: Attributes::from([("sources".to_string(), json!([s2.clone()]))]),
        };

        let forward = merge_attributes([&r1, &r2]);
        let backward = merge_attributes([&r2, &r1]);

        let mut fwd: Vec<_> = forward["sources"].as_array().unwrap().iter().map(|v| v.as_str().unwrap().to_string()).collect();
        let mut bwd: Vec<_> = backward["sources"].as_array().unwrap().iter().map(|v| v.as_str().unwrap().to_string()).collect();
        fwd.sort();
        bwd.sort();
        prop_assert_eq!(fwd, bwd);
    }
}
