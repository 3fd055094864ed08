//! End-to-end `RangeAggregator` tests, driven through the public `Node`
//! trait: overlapping-source union and whitelist hole-punching.

use std::sync::Arc;

use serde_json::json;

use threatmesh::aggregator::{RangeAggregator, RangeAggregatorConfig};
use threatmesh::interval::InMemoryIntervalStore;
use threatmesh::node::{Node, RecordingBus};

fn aggregator(whitelists: &[&str], bus: Arc<RecordingBus>) -> RangeAggregator {
    RangeAggregator::new(
        RangeAggregatorConfig { whitelists: whitelists.iter().map(|s| s.to_string()).collect() },
        bus,
        Box::new(InMemoryIntervalStore::new()),
    )
}

#[tokio::test]
async fn two_overlapping_sources_union_into_disjoint_ranges_with_merged_sources() {
    let bus = Arc::new(RecordingBus::new());
    let mut agg = aggregator(&[], bus.clone());
    agg.configure().unwrap();
    agg.initialize().await.unwrap();
    agg.start().await.unwrap();

    agg.filtered_update("feedA", "10.0.0.0/24", json!({"type": "IPv4", "confidence": 40})).await.unwrap();
    agg.filtered_update("feedB", "10.0.0.128-10.0.0.191", json!({"type": "IPv4", "confidence": 90})).await.unwrap();

    let updates = bus.updates.lock().unwrap();
    assert!(updates.len() >= 2);
    // The overlap sub-range should have been (re-)emitted with both feeds
    // in its merged `sources`, and the max confidence of the two.
    let overlap_update = updates.iter().rev().find(|(indicator, _)| indicator == "10.0.0.128-10.0.0.191");
    let (_, value) = overlap_update.expect("expected an update for the overlap sub-range");
    let mut sources: Vec<_> = value["sources"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
    sources.sort();
    assert_eq!(sources, vec!["feedA", "feedB"]);
    assert_eq!(value["confidence"], json!(90));
}

#[tokio::test]
async fn withdrawing_one_source_shrinks_the_union_back_to_its_own_range() {
    let bus = Arc::new(RecordingBus::new());
    let mut agg = aggregator(&[], bus.clone());
    agg.configure().unwrap();
    agg.initialize().await.unwrap();
    agg.start().await.unwrap();

    agg.filtered_update("feedA", "10.0.0.0/24", json!({"type": "IPv4"})).await.unwrap();
    agg.filtered_update("feedB", "10.0.0.128-10.0.0.191", json!({"type": "IPv4"})).await.unwrap();
    agg.filtered_withdraw("feedB", "10.0.0.128-10.0.0.191", None).await.unwrap();

    assert_eq!(agg.length(""), 1);
}

#[tokio::test]
async fn whitelisted_source_punches_a_hole_in_the_aggregated_output() {
    use threatmesh::aggregator::range::parse_ipv4_range;

    let bus = Arc::new(RecordingBus::new());
    let mut agg = aggregator(&["WL"], bus.clone());
    agg.configure().unwrap();
    agg.initialize().await.unwrap();
    agg.start().await.unwrap();

    agg.filtered_update("feedA", "0.0.0.0/0", json!({"type": "IPv4"})).await.unwrap();
    agg.filtered_update("WL", "192.168.0.0/16", json!({"type": "IPv4"})).await.unwrap();

    // Replay updates/withdraws in emission order to reconstruct the set of
    // ranges currently live on the bus, keyed by indicator string.
    let updates = bus.updates.lock().unwrap().clone();
    let withdraws = bus.withdraws.lock().unwrap().clone();
    let mut live: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for (indicator, _) in &updates {
        live.insert(indicator.clone());
    }
    for indicator in &withdraws {
        live.remove(indicator);
    }

    let (wl_start, wl_end) = parse_ipv4_range("192.168.0.0/16").unwrap();
    for indicator in &live {
        let (start, end) = parse_ipv4_range(indicator).unwrap();
        let overlaps = start <= wl_end && wl_start <= end;
        assert!(!overlaps, "live range {indicator} unexpectedly overlaps the whitelisted block");
    }
}

#[tokio::test]
async fn non_ipv4_contribution_is_rejected_and_never_reaches_the_store() {
    let bus = Arc::new(RecordingBus::new());
    let mut agg = aggregator(&[], bus.clone());
    agg.configure().unwrap();
    agg.initialize().await.unwrap();
    agg.start().await.unwrap();

    agg.filtered_update("feedA", "example.com", json!({"type": "domain"})).await.unwrap();
    assert_eq!(agg.length(""), 0);
    assert!(bus.updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reset_clears_all_contributions() {
    let bus = Arc::new(RecordingBus::new());
    let mut agg = aggregator(&[], bus);
    agg.configure().unwrap();
    agg.initialize().await.unwrap();
    agg.start().await.unwrap();

    agg.filtered_update("feedA", "10.0.0.0/24", json!({"type": "IPv4"})).await.unwrap();
    assert_eq!(agg.length(""), 1);

    agg.reset().await.unwrap();
    assert_eq!(agg.length(""), 0);
}
