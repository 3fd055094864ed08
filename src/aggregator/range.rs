//! IPv4 range parsing and the `calc_ipranges` sweep-line diff.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::NodeError;
use crate::interval::{IntervalStore, MAX_LEVEL};

/// A maximal contiguous range with a constant id-set, as produced by
/// [`calc_ipranges`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedRange {
    pub start: u32,
    pub end: u32,
    pub ids: BTreeSet<[u8; 16]>,
}

/// Parse `"a.b.c.d"`, `"a.b.c.d/n"`, or `"a.b.c.d-e.f.g.h"` into inclusive
/// `[start, end]` endpoints.
pub fn parse_ipv4_range(indicator: &str) -> Result<(u32, u32), NodeError> {
    if let Some((addr, prefix)) = indicator.split_once('/') {
        let base = parse_addr(addr)?;
        let prefix: u32 = prefix
            .parse()
            .map_err(|_| NodeError::Parse(format!("invalid CIDR prefix in {indicator:?}")))?;
        if prefix > 32 {
            return Err(NodeError::Parse(format!("invalid CIDR prefix in {indicator:?}")));
        }
        let host_bits = 32 - prefix;
        let mask = if host_bits == 32 { 0 } else { !0u32 << host_bits };
        let start = base & mask;
        let end = start | !mask;
        return Ok((start, end));
    }

    if let Some((lo, hi)) = indicator.split_once('-') {
        let start = parse_addr(lo)?;
        let end = parse_addr(hi)?;
        if start > end {
            return Err(NodeError::Parse(format!("descending range in {indicator:?}")));
        }
        return Ok((start, end));
    }

    let addr = parse_addr(indicator)?;
    Ok((addr, addr))
}

fn parse_addr(s: &str) -> Result<u32, NodeError> {
    s.trim()
        .parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| NodeError::Parse(format!("invalid IPv4 address {s:?}")))
}

/// Render `[start, end]` as the wire indicator string, always in range form.
pub fn format_range(start: u32, end: u32) -> String {
    format!("{}-{}", Ipv4Addr::from(start), Ipv4Addr::from(end))
}

/// Walk endpoints in `[lo, hi]`, emitting maximal ranges of constant
/// id-set, with whitelist (level `MAX_LEVEL`) intervals punching holes in
/// the output.
///
/// `live` tracks the level each currently-spanning id was inserted with, so
/// the whitelist gate reflects the level of the *span being emitted*
/// (`oep..p-1` or `oep..p`) rather than of whatever else happens to touch
/// the boundary point `p` — the two differ exactly at a whitelist's edges,
/// and only the former reproduces the documented hole-punching behavior.
pub fn calc_ipranges(store: &dyn IntervalStore, lo: u32, hi: u32) -> Vec<AggregatedRange> {
    use std::collections::BTreeMap;

    let mut ranges = Vec::new();
    if lo > hi {
        return ranges;
    }

    let endpoints = store.query_endpoints(lo, hi, false, true);
    let mut live: BTreeMap<[u8; 16], u32> = BTreeMap::new();
    let mut oep = lo;
    let mut first = true;

    for p in endpoints {
        let covering = store.cover(p);
        let start_entries: Vec<_> = covering.iter().filter(|e| e.start == p).collect();
        let end_ids: BTreeSet<[u8; 16]> = covering.iter().filter(|e| e.end == p).map(|e| e.id).collect();

        if first {
            for e in &covering {
                if e.start != p && e.end != p {
                    live.insert(e.id, e.level);
                }
            }
            first = false;
        }

        if !start_entries.is_empty() {
            let level_before = live.values().copied().max().unwrap_or(0);
            if oep != p && !live.is_empty() && level_before < MAX_LEVEL {
                ranges.push(AggregatedRange { start: oep, end: p - 1, ids: live.keys().copied().collect() });
            }
            oep = p;
            for e in &start_entries {
                live.insert(e.id, e.level);
            }
        }

        if !end_ids.is_empty() {
            let level_now = live.values().copied().max().unwrap_or(0);
            if !live.is_empty() && level_now < MAX_LEVEL {
                ranges.push(AggregatedRange { start: oep, end: p, ids: live.keys().copied().collect() });
            }
            oep = p.saturating_add(1);
            for id in &end_ids {
                live.remove(id);
            }
        }
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::InMemoryIntervalStore;

    #[test]
    fn parses_single_address() {
        let (start, end) = parse_ipv4_range("10.0.0.5").unwrap();
        assert_eq!(start, end);
        assert_eq!(format_range(start, end), "10.0.0.5-10.0.0.5");
    }

    #[test]
    fn parses_cidr() {
        let (start, end) = parse_ipv4_range("10.0.0.0/24").unwrap();
        assert_eq!(format_range(start, end), "10.0.0.0-10.0.0.255");
    }

    #[test]
    fn parses_hyphenated_range() {
        let (start, end) = parse_ipv4_range("10.0.0.128-10.0.0.191").unwrap();
        assert_eq!(format_range(start, end), "10.0.0.128-10.0.0.191");
    }

    #[test]
    fn rejects_descending_range() {
        assert!(parse_ipv4_range("10.0.0.10-10.0.0.1").is_err());
    }

    #[test]
    fn union_of_overlapping_ranges_splits_into_three() {
        let mut store = InMemoryIntervalStore::new();
        let (s1, e1) = parse_ipv4_range("10.0.0.0/24").unwrap();
        let (s2, e2) = parse_ipv4_range("10.0.0.128-10.0.0.191").unwrap();
        store.put([1; 16], s1, e1, 1);
        store.put([2; 16], s2, e2, 1);

        let ranges = calc_ipranges(&store, 0, u32::MAX);
        assert_eq!(ranges.len(), 3);
        assert_eq!((ranges[0].start, ranges[0].end), (s1, s2 - 1));
        assert_eq!(ranges[0].ids, BTreeSet::from([[1; 16]]));
        assert_eq!((ranges[1].start, ranges[1].end), (s2, e2));
        assert_eq!(ranges[1].ids, BTreeSet::from([[1; 16], [2; 16]]));
        assert_eq!((ranges[2].start, ranges[2].end), (e2 + 1, e1));
        assert_eq!(ranges[2].ids, BTreeSet::from([[1; 16]]));
    }

    #[test]
    fn whitelist_interval_punches_a_hole() {
        let mut store = InMemoryIntervalStore::new();
        let (s1, e1) = parse_ipv4_range("0.0.0.0/0").unwrap();
        let (s2, e2) = parse_ipv4_range("192.168.0.0/16").unwrap();
        store.put([1; 16], s1, e1, 1);
        store.put([2; 16], s2, e2, MAX_LEVEL);

        let ranges = calc_ipranges(&store, 0, u32::MAX);
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].start, ranges[0].end), (s1, s2 - 1));
        assert_eq!((ranges[1].start, ranges[1].end), (e2 + 1, e1));
        for r in &ranges {
            assert_eq!(r.ids, BTreeSet::from([[1; 16]]));
        }
    }
}
