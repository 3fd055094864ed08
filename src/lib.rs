//! threatmesh: a polling threat-intelligence flow node.
//!
//! Indicators of compromise are pulled from periodically-polled external
//! feeds, normalized against per-indicator age-out policies, and optionally
//! aggregated into minimal IPv4 ranges across overlapping sources. A node is
//! one vertex in a larger directed graph of processors; this crate covers
//! the node's internals — the inter-node bus, the persistent table/interval
//! backing stores, and the harness that wires nodes together are narrow
//! external interfaces (see [`node`]) with in-process reference
//! implementations provided for standalone operation.

pub mod age_out;
pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod error;
pub mod interval;
pub mod monitor;
pub mod node;
pub mod poller;
pub mod record;
pub mod table;
pub mod taxii;
