//! Typed, `serde`-deserializable configuration loaded from YAML on disk —
//! standalone, file-based config in place of a database-backed GUC registry.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::age_out::AgeOutPolicy;
use crate::error::NodeError;
use crate::poller::PollerConfig;
use crate::record::Attributes;
use crate::taxii::{ConfidenceMap, Credentials, PullDriverConfig};

/// `age_out` config block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgeOutConfig {
    #[serde(default = "default_age_out_interval")]
    pub interval: u64,
    #[serde(default)]
    pub sudden_death: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(flatten)]
    pub by_type: BTreeMap<String, String>,
}

fn default_age_out_interval() -> u64 {
    300
}

impl Default for AgeOutConfig {
    fn default() -> Self {
        AgeOutConfig { interval: default_age_out_interval(), sudden_death: false, default: None, by_type: BTreeMap::new() }
    }
}

/// Miner (`PollerEngine`) configuration schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    pub source_name: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    #[serde(default)]
    pub age_out: AgeOutConfig,
}

fn default_interval() -> u64 {
    3600
}

fn default_num_retries() -> u32 {
    2
}

impl MinerConfig {
    /// Resolve into the runtime [`PollerConfig`], defaulting `source_name`
    /// to the node's own name when unset.
    pub fn into_poller_config(self, node_name: &str) -> Result<PollerConfig, NodeError> {
        let by_type: BTreeMap<String, String> = self.age_out.by_type.clone();
        let age_out = AgeOutPolicy::from_config(self.age_out.interval, self.age_out.sudden_death, self.age_out.default.as_deref(), &by_type)?;

        let attributes: Attributes = self.attributes.into_iter().collect();

        Ok(PollerConfig {
            source_name: self.source_name.unwrap_or_else(|| node_name.to_string()),
            attributes_template: attributes,
            interval: Duration::from_secs(self.interval),
            num_retries: self.num_retries,
            age_out,
        })
    }
}

/// Aggregator (`RangeAggregator`) configuration schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub whitelists: Vec<String>,
}

impl AggregatorConfig {
    pub fn into_runtime_config(self) -> crate::aggregator::RangeAggregatorConfig {
        crate::aggregator::RangeAggregatorConfig { whitelists: self.whitelists.into_iter().collect() }
    }
}

/// Pull-driver configuration schema. `side_config_path` defaults
/// to `<config_dir>/<name>_side_config.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullDriverFileConfig {
    pub discovery_service: String,
    pub collection: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default = "default_initial_interval_secs")]
    pub initial_interval: u64,
    #[serde(default)]
    pub confidence_map: Option<BTreeMap<String, i64>>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_initial_interval_secs() -> u64 {
    86_400
}

fn default_prefix() -> String {
    "taxii".to_string()
}

impl PullDriverFileConfig {
    pub fn into_runtime_config(self, node_name: &str, config_dir: &Path) -> PullDriverConfig {
        let confidence_map = match self.confidence_map {
            Some(map) => ConfidenceMap(map),
            None => ConfidenceMap::default(),
        };

        PullDriverConfig {
            discovery_service: self.discovery_service,
            collection: self.collection,
            credentials: self.credentials,
            initial_interval: Duration::from_secs(self.initial_interval),
            confidence_map,
            prefix: self.prefix,
            side_config_path: Some(config_dir.join(format!("{node_name}_side_config.yml")).to_string_lossy().to_string()),
        }
    }
}

/// Top-level node config file: one node's identity plus its miner and,
/// optionally, pull-driver and aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub aggregator: Option<AggregatorConfig>,
    #[serde(default)]
    pub pull_driver: Option<PullDriverFileConfig>,
}

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            source_name: None,
            attributes: BTreeMap::new(),
            interval: default_interval(),
            num_retries: default_num_retries(),
            age_out: AgeOutConfig::default(),
        }
    }
}

/// Load a [`NodeConfig`] from a YAML file on disk.
pub fn load_node_config(path: &Path) -> Result<NodeConfig, NodeError> {
    let contents = std::fs::read_to_string(path).map_err(|e| NodeError::Configuration(format!("reading {path:?}: {e}")))?;
    serde_yaml::from_str(&contents).map_err(|e| NodeError::Configuration(format!("parsing {path:?}: {e}")))
}
