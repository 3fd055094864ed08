//! `PullFeedDriver`: binds [`crate::poller::PollerEngine`] to the
//! structured-threat-information pull protocol.

pub mod client;
pub mod xml;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::NodeError;
use crate::poller::FeedSource;
use client::{PollResponse, ServiceInstance, TaxiiClient};
use xml::{ObservableKind, Package};

/// Basic-auth / mTLS / CA-bundle credential matrix for the discovery HTTP
/// client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub key_file: Option<String>,
    pub cert_file: Option<String>,
    pub ca_file: Option<String>,
}

/// Textual confidence level -> integer mapping.
#[derive(Debug, Clone)]
pub struct ConfidenceMap(pub BTreeMap<String, i64>);

impl Default for ConfidenceMap {
    fn default() -> Self {
        ConfidenceMap(BTreeMap::from([
            ("low".to_string(), 40),
            ("medium".to_string(), 60),
            ("high".to_string(), 80),
        ]))
    }
}

impl ConfidenceMap {
    fn lookup(&self, level: &str) -> Option<i64> {
        self.0.get(&level.to_lowercase()).copied()
    }
}

/// Static pull-driver configuration.
#[derive(Debug, Clone)]
pub struct PullDriverConfig {
    pub discovery_service: String,
    pub collection: String,
    pub credentials: Credentials,
    pub initial_interval: Duration,
    pub confidence_map: ConfidenceMap,
    pub prefix: String,
    pub side_config_path: Option<String>,
}

/// One indicator entry produced by a poll pass, carrying its cross-reference
/// tables for per-item expansion: `params = {ttps,
/// observables}`.
pub struct DriverItem {
    pub indicator_id: String,
    pub indicator_value: Value,
    pub observable_idrefs: Vec<String>,
    pub ttp_descriptions: Vec<String>,
    pub package: std::sync::Arc<Package>,
}

/// Concrete [`FeedSource`] for the pull protocol.
pub struct PullFeedDriver {
    config: PullDriverConfig,
    client: TaxiiClient,
    last_taxii_run: Mutex<Option<i64>>,
}

impl PullFeedDriver {
    pub fn new(config: PullDriverConfig) -> Result<Self, NodeError> {
        let http = build_http_client(&config.credentials)?;
        let client = TaxiiClient::new(http, config.discovery_service.clone());
        Ok(PullFeedDriver { config, client, last_taxii_run: Mutex::new(None) })
    }

    /// Reload credentials from the side-config file on a hup, before the generic poller forces an immediate poll.
    pub async fn reload_side_config(&mut self) -> Result<(), NodeError> {
        let Some(path) = &self.config.side_config_path else { return Ok(()) };
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| NodeError::Configuration(format!("reading side config {path:?}: {e}")))?;
        let credentials: Credentials =
            serde_yaml::from_str(&contents).map_err(|e| NodeError::Configuration(format!("parsing side config {path:?}: {e}")))?;
        self.client = TaxiiClient::new(build_http_client(&credentials)?, self.config.discovery_service.clone());
        self.config.credentials = credentials;
        Ok(())
    }

    async fn poll_collection(&self, begin_ms: i64, end_ms: i64) -> Result<Vec<Package>, NodeError> {
        let collection_mgmt = self.client.discover_collection_management().await?;
        let polling_service: ServiceInstance = self.client.collection_info(&collection_mgmt, &self.config.collection).await?;

        let mut packages = Vec::new();
        let mut response: PollResponse = self.client.poll(&polling_service.address, &self.config.collection, begin_ms, end_ms).await?;
        packages.extend(self.client.decode(&response));

        while response.more {
            let Some(result_id) = response.result_id.clone() else { break };
            response = self
                .client
                .fulfillment(&polling_service.address, &result_id, response.result_part_number + 1)
                .await?;
            packages.extend(self.client.decode(&response));
        }

        Ok(packages)
    }
}

#[async_trait]
impl FeedSource for PullFeedDriver {
    type Item = DriverItem;

    async fn build_iterator(&self, now: i64) -> Result<Vec<Self::Item>, NodeError> {
        let begin_ms = {
            let last = *self.last_taxii_run.lock().await;
            last.unwrap_or(now - self.config.initial_interval.as_millis() as i64)
        };

        let packages = self.poll_collection(begin_ms, now).await?;
        *self.last_taxii_run.lock().await = Some(now);

        let mut items = Vec::new();
        for package in packages {
            let package = std::sync::Arc::new(package);
            for indicator in &package.indicators {
                let confidence = indicator.confidence.as_deref().and_then(|c| self.config.confidence_map.lookup(c));
                let mut value = serde_json::json!({});
                if let Some(ts) = indicator.timestamp_ms {
                    value["timestamp"] = serde_json::json!(ts);
                }
                if let Some(conf) = confidence {
                    value["confidence"] = serde_json::json!(conf);
                }

                let ttp_descriptions: Vec<String> = indicator
                    .ttp_idrefs
                    .iter()
                    .filter_map(|idref| package.ttps.get(idref))
                    .map(|ttp| ttp.description.clone())
                    .collect();

                items.push(DriverItem {
                    indicator_id: indicator.id.clone(),
                    indicator_value: value,
                    observable_idrefs: indicator.observable_idrefs.clone(),
                    ttp_descriptions,
                    package: package.clone(),
                });
            }
        }
        Ok(items)
    }

    /// Per-item expansion: resolve each observable idref through the
    /// package's cross-reference table, copy confidence and the first TTP
    /// description onto each produced value, and fan out one pair per
    /// observable value.
    fn process_item(&self, item: Self::Item) -> Result<Vec<(String, Value)>, NodeError> {
        let mut pairs = Vec::new();

        for idref in &item.observable_idrefs {
            let Some(observable) = item.package.observables.get(idref) else { continue };

            let mut attrs = item.indicator_value.clone();
            if let Value::Object(ref mut map) = attrs {
                map.insert("type".to_string(), Value::String(observable_type(observable.kind).to_string()));
                if let Some(direction) = observable.direction {
                    map.insert(
                        "direction".to_string(),
                        Value::String(
                            match direction {
                                xml::Direction::Inbound => "inbound",
                                xml::Direction::Outbound => "outbound",
                            }
                            .to_string(),
                        ),
                    );
                }
                if let Some(ttp) = item.ttp_descriptions.first() {
                    map.insert(format!("{}_ttp", self.config.prefix), Value::String(ttp.clone()));
                }
            }

            for value in &observable.values {
                pairs.push((value.clone(), attrs.clone()));
            }
        }

        if pairs.is_empty() && !item.observable_idrefs.is_empty() {
            return Err(NodeError::UnsupportedObservable(item.indicator_id));
        }

        Ok(pairs)
    }
}

fn observable_type(kind: ObservableKind) -> &'static str {
    xml::observable_type_field(kind)
}

fn build_http_client(credentials: &Credentials) -> Result<Client, NodeError> {
    let mut builder = Client::builder();

    if let (Some(cert_file), Some(key_file)) = (&credentials.cert_file, &credentials.key_file) {
        let cert_pem = std::fs::read(cert_file).map_err(|e| NodeError::Configuration(format!("reading cert_file: {e}")))?;
        let key_pem = std::fs::read(key_file).map_err(|e| NodeError::Configuration(format!("reading key_file: {e}")))?;
        let mut pem = cert_pem;
        pem.extend_from_slice(&key_pem);
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| NodeError::Configuration(format!("building mTLS identity: {e}")))?;
        builder = builder.identity(identity);
    }

    if let Some(ca_file) = &credentials.ca_file {
        let ca_pem = std::fs::read(ca_file).map_err(|e| NodeError::Configuration(format!("reading ca_file: {e}")))?;
        let ca = reqwest::Certificate::from_pem(&ca_pem).map_err(|e| NodeError::Configuration(format!("parsing ca_file: {e}")))?;
        builder = builder.add_root_certificate(ca);
    }

    builder.build().map_err(|e| NodeError::Configuration(format!("building http client: {e}")))
}
