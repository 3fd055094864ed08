//! HTTP(S) discovery / collection-info / poll / fulfillment flow for the
//! pull-style protocol.

use reqwest::Client;
use serde_json::Value;

use crate::error::NodeError;

use super::xml::{decode_content_block, Package};

/// The supported structured-threat-information content binding id. Content
/// blocks with any other binding are logged and skipped.
pub const SUPPORTED_BINDING: &str = "urn:stix.mitre.org:xml:1.1.1";

#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub address: String,
    pub service_type: String,
}

#[derive(Debug, Clone)]
pub struct ContentBlock {
    pub binding: String,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct PollResponse {
    pub content_blocks: Vec<ContentBlock>,
    pub more: bool,
    pub result_id: Option<String>,
    pub result_part_number: u32,
}

/// A thin client over the discovery/collection-info/poll/fulfillment
/// request sequence. Request/response bodies are treated as opaque JSON
/// envelopes carrying the protocol's fields — the wire-level message
/// encoding itself is an external-protocol concern out of scope here; what
/// matters to this crate is the sequence of calls and the content-block
/// payloads they ultimately yield.
pub struct TaxiiClient {
    http: Client,
    discovery_service: String,
}

impl TaxiiClient {
    pub fn new(http: Client, discovery_service: String) -> Self {
        TaxiiClient { http, discovery_service }
    }

    /// Discover the collection-management service address.
    pub async fn discover_collection_management(&self) -> Result<String, NodeError> {
        let response: Value = self
            .http
            .post(&self.discovery_service)
            .json(&serde_json::json!({ "message_type": "discovery_request" }))
            .send()
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?;

        let services = response.get("service_instances").and_then(Value::as_array).cloned().unwrap_or_default();
        services
            .iter()
            .find(|s| s.get("service_type").and_then(Value::as_str) == Some("collection management"))
            .and_then(|s| s.get("address").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| NodeError::ProtocolContract("no collection management service advertised".to_string()))
    }

    /// Locate `collection` and its polling service.
    pub async fn collection_info(&self, collection_mgmt_address: &str, collection: &str) -> Result<ServiceInstance, NodeError> {
        let response: Value = self
            .http
            .post(collection_mgmt_address)
            .json(&serde_json::json!({ "message_type": "collection_information_request" }))
            .send()
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?;

        let collections = response.get("collections").and_then(Value::as_array).cloned().unwrap_or_default();
        let entry = collections
            .iter()
            .find(|c| c.get("name").and_then(Value::as_str) == Some(collection))
            .ok_or_else(|| NodeError::ProtocolContract(format!("unknown collection {collection:?}")))?;

        if entry.get("collection_type").and_then(Value::as_str) != Some("data feed") {
            return Err(NodeError::ProtocolContract(format!("collection {collection:?} is not a data feed")));
        }

        let polling = entry.get("polling_services").and_then(Value::as_array).cloned().unwrap_or_default();
        let first = polling
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::ProtocolContract(format!("collection {collection:?} has no polling service instances")))?;

        Ok(ServiceInstance { address: first.to_string(), service_type: "polling".to_string() })
    }

    /// Issue a poll request covering `(begin, end)` exclusive/inclusive
    /// millisecond bounds.
    pub async fn poll(&self, poll_address: &str, collection: &str, begin_ms: i64, end_ms: i64) -> Result<PollResponse, NodeError> {
        let response: Value = self
            .http
            .post(poll_address)
            .json(&serde_json::json!({
                "message_type": "poll_request",
                "collection_name": collection,
                "exclusive_begin_timestamp": begin_ms,
                "inclusive_end_timestamp": end_ms,
                "response_type": "FULL",
            }))
            .send()
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?;

        parse_poll_response(&response)
    }

    /// Request the next part of a paged poll result.
    pub async fn fulfillment(&self, poll_address: &str, result_id: &str, part_number: u32) -> Result<PollResponse, NodeError> {
        let response: Value = self
            .http
            .post(poll_address)
            .json(&serde_json::json!({
                "message_type": "poll_fulfillment_request",
                "result_id": result_id,
                "result_part_number": part_number,
            }))
            .send()
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?;

        parse_poll_response(&response)
    }

    /// Decode every supported content block in `response`, skipping
    /// unsupported bindings.
    pub fn decode(&self, response: &PollResponse) -> Vec<Package> {
        response
            .content_blocks
            .iter()
            .filter_map(|block| {
                if block.binding != SUPPORTED_BINDING {
                    tracing::warn!(binding = %block.binding, "skipping content block with unsupported binding");
                    return None;
                }
                match decode_content_block(&block.body) {
                    Ok(package) => Some(package),
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping malformed content block");
                        None
                    }
                }
            })
            .collect()
    }
}

fn parse_poll_response(response: &Value) -> Result<PollResponse, NodeError> {
    let content_blocks = response
        .get("content_blocks")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .map(|b| ContentBlock {
                    binding: b.get("binding").and_then(Value::as_str).unwrap_or_default().to_string(),
                    body: b.get("body").and_then(Value::as_str).unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(PollResponse {
        content_blocks,
        more: response.get("more").and_then(Value::as_bool).unwrap_or(false),
        result_id: response.get("result_id").and_then(Value::as_str).map(str::to_string),
        result_part_number: response.get("result_part_number").and_then(Value::as_u64).unwrap_or(1) as u32,
    })
}
