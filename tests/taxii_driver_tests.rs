//! End-to-end test of the pull-protocol driver's per-item expansion: a
//! decoded package's indicator/observable/TTP cross-references fan out into
//! one `(value, attributes)` pair per observable value, carrying confidence
//! and the TTP description along for the ride.

use std::sync::Arc;
use std::time::Duration;

use threatmesh::error::NodeError;
use threatmesh::poller::FeedSource;
use threatmesh::taxii::xml::{decode_content_block, Direction, ObservableKind};
use threatmesh::taxii::{ConfidenceMap, Credentials, PullDriverConfig, PullFeedDriver};

const PACKAGE_XML: &str = r#"<stix:STIX_Package xmlns:stix="urn:stix">
  <stix:Indicators>
    <stix:Indicator id="ind-1">
      <indicator:Timestamp>2024-06-01T00:00:00Z</indicator:Timestamp>
      <indicator:Confidence><indicator:Value>High</indicator:Value></indicator:Confidence>
      <indicator:Observable idref="obs-1"/>
      <indicator:Indicated_TTP><stixCommon:TTP idref="ttp-1"/></indicator:Indicated_TTP>
    </stix:Indicator>
  </stix:Indicators>
  <stix:Observables>
    <cybox:Observable id="obs-1">
      <cybox:Object>
        <cybox:Properties xsi:type="AddressObjectType" category="ipv4-addr" is_source="true">
          <AddressObj:Address_Value>203.0.113.5</AddressObj:Address_Value>
        </cybox:Properties>
      </cybox:Object>
    </cybox:Observable>
  </stix:Observables>
  <stix:TTPs>
    <ttp:TTP id="ttp-1">
      <ttp:Description>Botnet C2</ttp:Description>
    </ttp:TTP>
  </stix:TTPs>
</stix:STIX_Package>"#;

fn driver() -> Result<PullFeedDriver, NodeError> {
    PullFeedDriver::new(PullDriverConfig {
        discovery_service: "https://example.invalid/discovery".to_string(),
        collection: "c1".to_string(),
        credentials: Credentials::default(),
        initial_interval: Duration::from_secs(86_400),
        confidence_map: ConfidenceMap::default(),
        prefix: "taxii".to_string(),
        side_config_path: None,
    })
}

#[test]
fn decoded_package_expands_into_one_pair_per_observable_value() {
    let driver = driver().unwrap();
    let package = decode_content_block(PACKAGE_XML).unwrap();
    assert_eq!(package.indicators.len(), 1);
    let indicator = &package.indicators[0];

    let observable = package.observables.get("obs-1").unwrap();
    assert_eq!(observable.kind, ObservableKind::Ipv4);
    assert_eq!(observable.direction, Some(Direction::Outbound));

    let ttp_descriptions: Vec<String> = indicator
        .ttp_idrefs
        .iter()
        .filter_map(|idref| package.ttps.get(idref))
        .map(|ttp| ttp.description.clone())
        .collect();
    assert_eq!(ttp_descriptions, vec!["Botnet C2".to_string()]);

    let item = threatmesh::taxii::DriverItem {
        indicator_id: indicator.id.clone(),
        indicator_value: serde_json::json!({ "confidence": 80 }),
        observable_idrefs: indicator.observable_idrefs.clone(),
        ttp_descriptions,
        package: Arc::new(package),
    };

    let pairs = driver.process_item(item).unwrap();
    assert_eq!(pairs.len(), 1);
    let (indicator_string, attrs) = &pairs[0];
    assert_eq!(indicator_string, "203.0.113.5");
    assert_eq!(attrs["type"], serde_json::json!("IPv4"));
    assert_eq!(attrs["direction"], serde_json::json!("outbound"));
    assert_eq!(attrs["confidence"], serde_json::json!(80));
    assert_eq!(attrs["taxii_ttp"], serde_json::json!("Botnet C2"));
}

#[test]
fn indicator_with_unresolvable_observable_idref_yields_no_pairs() {
    let driver = driver().unwrap();
    let item = threatmesh::taxii::DriverItem {
        indicator_id: "ind-2".to_string(),
        indicator_value: serde_json::json!({}),
        observable_idrefs: vec!["missing-obs".to_string()],
        ttp_descriptions: vec![],
        package: Arc::new(Default::default()),
    };

    let result = driver.process_item(item);
    assert!(matches!(result, Err(NodeError::UnsupportedObservable(id)) if id == "ind-2"));
}

#[tokio::test]
async fn build_iterator_surfaces_a_network_error_against_an_unreachable_discovery_service() {
    // No mock server in the dependency stack for this driver's HTTP calls;
    // this exercises the real failure path against a discovery service that
    // refuses the connection, confirming it surfaces as a retryable
    // `NodeError::Network` rather than panicking.
    let driver = PullFeedDriver::new(PullDriverConfig {
        discovery_service: "http://127.0.0.1:1/discovery".to_string(),
        collection: "c1".to_string(),
        credentials: Credentials::default(),
        initial_interval: Duration::from_secs(60),
        confidence_map: ConfidenceMap::default(),
        prefix: "taxii".to_string(),
        side_config_path: None,
    })
    .unwrap();

    let result = driver.build_iterator(0).await;
    assert!(matches!(result, Err(e) if e.is_retryable()));
}
