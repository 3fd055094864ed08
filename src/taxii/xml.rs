//! Content-block XML decoding. Structured-threat-information package
//! XML is deep and namespace-heavy; this scans for the handful of elements
//! the driver actually needs (indicators, observables, TTPs) by local name,
//! ignoring namespace prefixes, rather than materializing the full object
//! model.

use std::collections::BTreeMap;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;

use crate::error::NodeError;

/// The observable kinds this driver understands; composition observables
/// are unsupported and simply produce no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservableKind {
    Ipv4,
    Ipv6,
    Domain,
    Url,
}

impl ObservableKind {
    fn as_type_str(self) -> &'static str {
        match self {
            ObservableKind::Ipv4 => "IPv4",
            ObservableKind::Ipv6 => "IPv6",
            ObservableKind::Domain => "domain",
            ObservableKind::Url => "URL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct Observable {
    pub kind: ObservableKind,
    pub direction: Option<Direction>,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Ttp {
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct PackageIndicator {
    pub id: String,
    pub timestamp_ms: Option<i64>,
    pub confidence: Option<String>,
    pub observable_idrefs: Vec<String>,
    pub ttp_idrefs: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Package {
    pub indicators: Vec<PackageIndicator>,
    pub observables: BTreeMap<String, Observable>,
    pub ttps: BTreeMap<String, Ttp>,
}

fn local_name(qname: &[u8]) -> String {
    let s = String::from_utf8_lossy(qname);
    s.rsplit(':').next().unwrap_or(&s).to_string()
}

fn attr(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find(|a| local_name(a.key.as_ref()) == name).map(|a| {
        String::from_utf8_lossy(&a.value).to_string()
    })
}

/// Decode one content-block's XML payload into a [`Package`].
/// Unsupported bindings are the caller's concern — this assumes the caller
/// has already checked the binding id.
pub fn decode_content_block(xml: &str) -> Result<Package, NodeError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut package = Package::default();
    let mut stack: Vec<String> = Vec::new();
    let mut text_buf = String::new();

    let mut cur_indicator: Option<PackageIndicator> = None;
    let mut cur_observable_id: Option<String> = None;
    let mut cur_observable_kind: Option<ObservableKind> = None;
    let mut cur_observable_direction: Option<Direction> = None;
    let mut cur_observable_values: Vec<String> = Vec::new();
    let mut cur_ttp: Option<(String, Ttp)> = None;

    loop {
        match reader.read_event().map_err(|e| NodeError::Parse(format!("malformed content-block xml: {e}")))? {
            Event::Start(e) => {
                let name = local_name(e.name().as_ref());

                match name.as_str() {
                    "Indicator" => {
                        let id = attr(&e, "id").unwrap_or_default();
                        cur_indicator = Some(PackageIndicator {
                            id,
                            timestamp_ms: None,
                            confidence: None,
                            observable_idrefs: Vec::new(),
                            ttp_idrefs: Vec::new(),
                        });
                    }
                    "Observable" => {
                        if let Some(idref) = attr(&e, "idref") {
                            if let Some(ind) = cur_indicator.as_mut() {
                                ind.observable_idrefs.push(idref);
                            }
                        } else if let Some(id) = attr(&e, "id") {
                            cur_observable_id = Some(id);
                            cur_observable_kind = None;
                            cur_observable_direction = None;
                            cur_observable_values.clear();
                        }
                    }
                    "Properties" => {
                        if let Some(xsi_type) = attr(&e, "type") {
                            cur_observable_kind = match xsi_type.as_str() {
                                t if t.contains("AddressObjectType") => {
                                    let category = attr(&e, "category").unwrap_or_default();
                                    Some(if category == "ipv6-addr" { ObservableKind::Ipv6 } else { ObservableKind::Ipv4 })
                                }
                                t if t.contains("DomainNameObjectType") => Some(ObservableKind::Domain),
                                t if t.contains("URIObjectType") => Some(ObservableKind::Url),
                                _ => None,
                            };
                        }
                        if let Some(is_source) = attr(&e, "is_source") {
                            cur_observable_direction =
                                Some(if is_source == "true" { Direction::Outbound } else { Direction::Inbound });
                        }
                    }
                    "Indicated_TTP" => {}
                    "TTP" => {
                        if let Some(idref) = attr(&e, "idref") {
                            if let Some(ind) = cur_indicator.as_mut() {
                                ind.ttp_idrefs.push(idref);
                            }
                        } else if let Some(id) = attr(&e, "id") {
                            cur_ttp = Some((id, Ttp::default()));
                        }
                    }
                    _ => {}
                }

                stack.push(name);
                text_buf.clear();
            }
            Event::Text(t) => {
                text_buf.push_str(&t.unescape().unwrap_or_default());
            }
            Event::End(e) => {
                let name = local_name(e.name().as_ref());
                stack.pop();

                match name.as_str() {
                    "Timestamp" => {
                        if let Some(ind) = cur_indicator.as_mut() {
                            ind.timestamp_ms = parse_stix_timestamp_ms(text_buf.trim());
                        }
                    }
                    "Value" if cur_ttp.is_some() => {
                        // TTP <Confidence><Value> is handled on the Indicator
                        // path below; inside a TTP, a bare <Value> isn't
                        // meaningful on its own — ignore.
                    }
                    "Value" => {
                        if let Some(ind) = cur_indicator.as_mut() {
                            if ind.confidence.is_none() && stack.last().map(String::as_str) == Some("Confidence") {
                                ind.confidence = Some(text_buf.trim().to_string());
                            }
                        }
                        if cur_observable_kind.is_some() {
                            cur_observable_values.push(text_buf.trim().to_string());
                        }
                    }
                    "Address_Value" | "URI" if cur_observable_kind.is_some() => {
                        cur_observable_values.push(text_buf.trim().to_string());
                    }
                    "Description" => {
                        if let Some((_, ttp)) = cur_ttp.as_mut() {
                            if ttp.description.is_empty() {
                                ttp.description = text_buf.trim().to_string();
                            }
                        }
                    }
                    "Title" => {
                        if let Some((_, ttp)) = cur_ttp.as_mut() {
                            if ttp.description.is_empty() {
                                ttp.description = text_buf.trim().to_string();
                            }
                        }
                    }
                    "Observable" => {
                        if let (Some(id), Some(kind)) = (cur_observable_id.take(), cur_observable_kind.take()) {
                            package.observables.insert(
                                id,
                                Observable {
                                    kind,
                                    direction: cur_observable_direction.take(),
                                    values: std::mem::take(&mut cur_observable_values),
                                },
                            );
                        }
                    }
                    "TTP" => {
                        if let Some((id, ttp)) = cur_ttp.take() {
                            package.ttps.insert(id, ttp);
                        }
                    }
                    "Indicator" => {
                        if let Some(ind) = cur_indicator.take() {
                            package.indicators.push(ind);
                        }
                    }
                    _ => {}
                }

                text_buf.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(package)
}

fn parse_stix_timestamp_ms(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis())
}

pub fn observable_type_field(kind: ObservableKind) -> &'static str {
    kind.as_type_str()
}
