//! Websocket frames for the subscribe endpoint.

use serde::{Deserialize, Serialize};

use crate::normalize::{normalize_type, parse_revision};
use crate::WatchDescriptor;

/// Outbound control frame: start (or, with `stop`, end) a watch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<bool>,
}

impl WatchRequest {
    /// Start frame for `d`, addressed with the server's own type name.
    pub fn start(d: &WatchDescriptor, wire_type: &str) -> Self {
        Self {
            resource_type: wire_type.to_string(),
            resource_version: d.revision.map(|r| r.to_string()),
            namespace: d.namespace.clone().filter(|s| !s.is_empty()),
            id: d.id.clone().filter(|s| !s.is_empty()),
            selector: d.selector.clone().filter(|s| !s.is_empty()),
            stop: None,
        }
    }

    pub fn stop(d: &WatchDescriptor, wire_type: &str) -> Self {
        let mut req = Self::start(d, wire_type);
        req.resource_version = None;
        req.stop = Some(true);
        req
    }
}

/// Inbound frame as sent by the server, before classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawSocketMessage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub revision: Option<serde_json::Value>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Classified inbound frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub descriptor: WatchDescriptor,
    pub reason: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Closed set of inbound frame kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketMessage {
    Ping,
    Start(WatchEvent),
    Error(WatchEvent),
    Stop(WatchEvent),
    Create(WatchEvent),
    Change(WatchEvent),
    Remove(WatchEvent),
    /// Dotted name outside the known set; logged and dropped by the store.
    Unknown(String),
}

impl SocketMessage {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawSocketMessage = serde_json::from_str(text)?;
        Ok(Self::classify(raw))
    }

    pub fn classify(raw: RawSocketMessage) -> Self {
        let name = raw.name.clone();
        if name == "ping" {
            return SocketMessage::Ping;
        }
        let ev = raw.into_event();
        match name.as_str() {
            "resource.start" => SocketMessage::Start(ev),
            "resource.error" => SocketMessage::Error(ev),
            "resource.stop" => SocketMessage::Stop(ev),
            "resource.create" => SocketMessage::Create(ev),
            "resource.change" => SocketMessage::Change(ev),
            "resource.remove" => SocketMessage::Remove(ev),
            // some producers send bare event names; those are changes
            other if !other.contains('.') => SocketMessage::Change(ev),
            other => SocketMessage::Unknown(other.to_string()),
        }
    }
}

impl RawSocketMessage {
    fn into_event(self) -> WatchEvent {
        // change frames may carry the type/revision only inside `data`
        let data_type = self
            .data
            .as_ref()
            .and_then(|d| d.get("type"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let resource_type = self.resource_type.or(data_type).unwrap_or_default();
        let revision = self.revision.as_ref().and_then(parse_revision).or_else(|| {
            self.data
                .as_ref()
                .and_then(|d| d.get("metadata"))
                .and_then(|m| m.get("resourceVersion"))
                .and_then(parse_revision)
        });
        WatchEvent {
            descriptor: WatchDescriptor {
                resource_type: normalize_type(&resource_type),
                namespace: self.namespace.filter(|s| !s.is_empty()),
                id: self.id.filter(|s| !s.is_empty()),
                selector: self.selector.filter(|s| !s.is_empty()),
                revision,
            },
            reason: self.reason,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_names() {
        let m = SocketMessage::parse(r#"{"name":"resource.stop","resourceType":"pods","namespace":"ns"}"#).unwrap();
        match m {
            SocketMessage::Stop(ev) => {
                assert_eq!(ev.descriptor.resource_type, "pod");
                assert_eq!(ev.descriptor.namespace.as_deref(), Some("ns"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(SocketMessage::parse(r#"{"name":"ping"}"#).unwrap(), SocketMessage::Ping);
    }

    #[test]
    fn bare_names_are_changes_and_dotted_unknowns_are_kept_apart() {
        let m = SocketMessage::parse(r#"{"name":"pod","data":{"id":"a","type":"pod","metadata":{"resourceVersion":"9"}}}"#).unwrap();
        match m {
            SocketMessage::Change(ev) => {
                assert_eq!(ev.descriptor.resource_type, "pod");
                assert_eq!(ev.descriptor.revision, Some(9));
            }
            other => panic!("unexpected {:?}", other),
        }
        let m = SocketMessage::parse(r#"{"name":"resource.unknown"}"#).unwrap();
        assert_eq!(m, SocketMessage::Unknown("resource.unknown".into()));
    }

    #[test]
    fn start_frame_omits_absent_fields() {
        let d = WatchDescriptor::for_type("pod").with_revision(Some(12));
        let v = serde_json::to_value(WatchRequest::start(&d, "pod")).unwrap();
        assert_eq!(v, serde_json::json!({"resourceType": "pod", "resourceVersion": "12"}));
        let v = serde_json::to_value(WatchRequest::stop(&d, "pod")).unwrap();
        assert_eq!(v, serde_json::json!({"resourceType": "pod", "stop": true}));
    }
}
