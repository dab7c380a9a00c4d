//! Control messages exchanged with the server.
//!
//! Every message is a `{"type": ..., "data": {...}}` envelope. Outbound
//! heartbeats and status reports originate here; inbound acks, forced
//! reports and config updates are decoded here and dispatched by the session.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Control message type discriminators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client liveness ping
    Heartbeat,
    /// Server acknowledgement of a heartbeat
    HeartbeatAck,
    /// Client status and traffic report
    StatusReport,
    /// Server request for an immediate status report
    ForceReport,
    /// Server-pushed configuration change
    ConfigUpdate,
}

impl MessageType {
    /// Wire name of the type tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::StatusReport => "status_report",
            Self::ForceReport => "force_report",
            Self::ConfigUpdate => "config_update",
        }
    }

    /// Parse a wire type tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "heartbeat" => Some(Self::Heartbeat),
            "heartbeat_ack" => Some(Self::HeartbeatAck),
            "status_report" => Some(Self::StatusReport),
            "force_report" => Some(Self::ForceReport),
            "config_update" => Some(Self::ConfigUpdate),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope decode failures.
///
/// A message that decodes fine but that the session does not act on is *not*
/// an error; these variants mean the peer broke the protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON, or not a JSON object.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// Envelope has no string `type` field.
    #[error("envelope missing `type`")]
    MissingType,

    /// `type` is not part of the protocol.
    #[error("unknown message type `{0}`")]
    UnknownType(String),

    /// `data` does not match the shape required by `type`.
    #[error("invalid `{msg_type}` payload: {reason}")]
    InvalidPayload {
        /// Message type whose payload was rejected.
        msg_type: MessageType,
        /// Deserializer message.
        reason: String,
    },
}

/// Online/offline marker carried by status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Session is live
    Online,
    /// Session is shutting down
    Offline,
}

/// Heartbeat payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    /// Device identifier
    pub device_id: String,
    /// Declared device type
    pub device_type: String,
    /// Unix millis
    pub timestamp: i64,
}

/// Upload/download totals inside a status report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficData {
    /// Uploaded bytes
    pub upload: u64,
    /// Downloaded bytes
    pub download: u64,
}

/// Status report payload.
///
/// Offline reports only carry identity, status and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReportData {
    /// Device identifier
    pub device_id: String,
    /// Declared device type
    pub device_type: String,
    /// Online/offline marker
    pub status: DeviceStatus,
    /// Public IP, or the lookup sentinel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Session duration in whole seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Traffic since the previous successful report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<TrafficData>,
    /// Unix millis
    pub timestamp: i64,
}

/// `config_update` payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    /// New status report period in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_report_interval: Option<i64>,
    /// Fields this client does not understand yet
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigUpdate {
    /// The requested status period, if present and positive
    pub fn status_report_interval(&self) -> Option<Duration> {
        self.status_report_interval
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }
}

/// A decoded control message
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Outbound liveness ping
    Heartbeat(HeartbeatData),
    /// Inbound heartbeat acknowledgement (payload kept opaque)
    HeartbeatAck(Value),
    /// Outbound status report
    StatusReport(StatusReportData),
    /// Inbound request for an immediate report (payload kept opaque)
    ForceReport(Value),
    /// Inbound configuration change
    ConfigUpdate(ConfigUpdate),
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    data: &'a T,
}

impl ControlMessage {
    /// Heartbeat stamped with the current time
    pub fn heartbeat(device_id: &str, device_type: &str) -> Self {
        Self::Heartbeat(HeartbeatData {
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
            timestamp: current_timestamp(),
        })
    }

    /// Online status report stamped with the current time
    pub fn online_report(
        device_id: &str,
        device_type: &str,
        ip_address: String,
        duration_secs: u64,
        traffic: TrafficData,
    ) -> Self {
        Self::StatusReport(StatusReportData {
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
            status: DeviceStatus::Online,
            ip_address: Some(ip_address),
            duration: Some(duration_secs),
            traffic: Some(traffic),
            timestamp: current_timestamp(),
        })
    }

    /// Offline status report sent on shutdown
    pub fn offline_report(device_id: &str, device_type: &str) -> Self {
        Self::StatusReport(StatusReportData {
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
            status: DeviceStatus::Offline,
            ip_address: None,
            duration: None,
            traffic: None,
            timestamp: current_timestamp(),
        })
    }

    /// Type tag of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::HeartbeatAck(_) => MessageType::HeartbeatAck,
            Self::StatusReport(_) => MessageType::StatusReport,
            Self::ForceReport(_) => MessageType::ForceReport,
            Self::ConfigUpdate(_) => MessageType::ConfigUpdate,
        }
    }

    /// Serialize to a `{type, data}` JSON envelope
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let msg_type = self.message_type().as_str();
        match self {
            Self::Heartbeat(data) => serde_json::to_string(&Envelope { msg_type, data }),
            Self::HeartbeatAck(data) | Self::ForceReport(data) => {
                serde_json::to_string(&Envelope { msg_type, data })
            },
            Self::StatusReport(data) => serde_json::to_string(&Envelope { msg_type, data }),
            Self::ConfigUpdate(data) => serde_json::to_string(&Envelope { msg_type, data }),
        }
    }

    /// Parse a `{type, data}` JSON envelope.
    ///
    /// `data` may be absent for message types that do not need it.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let Value::Object(mut envelope) = value else {
            return Err(DecodeError::Malformed("envelope is not a JSON object".to_string()));
        };

        let tag = match envelope.get("type") {
            Some(Value::String(tag)) => tag.clone(),
            _ => return Err(DecodeError::MissingType),
        };
        let msg_type =
            MessageType::from_tag(&tag).ok_or_else(|| DecodeError::UnknownType(tag.clone()))?;

        let data = envelope.remove("data").unwrap_or(Value::Null);

        match msg_type {
            MessageType::HeartbeatAck => Ok(Self::HeartbeatAck(data)),
            MessageType::ForceReport => Ok(Self::ForceReport(data)),
            MessageType::ConfigUpdate if data.is_null() => {
                Ok(Self::ConfigUpdate(ConfigUpdate::default()))
            },
            MessageType::ConfigUpdate => payload(msg_type, data).map(Self::ConfigUpdate),
            MessageType::Heartbeat => payload(msg_type, data).map(Self::Heartbeat),
            MessageType::StatusReport => payload(msg_type, data).map(Self::StatusReport),
        }
    }
}

fn payload<T: for<'de> Deserialize<'de>>(msg_type: MessageType, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|e| DecodeError::InvalidPayload {
        msg_type,
        reason: e.to_string(),
    })
}

/// Get current timestamp in milliseconds
fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heartbeat_envelope() {
        let msg = ControlMessage::heartbeat("android_1", "android");
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["data"]["deviceId"], "android_1");
        assert_eq!(value["data"]["deviceType"], "android");
        assert!(value["data"]["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_online_report_envelope() {
        let msg = ControlMessage::online_report(
            "android_1",
            "android",
            "203.0.113.7".to_string(),
            42,
            TrafficData {
                upload: 100,
                download: 200,
            },
        );
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "status_report");
        assert_eq!(value["data"]["status"], "online");
        assert_eq!(value["data"]["ipAddress"], "203.0.113.7");
        assert_eq!(value["data"]["duration"], 42);
        assert_eq!(value["data"]["traffic"], json!({"upload": 100, "download": 200}));
    }

    #[test]
    fn test_offline_report_omits_metrics() {
        let msg = ControlMessage::offline_report("android_1", "android");
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        let data = value["data"].as_object().unwrap();

        assert_eq!(data["status"], "offline");
        assert!(!data.contains_key("ipAddress"));
        assert!(!data.contains_key("traffic"));
        assert!(data.contains_key("timestamp"));
    }

    #[test]
    fn test_decode_force_report_without_data() {
        let msg = ControlMessage::decode(r#"{"type":"force_report"}"#).unwrap();
        assert_eq!(msg, ControlMessage::ForceReport(Value::Null));
    }

    #[test]
    fn test_decode_config_update() {
        let msg = ControlMessage::decode(
            r#"{"type":"config_update","data":{"statusReportInterval":60000,"theme":"dark"}}"#,
        )
        .unwrap();

        let ControlMessage::ConfigUpdate(update) = msg else {
            panic!("expected config update");
        };
        assert_eq!(update.status_report_interval(), Some(Duration::from_secs(60)));
        assert_eq!(update.extra.get("theme"), Some(&json!("dark")));
    }

    #[test]
    fn test_config_update_ignores_non_positive_interval() {
        for raw in [
            r#"{"type":"config_update","data":{"statusReportInterval":0}}"#,
            r#"{"type":"config_update","data":{"statusReportInterval":-5}}"#,
            r#"{"type":"config_update","data":{}}"#,
            r#"{"type":"config_update"}"#,
        ] {
            let ControlMessage::ConfigUpdate(update) = ControlMessage::decode(raw).unwrap() else {
                panic!("expected config update for {raw}");
            };
            assert_eq!(update.status_report_interval(), None, "{raw}");
        }
    }

    #[test]
    fn test_decode_failures_are_distinct() {
        assert!(matches!(
            ControlMessage::decode("not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            ControlMessage::decode("[1,2]"),
            Err(DecodeError::Malformed(_))
        ));
        assert_eq!(
            ControlMessage::decode(r#"{"data":{}}"#),
            Err(DecodeError::MissingType)
        );
        assert_eq!(
            ControlMessage::decode(r#"{"type":42}"#),
            Err(DecodeError::MissingType)
        );
        assert_eq!(
            ControlMessage::decode(r#"{"type":"reboot"}"#),
            Err(DecodeError::UnknownType("reboot".to_string()))
        );
        assert!(matches!(
            ControlMessage::decode(r#"{"type":"config_update","data":{"statusReportInterval":"soon"}}"#),
            Err(DecodeError::InvalidPayload {
                msg_type: MessageType::ConfigUpdate,
                ..
            })
        ));
    }

    #[test]
    fn test_decode_outbound_types() {
        let encoded = ControlMessage::heartbeat("dev", "android").encode().unwrap();
        let decoded = ControlMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.message_type(), MessageType::Heartbeat);

        let ack = ControlMessage::decode(r#"{"type":"heartbeat_ack","data":{"rtt":3}}"#).unwrap();
        assert_eq!(ack, ControlMessage::HeartbeatAck(json!({"rtt": 3})));
    }

    #[test]
    fn test_message_type_tags() {
        for ty in [
            MessageType::Heartbeat,
            MessageType::HeartbeatAck,
            MessageType::StatusReport,
            MessageType::ForceReport,
            MessageType::ConfigUpdate,
        ] {
            assert_eq!(MessageType::from_tag(ty.as_str()), Some(ty));
        }
        assert_eq!(MessageType::from_tag("HEARTBEAT"), None);
    }
}
