//! Wire protocol message types.
//!
//! Every frame is a single UTF-8 JSON object:
//!
//! ```json
//! {"type": "start_scan", "payload": {...}, "timestamp": 1700000000.5, "session_token": "..."}
//! ```
//!
//! The `type` string is decoded into the closed [`MessageType`] union at the
//! boundary. Names the substrate does not recognise decode to
//! [`MessageType::Unknown`] so callers can log and drop them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::WireError;

/// Fields that routing adds to forwarded messages.
pub const TARGET_AGENT_FIELD: &str = "target_agent_id";

/// The kind of a wire message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    AuthChallenge,
    AuthResponse,
    AuthSuccess,
    AuthFailure,
    Heartbeat,
    HeartbeatAck,
    AgentConnected,
    AgentDisconnected,
    AgentList,
    /// Routing or protocol error reported back to a sender.
    Error,
    /// Controller → agent work command (`start_*`, `stop`, `get_status`, `update_config`).
    Command(String),
    /// Agent → controller result (`*_progress`, `*_stats`, `*_results`,
    /// `status_update`, `log_info|log_warning|log_error`).
    Report(String),
    /// Anything else. Never forwarded or delivered.
    Unknown(String),
}

impl MessageType {
    /// Classify a raw `type` string.
    pub fn parse(name: &str) -> Self {
        match name {
            "auth_challenge" => Self::AuthChallenge,
            "auth_response" => Self::AuthResponse,
            "auth_success" => Self::AuthSuccess,
            "auth_failure" => Self::AuthFailure,
            "heartbeat" => Self::Heartbeat,
            "heartbeat_ack" => Self::HeartbeatAck,
            "agent_connected" => Self::AgentConnected,
            "agent_disconnected" => Self::AgentDisconnected,
            "agent_list" => Self::AgentList,
            "error" => Self::Error,
            other if is_command_name(other) => Self::Command(other.to_string()),
            other if is_report_name(other) => Self::Report(other.to_string()),
            other => Self::Unknown(other.to_string()),
        }
    }

    /// The wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::AuthChallenge => "auth_challenge",
            Self::AuthResponse => "auth_response",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailure => "auth_failure",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::AgentConnected => "agent_connected",
            Self::AgentDisconnected => "agent_disconnected",
            Self::AgentList => "agent_list",
            Self::Error => "error",
            Self::Command(name) | Self::Report(name) | Self::Unknown(name) => name,
        }
    }

    /// Application traffic that the substrate delivers to collaborators.
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Command(_) | Self::Report(_))
    }

    /// The two handshake message types a listener accepts pre-auth.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::AuthChallenge | Self::AuthResponse | Self::AuthSuccess | Self::AuthFailure
        )
    }
}

fn is_command_name(name: &str) -> bool {
    matches!(name, "stop" | "get_status" | "update_config")
        || name
            .strip_prefix("start_")
            .is_some_and(|rest| !rest.is_empty())
}

fn is_report_name(name: &str) -> bool {
    if matches!(
        name,
        "status_update" | "log_info" | "log_warning" | "log_error"
    ) {
        return true;
    }
    ["_progress", "_stats", "_results"]
        .iter()
        .any(|suffix| name.len() > suffix.len() && name.ends_with(suffix))
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        Ok(Self::parse(&name))
    }
}

/// Which side of the protocol a connector plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Controller,
    Agent,
}

impl PeerRole {
    /// Case-insensitive parse of a `client_type` value.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "controller" => Some(Self::Controller),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An addressed message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message kind.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Opaque payload, delivered verbatim.
    #[serde(default = "empty_payload")]
    pub payload: Value,
    /// Seconds since the UNIX epoch at creation.
    #[serde(default = "unix_timestamp")]
    pub timestamp: f64,
    /// Session token; required on every post-auth frame from a connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Relay tag: controller that issued a forwarded command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_controller: Option<String>,
    /// Relay tag: agent that produced a forwarded report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent_id: Option<String>,
    /// Relay tag: display name of that agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent_name: Option<String>,
    /// Unrecognised top-level fields, kept for compatibility.
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// Current wall-clock time as fractional UNIX seconds.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

impl WireMessage {
    /// Create a message with the current timestamp and no token.
    pub fn new(message_type: MessageType, payload: Value) -> Self {
        Self {
            message_type,
            payload,
            timestamp: unix_timestamp(),
            session_token: None,
            source_controller: None,
            source_agent_id: None,
            source_agent_name: None,
            extra: Map::new(),
        }
    }

    /// Attach a session token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// A bare heartbeat.
    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, empty_payload())
    }

    /// A heartbeat acknowledgement carrying the listener's clock.
    pub fn heartbeat_ack() -> Self {
        Self::new(
            MessageType::HeartbeatAck,
            serde_json::json!({ "timestamp": unix_timestamp() }),
        )
    }

    /// An `error` message for the sender.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            serde_json::to_value(ErrorPayload {
                message: message.into(),
            })
            .unwrap_or_else(|_| empty_payload()),
        )
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(WireError::Protocol("frame is not a JSON object".to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Look up a string field in the payload, falling back to a top-level field.
    ///
    /// Older listeners put handshake values (`challenge`, `session_token`,
    /// `reason`) at the top level instead of inside `payload`.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .or_else(|| self.extra.get(key).and_then(Value::as_str))
    }

    /// The unicast target carried in the payload or at the top level, if any.
    pub fn target_agent_id(&self) -> Option<&str> {
        self.field_str(TARGET_AGENT_FIELD).filter(|id| !id.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Payload schemas
// ---------------------------------------------------------------------------

/// `auth_challenge` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub challenge: String,
}

/// `auth_response` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponsePayload {
    /// Hex HMAC-SHA256(shared_secret, challenge).
    #[serde(alias = "hmac")]
    pub response: String,
    /// `controller` or `agent`.
    #[serde(default)]
    pub client_type: String,
    /// Human-readable name.
    #[serde(default, alias = "name", alias = "slave_name")]
    pub display_name: String,
    /// Suggested persistent peer id.
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Free-form metadata stored on the session.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_info: Map<String, Value>,
}

/// `auth_success` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSuccessPayload {
    pub session_token: String,
    /// The peer id the listener registered this connection under.
    #[serde(default)]
    pub peer_id: String,
}

/// `auth_failure` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailurePayload {
    pub reason: String,
}

/// `error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Public view of a connected agent, as pushed to controllers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    #[serde(alias = "id")]
    pub agent_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: String,
    /// UNIX seconds.
    #[serde(default)]
    pub connected_at: f64,
    /// `online` or `offline`.
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_info: Map<String, Value>,
}

/// `agent_disconnected` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDisconnectedPayload {
    #[serde(alias = "id")]
    pub agent_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub reason: String,
}

/// `agent_list` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentListPayload {
    pub agents: Vec<AgentSummary>,
}

/// Map a log level to its report type. Unknown levels map to `log_info`.
pub fn log_message_type(level: &str) -> MessageType {
    let name = match level.trim().to_ascii_lowercase().as_str() {
        "warning" | "warn" => "log_warning",
        "error" => "log_error",
        _ => "log_info",
    };
    MessageType::Report(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_control_types() {
        assert_eq!(MessageType::parse("auth_challenge"), MessageType::AuthChallenge);
        assert_eq!(MessageType::parse("heartbeat_ack"), MessageType::HeartbeatAck);
        assert_eq!(MessageType::parse("agent_list"), MessageType::AgentList);
        assert_eq!(MessageType::parse("error"), MessageType::Error);
    }

    #[test]
    fn test_parse_command_and_report_families() {
        assert_eq!(
            MessageType::parse("start_scan"),
            MessageType::Command("start_scan".into())
        );
        assert!(matches!(MessageType::parse("stop"), MessageType::Command(_)));
        assert!(matches!(MessageType::parse("update_config"), MessageType::Command(_)));
        assert!(matches!(MessageType::parse("check_progress"), MessageType::Report(_)));
        assert!(matches!(MessageType::parse("traffic_stats"), MessageType::Report(_)));
        assert!(matches!(MessageType::parse("scan_results"), MessageType::Report(_)));
        assert!(matches!(MessageType::parse("log_warning"), MessageType::Report(_)));
        assert!(matches!(MessageType::parse("status_update"), MessageType::Report(_)));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            MessageType::parse("start_"),
            MessageType::Unknown("start_".into())
        );
        assert_eq!(
            MessageType::parse("_stats"),
            MessageType::Unknown("_stats".into())
        );
        assert_eq!(
            MessageType::parse("reboot"),
            MessageType::Unknown("reboot".into())
        );
        assert!(!MessageType::parse("reboot").is_application());
    }

    #[test]
    fn test_family_boundaries() {
        assert!(matches!(MessageType::parse("start_check"), MessageType::Command(_)));
        assert!(matches!(MessageType::parse("check_progress"), MessageType::Report(_)));
        assert!(matches!(MessageType::parse("start_"), MessageType::Unknown(_)));
        assert!(matches!(MessageType::parse("_stats"), MessageType::Unknown(_)));
    }

    #[test]
    fn test_decode_minimal_frame() {
        let msg = WireMessage::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg.message_type, MessageType::Heartbeat);
        assert!(msg.payload.as_object().unwrap().is_empty());
        assert!(msg.timestamp > 0.0);
        assert!(msg.session_token.is_none());
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert!(WireMessage::decode("[1,2,3]").is_err());
        assert!(WireMessage::decode("not json").is_err());
        assert!(WireMessage::decode(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_encode_omits_empty_optionals() {
        let msg = WireMessage::new(MessageType::parse("stop"), json!({}));
        let text = msg.encode().unwrap();
        assert!(text.contains(r#""type":"stop""#));
        assert!(!text.contains("session_token"));
        assert!(!text.contains("source_agent_id"));
    }

    #[test]
    fn test_payload_survives_verbatim() {
        let payload = json!({"urls": ["a", "b"], "nested": {"n": 1.5, "flag": null}});
        let msg = WireMessage::new(MessageType::parse("start_scan"), payload.clone())
            .with_token("tok");
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.session_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_field_str_falls_back_to_top_level() {
        let msg =
            WireMessage::decode(r#"{"type":"auth_challenge","challenge":"abc"}"#).unwrap();
        assert_eq!(msg.field_str("challenge"), Some("abc"));

        let msg = WireMessage::decode(r#"{"type":"auth_challenge","payload":{"challenge":"xyz"}}"#)
            .unwrap();
        assert_eq!(msg.field_str("challenge"), Some("xyz"));
    }

    #[test]
    fn test_target_agent_id() {
        let msg = WireMessage::new(
            MessageType::parse("stop"),
            json!({"target_agent_id": "agent-7"}),
        );
        assert_eq!(msg.target_agent_id(), Some("agent-7"));
        let msg = WireMessage::new(MessageType::parse("stop"), json!({"target_agent_id": ""}));
        assert_eq!(msg.target_agent_id(), None);

        let msg = WireMessage::decode(r#"{"type":"command","target_agent_id":"a1","payload":{}}"#)
            .unwrap();
        assert_eq!(msg.message_type, MessageType::Unknown("command".into()));
        assert_eq!(msg.target_agent_id(), Some("a1"));
    }

    #[test]
    fn test_auth_response_aliases() {
        let payload: AuthResponsePayload = serde_json::from_value(json!({
            "response": "deadbeef",
            "client_type": "agent",
            "name": "worker-1",
            "id": "w1"
        }))
        .unwrap();
        assert_eq!(payload.display_name, "worker-1");
        assert_eq!(payload.peer_id.as_deref(), Some("w1"));
    }

    #[test]
    fn test_peer_role_parse() {
        assert_eq!(PeerRole::parse("Agent"), Some(PeerRole::Agent));
        assert_eq!(PeerRole::parse(" controller "), Some(PeerRole::Controller));
        assert_eq!(PeerRole::parse("admin"), None);
    }

    #[test]
    fn test_log_message_type() {
        assert_eq!(log_message_type("warning").as_str(), "log_warning");
        assert_eq!(log_message_type("ERROR").as_str(), "log_error");
        assert_eq!(log_message_type("debug").as_str(), "log_info");
    }
}
