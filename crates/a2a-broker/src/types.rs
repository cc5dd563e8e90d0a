use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type AgentId = String;
pub type MessageId = String;
pub type CorrelationId = String;
pub type SessionId = String;

/// Kind of a wire-level message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Error,
    StreamEvent,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Error => "error",
            MessageType::StreamEvent => "stream_event",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message envelope exchanged between agents.
///
/// Field names are part of the wire format and shared with independently
/// written agents, so they must not be renamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    pub from_agent_id: AgentId,
    pub to_agent_id: AgentId,
    pub message_type: MessageType,
    /// The originating request's `message_id`; `None` only for requests.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Creates a request envelope with a freshly generated `message_id`.
    pub fn request(
        from_agent_id: impl Into<AgentId>,
        to_agent_id: impl Into<AgentId>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            from_agent_id: from_agent_id.into(),
            to_agent_id: to_agent_id.into(),
            message_type: MessageType::Request,
            correlation_id: None,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn response_to(request: &MessageEnvelope, payload: Value) -> Self {
        Self::reply(request, MessageType::Response, payload)
    }

    pub fn error_to(request: &MessageEnvelope, error: ErrorPayload) -> Self {
        let payload = serde_json::to_value(&error).unwrap_or(Value::Null);
        Self::reply(request, MessageType::Error, payload)
    }

    pub fn stream_event_for(request: &MessageEnvelope, payload: Value) -> Self {
        Self::reply(request, MessageType::StreamEvent, payload)
    }

    fn reply(request: &MessageEnvelope, message_type: MessageType, payload: Value) -> Self {
        Self {
            message_id: new_message_id(),
            from_agent_id: request.to_agent_id.clone(),
            to_agent_id: request.from_agent_id.clone(),
            message_type,
            correlation_id: Some(request.message_id.clone()),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Payload carried by `error` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }
}

pub fn new_message_id() -> MessageId {
    Uuid::new_v4().to_string()
}

pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape_keeps_field_names() {
        let request = MessageEnvelope::request("caller", "weather", json!({"city": "Seoul"}));
        let value = serde_json::to_value(&request).unwrap();

        for field in [
            "message_id",
            "from_agent_id",
            "to_agent_id",
            "message_type",
            "correlation_id",
            "payload",
            "created_at",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(value["message_type"], "request");
        assert!(value["correlation_id"].is_null());
    }

    #[test]
    fn test_replies_swap_direction_and_correlate() {
        let request = MessageEnvelope::request("caller", "weather", json!({}));

        let response = MessageEnvelope::response_to(&request, json!({"temp_c": 18}));
        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.from_agent_id, "weather");
        assert_eq!(response.to_agent_id, "caller");
        assert_eq!(response.correlation_id.as_deref(), Some(request.message_id.as_str()));
        assert_ne!(response.message_id, request.message_id);

        let error = MessageEnvelope::error_to(&request, ErrorPayload::new("bad_city", "no such city"));
        assert_eq!(error.message_type, MessageType::Error);
        assert_eq!(error.payload["code"], "bad_city");
    }

    #[test]
    fn test_envelope_deserializes_from_independent_agent() {
        let json = r#"{
            "message_id": "m-2",
            "from_agent_id": "weather",
            "to_agent_id": "caller",
            "message_type": "stream_event",
            "correlation_id": "m-1",
            "payload": {"status": "searching"}
        }"#;

        let envelope: MessageEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.message_type, MessageType::StreamEvent);
        assert_eq!(envelope.correlation_id.as_deref(), Some("m-1"));
        assert_eq!(envelope.payload["status"], "searching");
    }
}
