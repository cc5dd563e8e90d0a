use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::{Serialize, Serializer};
use serde_json::Value;
use shared::error::CommonError;
use thiserror::Error;

use crate::types::{AgentId, CorrelationId, ErrorPayload, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Agent,
    Session,
    Stream,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Agent => f.write_str("agent"),
            ResourceKind::Session => f.write_str("session"),
            ResourceKind::Stream => f.write_str("stream"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("agent {agent_id} is already registered and online")]
    DuplicateAgent { agent_id: AgentId },
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },
    #[error("destination agent {agent_id} is unavailable: {reason}")]
    DestinationUnavailable { agent_id: AgentId, reason: String },
    #[error("no waiting request for correlation id {correlation_id}")]
    UnknownCorrelation { correlation_id: CorrelationId },
    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        correlation_id: CorrelationId,
        timeout_ms: u64,
    },
    #[error("request {correlation_id} was cancelled")]
    Cancelled { correlation_id: CorrelationId },
    #[error("an event stream is already open for session {session_id}")]
    DuplicateStream { session_id: SessionId },
    #[error("session {session_id} already exists")]
    DuplicateSession { session_id: SessionId },
    #[error("event stream for session {session_id} is full ({capacity} buffered events)")]
    StreamBackpressure {
        session_id: SessionId,
        capacity: usize,
    },
    #[error("event stream for session {session_id} is closed")]
    StreamClosed { session_id: SessionId },
    #[error("event stream for session {session_id} already has a subscriber")]
    SubscriberAttached { session_id: SessionId },
    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },
    #[error("agent {agent_id} failed: {message}")]
    AgentFailure {
        agent_id: AgentId,
        code: String,
        message: String,
        data: Option<Value>,
    },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl BrokerError {
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        BrokerError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_envelope(reason: impl Into<String>) -> Self {
        BrokerError::InvalidEnvelope {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        BrokerError::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable error code, also used on the wire.
    pub fn code(&self) -> &str {
        match self {
            BrokerError::DuplicateAgent { .. } => "duplicate_agent",
            BrokerError::NotFound { .. } => "not_found",
            BrokerError::DestinationUnavailable { .. } => "destination_unavailable",
            BrokerError::UnknownCorrelation { .. } => "unknown_correlation",
            BrokerError::RequestTimeout { .. } => "request_timeout",
            BrokerError::Cancelled { .. } => "cancelled",
            BrokerError::DuplicateStream { .. } => "duplicate_stream",
            BrokerError::DuplicateSession { .. } => "duplicate_session",
            BrokerError::StreamBackpressure { .. } => "stream_backpressure",
            BrokerError::StreamClosed { .. } => "stream_closed",
            BrokerError::SubscriberAttached { .. } => "subscriber_attached",
            BrokerError::InvalidEnvelope { .. } => "invalid_envelope",
            BrokerError::AgentFailure { code, .. } => code.as_str(),
            BrokerError::Internal { .. } => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            BrokerError::AgentFailure { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            BrokerError::AgentFailure { data, .. } => data.clone(),
            _ => None,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self.message(),
            data: self.data(),
        }
    }

    /// Interprets the payload of an `error` envelope sent by `agent_id`.
    ///
    /// Agents are expected to send an `ErrorPayload`, anything else is kept
    /// verbatim as `data`.
    pub fn from_error_payload(agent_id: &str, payload: &Value) -> Self {
        match serde_json::from_value::<ErrorPayload>(payload.clone()) {
            Ok(error) => BrokerError::AgentFailure {
                agent_id: agent_id.to_string(),
                code: error.code,
                message: error.message,
                data: error.data,
            },
            Err(_) => BrokerError::AgentFailure {
                agent_id: agent_id.to_string(),
                code: "agent_error".to_string(),
                message: "agent returned an error".to_string(),
                data: Some(payload.clone()),
            },
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::DuplicateAgent { .. }
            | BrokerError::DuplicateStream { .. }
            | BrokerError::DuplicateSession { .. }
            | BrokerError::SubscriberAttached { .. } => StatusCode::CONFLICT,
            BrokerError::NotFound { .. } | BrokerError::UnknownCorrelation { .. } => {
                StatusCode::NOT_FOUND
            }
            BrokerError::DestinationUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::Cancelled { .. } | BrokerError::StreamClosed { .. } => StatusCode::GONE,
            BrokerError::StreamBackpressure { .. } => StatusCode::TOO_MANY_REQUESTS,
            BrokerError::InvalidEnvelope { .. } => StatusCode::BAD_REQUEST,
            BrokerError::AgentFailure { .. } => StatusCode::BAD_GATEWAY,
            BrokerError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Serialize for BrokerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_payload().serialize(serializer)
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_payload())).into_response()
    }
}

impl From<BrokerError> for CommonError {
    fn from(e: BrokerError) -> Self {
        CommonError::InvalidRequest {
            msg: e.to_string(),
            source: Some(anyhow::Error::from(e)),
        }
    }
}
