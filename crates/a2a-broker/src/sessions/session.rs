use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{AgentId, CorrelationId, ErrorPayload, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

/// Stored state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    pub from_agent_id: AgentId,
    pub to_agent_id: AgentId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl SessionRecord {
    pub fn new(
        session_id: impl Into<SessionId>,
        from_agent_id: impl Into<AgentId>,
        to_agent_id: impl Into<AgentId>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            correlation_id: None,
            from_agent_id: from_agent_id.into(),
            to_agent_id: to_agent_id.into(),
            status: SessionStatus::Active,
            created_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        }
    }
}

/// A caller's request to start a session.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct SessionRequest {
    /// Generated when not set.
    #[builder(default, setter(strip_option))]
    pub session_id: Option<SessionId>,
    pub from_agent_id: AgentId,
    pub to_agent_id: AgentId,
    #[builder(default)]
    pub payload: Value,
    /// Overrides the broker's default deadline.
    #[builder(default, setter(strip_option))]
    pub deadline: Option<Duration>,
}
