use async_trait::async_trait;
use serde_json::Value;

use crate::{agent_execution::context::AgentContext, errors::BrokerError, types::ErrorPayload};

/// Agent Handler interface.
///
/// Implementations receive requests routed to the agent they were registered
/// with. A handler either answers synchronously by returning `Ok(Some(..))`,
/// or returns `Ok(None)` and answers later through the [`AgentContext`]
/// (which it may clone and move into a background task). Stream events can be
/// published through the context at any point before the answer.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, ctx: AgentContext) -> Result<Option<Value>, HandlerError>;

    /// Notifies the agent that the caller gave up on a request.
    ///
    /// Best effort: the correlation is already cancelled when this runs.
    async fn cancel(&self, _ctx: AgentContext) {}
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// The agent could not be reached at all. The agent is degraded and the
    /// caller fails fast with `destination_unavailable`.
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    /// The agent was reached and reported a failure, delivered to the caller
    /// as an `error` envelope.
    #[error("{code}: {message}")]
    Failed {
        code: String,
        message: String,
        data: Option<Value>,
    },
}

impl HandlerError {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Failed {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            HandlerError::Unavailable(reason) => ErrorPayload::new("agent_unavailable", reason.clone()),
            HandlerError::Failed {
                code,
                message,
                data,
            } => ErrorPayload {
                code: code.clone(),
                message: message.clone(),
                data: data.clone(),
            },
        }
    }
}

impl From<BrokerError> for HandlerError {
    fn from(e: BrokerError) -> Self {
        HandlerError::Failed {
            code: e.code().to_string(),
            message: e.message(),
            data: e.data(),
        }
    }
}

impl From<ErrorPayload> for HandlerError {
    fn from(e: ErrorPayload) -> Self {
        HandlerError::Failed {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}
