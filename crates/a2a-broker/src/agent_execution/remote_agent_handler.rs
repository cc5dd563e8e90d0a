use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    agent_execution::{
        agent_handler::{AgentHandler, HandlerError},
        context::AgentContext,
    },
    types::ErrorPayload,
};

/// Forwards requests to an agent running behind an HTTP endpoint.
///
/// The request envelope is POSTed as JSON to the endpoint:
/// - `200` carries the response payload in the body.
/// - `202` means the agent accepted the request and will answer later by
///   posting correlated envelopes to the broker's `/messages` route.
/// - other `4xx` statuses fail the request with the returned error payload.
/// - `5xx` or a transport error marks the agent unavailable.
pub struct RemoteAgentHandler {
    client: Arc<reqwest::Client>,
    endpoint: String,
}

impl RemoteAgentHandler {
    pub fn new(client: Arc<reqwest::Client>, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn cancel_url(&self) -> String {
        format!("{}/cancel", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl AgentHandler for RemoteAgentHandler {
    async fn handle(&self, ctx: AgentContext) -> Result<Option<Value>, HandlerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(ctx.envelope())
            .send()
            .await
            .map_err(|e| {
                error!(endpoint = %self.endpoint, error = %e, "Error sending request to remote agent");
                HandlerError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        debug!(
            endpoint = %self.endpoint,
            correlation_id = %ctx.correlation_id(),
            status = %status,
            "Remote agent replied"
        );

        if status == StatusCode::ACCEPTED {
            return Ok(None);
        }

        if status.is_server_error() {
            return Err(HandlerError::Unavailable(format!(
                "remote agent returned {status}"
            )));
        }

        let body: Value = if status == StatusCode::NO_CONTENT {
            Value::Null
        } else {
            response.json().await.map_err(|e| HandlerError::Failed {
                code: "invalid_agent_response".to_string(),
                message: format!("remote agent returned a body that is not JSON: {e}"),
                data: None,
            })?
        };

        if status.is_success() {
            return Ok(Some(body));
        }

        let payload = serde_json::from_value::<ErrorPayload>(body.clone()).unwrap_or_else(|_| {
            ErrorPayload {
                code: "agent_rejected".to_string(),
                message: format!("remote agent returned {status}"),
                data: Some(body),
            }
        });
        Err(payload.into())
    }

    async fn cancel(&self, ctx: AgentContext) {
        let url = self.cancel_url();
        match self.client.post(&url).json(ctx.envelope()).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, correlation_id = %ctx.correlation_id(), "Cancellation sent");
            }
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "Remote agent rejected cancellation");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Error sending cancellation to remote agent");
            }
        }
    }
}
