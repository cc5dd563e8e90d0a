use serde_json::Value;

use crate::{
    agent_execution::agent_handler::HandlerError,
    errors::BrokerError,
    events::typed_payload,
    router::{CommunicationRouter, Delivery},
    types::{AgentId, CorrelationId, MessageEnvelope},
};

/// Agent Context.
///
/// Handed to an [`AgentHandler`](crate::agent_execution::AgentHandler) for
/// every request. Everything an agent sends back for the request goes through
/// [`CommunicationRouter::deliver`] as a correlated envelope, exactly as an
/// out-of-process agent would send it.
#[derive(Clone)]
pub struct AgentContext {
    request: MessageEnvelope,
    router: CommunicationRouter,
}

impl AgentContext {
    pub(crate) fn new(request: MessageEnvelope, router: CommunicationRouter) -> Self {
        Self { request, router }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.request
    }

    pub fn payload(&self) -> &Value {
        &self.request.payload
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.request.message_id
    }

    pub fn caller(&self) -> &AgentId {
        &self.request.from_agent_id
    }

    /// Publishes an intermediate event to the caller's session stream and
    /// returns its sequence number.
    pub fn publish(&self, data: Value) -> Result<u64, BrokerError> {
        self.publish_envelope(MessageEnvelope::stream_event_for(&self.request, data))
    }

    /// Like [`AgentContext::publish`], with an explicit event type such as
    /// `"agent_message"` or `"heartbeat"`.
    pub fn publish_as(&self, event_type: impl Into<String>, data: Value) -> Result<u64, BrokerError> {
        let payload = typed_payload(event_type, data);
        self.publish_envelope(MessageEnvelope::stream_event_for(&self.request, payload))
    }

    fn publish_envelope(&self, envelope: MessageEnvelope) -> Result<u64, BrokerError> {
        match self.router.deliver(envelope)? {
            Delivery::Published { sequence } => Ok(sequence),
            Delivery::Resolved => Err(BrokerError::internal(
                "stream event resolved a correlation",
            )),
        }
    }

    /// Sends the final answer.
    pub fn respond(&self, payload: Value) -> Result<(), BrokerError> {
        let envelope = MessageEnvelope::response_to(&self.request, payload);
        self.router.deliver(envelope).map(|_| ())
    }

    /// Sends a failure as the final answer.
    pub fn fail(&self, error: HandlerError) -> Result<(), BrokerError> {
        let envelope = MessageEnvelope::error_to(&self.request, error.to_payload());
        self.router.deliver(envelope).map(|_| ())
    }
}
