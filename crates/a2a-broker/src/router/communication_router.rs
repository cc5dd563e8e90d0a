use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    agent_execution::{AgentContext, AgentHandler, HandlerError},
    config::BrokerConfig,
    errors::{BrokerError, ResourceKind},
    events::{StreamEvent, StreamManager},
    registry::AgentRegistry,
    router::correlation::{CorrelationHandle, CorrelationState, CorrelationTable},
    types::{MessageEnvelope, MessageType, SessionId},
};

/// Per-request overrides for [`CommunicationRouter::send_with`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the configured default deadline.
    pub deadline: Option<Duration>,
    /// Session whose stream receives the request's `stream_event` envelopes.
    pub session_id: Option<SessionId>,
}

/// What an accepted [`CommunicationRouter::deliver`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A `stream_event` was appended to the session stream.
    Published { sequence: u64 },
    /// A `response` or `error` resolved the waiting request.
    Resolved,
}

struct RouterInner {
    registry: Arc<AgentRegistry>,
    streams: Arc<dyn StreamManager>,
    table: CorrelationTable,
    default_deadline: Duration,
}

/// Routes requests to agent handlers and matches what comes back to the
/// waiting caller. Cheap to clone.
#[derive(Clone)]
pub struct CommunicationRouter {
    inner: Arc<RouterInner>,
}

impl CommunicationRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        streams: Arc<dyn StreamManager>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry,
                streams,
                table: CorrelationTable::new(config.resolved_history),
                default_deadline: config.default_deadline,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    /// Sends a request with the default deadline.
    pub async fn send(&self, envelope: MessageEnvelope) -> Result<CorrelationHandle, BrokerError> {
        self.send_with(envelope, SendOptions::default()).await
    }

    /// Creates a pending correlation for `envelope`, arms its deadline timer
    /// and hands the request to the destination's handler.
    pub async fn send_with(
        &self,
        envelope: MessageEnvelope,
        options: SendOptions,
    ) -> Result<CorrelationHandle, BrokerError> {
        if envelope.message_type != MessageType::Request {
            return Err(BrokerError::invalid_envelope(format!(
                "send accepts request envelopes, got {}",
                envelope.message_type
            )));
        }
        if envelope.message_id.is_empty() {
            return Err(BrokerError::invalid_envelope("message_id must not be empty"));
        }

        let handler = self
            .inner
            .registry
            .resolve_destination(&envelope.to_agent_id)
            .inspect_err(|e| {
                debug!(to_agent_id = %envelope.to_agent_id, error = %e, "Rejected request");
            })?;

        let timeout = options.deadline.unwrap_or(self.inner.default_deadline);
        let handle = self
            .inner
            .table
            .insert(&envelope, options.session_id, timeout)?;

        // Deregistration marks the agent offline before failing the entries
        // targeting it, so an entry inserted after that scan is caught here.
        if let Err(e) = self
            .inner
            .registry
            .resolve_destination(&envelope.to_agent_id)
        {
            debug!(correlation_id = %envelope.message_id, error = %e, "Destination went away during send");
            let _ = self
                .inner
                .table
                .resolve(&envelope.message_id, CorrelationState::Resolved, Err(e.clone()));
            return Err(e);
        }

        let correlation_id = envelope.message_id.clone();
        let router = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            router.expire(&correlation_id, timeout);
        });
        self.inner
            .table
            .set_timer(&envelope.message_id, timer.abort_handle());

        debug!(
            correlation_id = %envelope.message_id,
            from_agent_id = %envelope.from_agent_id,
            to_agent_id = %envelope.to_agent_id,
            "Dispatching request"
        );
        self.dispatch(handler, envelope);

        Ok(handle)
    }

    fn dispatch(&self, handler: Arc<dyn AgentHandler>, request: MessageEnvelope) {
        let router = self.clone();
        tokio::spawn(async move {
            let ctx = AgentContext::new(request.clone(), router.clone());
            // Run the handler in its own task so a panic surfaces as a JoinError.
            let outcome = tokio::spawn(async move { handler.handle(ctx).await }).await;
            router.complete_dispatch(request, outcome);
        });
    }

    fn complete_dispatch(
        &self,
        request: MessageEnvelope,
        outcome: Result<Result<Option<Value>, HandlerError>, tokio::task::JoinError>,
    ) {
        let correlation_id = request.message_id.clone();
        match outcome {
            Ok(Ok(Some(payload))) => {
                let response = MessageEnvelope::response_to(&request, payload);
                if let Err(e) = self.deliver(response) {
                    debug!(correlation_id = %correlation_id, error = %e, "Handler response was not delivered");
                }
            }
            Ok(Ok(None)) => {
                debug!(correlation_id = %correlation_id, "Handler deferred its response");
            }
            Ok(Err(HandlerError::Unavailable(reason))) => {
                self.inner.registry.mark_degraded(&request.to_agent_id);
                let error = BrokerError::DestinationUnavailable {
                    agent_id: request.to_agent_id.clone(),
                    reason,
                };
                let _ = self
                    .inner
                    .table
                    .resolve(&correlation_id, CorrelationState::Resolved, Err(error));
            }
            Ok(Err(error)) => {
                let envelope = MessageEnvelope::error_to(&request, error.to_payload());
                if let Err(e) = self.deliver(envelope) {
                    debug!(correlation_id = %correlation_id, error = %e, "Handler error was not delivered");
                }
            }
            Err(join_error) => {
                error!(
                    correlation_id = %correlation_id,
                    to_agent_id = %request.to_agent_id,
                    error = %join_error,
                    "Agent handler failed"
                );
                let error = BrokerError::internal(format!(
                    "handler of agent {} failed: {join_error}",
                    request.to_agent_id
                ));
                let _ = self
                    .inner
                    .table
                    .resolve(&correlation_id, CorrelationState::Resolved, Err(error));
            }
        }
    }

    fn expire(&self, correlation_id: &str, timeout: Duration) {
        let error = BrokerError::RequestTimeout {
            correlation_id: correlation_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        if self
            .inner
            .table
            .resolve(correlation_id, CorrelationState::TimedOut, Err(error))
            .is_ok()
        {
            info!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
        }
    }

    /// Accepts a `response`, `error` or `stream_event` envelope sent back by
    /// the destination of a waiting request.
    ///
    /// Envelopes for unknown or already finished correlations are rejected
    /// with `UnknownCorrelation` and leave every other entry untouched.
    pub fn deliver(&self, envelope: MessageEnvelope) -> Result<Delivery, BrokerError> {
        if envelope.message_type == MessageType::Request {
            return Err(BrokerError::invalid_envelope(
                "request envelopes are sent, not delivered",
            ));
        }
        let Some(correlation_id) = envelope.correlation_id.clone() else {
            return Err(BrokerError::invalid_envelope(format!(
                "{} envelope {} has no correlation_id",
                envelope.message_type, envelope.message_id
            )));
        };

        let Some(pending) = self.inner.table.lookup(&correlation_id) else {
            return Err(self.unknown_correlation(&envelope, &correlation_id));
        };

        if envelope.from_agent_id != pending.to_agent_id {
            return Err(BrokerError::invalid_envelope(format!(
                "correlation {correlation_id} is answered by {}, not {}",
                pending.to_agent_id, envelope.from_agent_id
            )));
        }

        match envelope.message_type {
            MessageType::StreamEvent => {
                let Some(session_id) = pending.session_id else {
                    return Err(BrokerError::not_found(ResourceKind::Stream, correlation_id));
                };
                let event = StreamEvent::from_envelope(session_id.clone(), &envelope);
                let sequence = self.inner.streams.publish(&session_id, event)?;
                Ok(Delivery::Published { sequence })
            }
            MessageType::Response => {
                self.inner
                    .table
                    .resolve(&correlation_id, CorrelationState::Resolved, Ok(envelope.clone()))
                    .map_err(|_| self.unknown_correlation(&envelope, &correlation_id))?;
                Ok(Delivery::Resolved)
            }
            MessageType::Error => {
                let error = BrokerError::from_error_payload(&envelope.from_agent_id, &envelope.payload);
                self.inner
                    .table
                    .resolve(&correlation_id, CorrelationState::Resolved, Err(error))
                    .map_err(|_| self.unknown_correlation(&envelope, &correlation_id))?;
                Ok(Delivery::Resolved)
            }
            MessageType::Request => Err(BrokerError::invalid_envelope(
                "request envelopes are sent, not delivered",
            )),
        }
    }

    fn unknown_correlation(&self, envelope: &MessageEnvelope, correlation_id: &str) -> BrokerError {
        warn!(
            correlation_id = %correlation_id,
            message_id = %envelope.message_id,
            message_type = %envelope.message_type,
            from_agent_id = %envelope.from_agent_id,
            final_state = ?self.inner.table.state(correlation_id),
            "Dropping envelope for unknown or finished correlation"
        );
        BrokerError::UnknownCorrelation {
            correlation_id: correlation_id.to_string(),
        }
    }

    /// Stops waiting for a request and best-effort notifies its destination.
    pub async fn cancel(&self, correlation_id: &str) -> Result<(), BrokerError> {
        let error = BrokerError::Cancelled {
            correlation_id: correlation_id.to_string(),
        };
        let request = self
            .inner
            .table
            .resolve(correlation_id, CorrelationState::Cancelled, Err(error))?;

        info!(correlation_id = %correlation_id, to_agent_id = %request.to_agent_id, "Cancelled request");

        if let Some(handler) = self.inner.registry.handler(&request.to_agent_id) {
            let ctx = AgentContext::new(request, self.clone());
            tokio::spawn(async move { handler.cancel(ctx).await });
        }
        Ok(())
    }

    /// Deregisters an agent and fails every request still waiting on it.
    ///
    /// Returns `false` if the agent was unknown or already offline.
    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        let deregistered = self.inner.registry.deregister(agent_id);

        let mut failed = 0;
        for correlation_id in self.inner.table.ids_targeting(agent_id) {
            let error = BrokerError::DestinationUnavailable {
                agent_id: agent_id.to_string(),
                reason: "agent was deregistered".to_string(),
            };
            if self
                .inner
                .table
                .resolve(&correlation_id, CorrelationState::Resolved, Err(error))
                .is_ok()
            {
                failed += 1;
            }
        }

        if failed > 0 {
            warn!(agent_id = %agent_id, failed, "Failed pending requests of deregistered agent");
        }
        deregistered
    }

    /// Sends one request per discoverable agent, optionally restricted to a
    /// capability. Agents that cannot take the request are skipped.
    pub async fn broadcast(
        &self,
        from_agent_id: &str,
        payload: Value,
        capability: Option<&str>,
    ) -> Vec<CorrelationHandle> {
        let recipients = match capability {
            Some(capability) => self.inner.registry.discover(capability).to_vec(),
            None => self.inner.registry.list(),
        };

        let mut handles = Vec::with_capacity(recipients.len());
        for card in recipients {
            if card.agent_id == from_agent_id {
                continue;
            }
            let request = MessageEnvelope::request(from_agent_id, card.agent_id.clone(), payload.clone());
            match self.send(request).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    debug!(to_agent_id = %card.agent_id, error = %e, "Skipping broadcast recipient");
                }
            }
        }
        handles
    }

    pub fn correlation_state(&self, correlation_id: &str) -> Option<CorrelationState> {
        self.inner.table.state(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.table.len()
    }
}
