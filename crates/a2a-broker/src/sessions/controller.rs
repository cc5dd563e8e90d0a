use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::{
    errors::{BrokerError, ResourceKind},
    events::{CloseReason, EventSubscription, StreamManager},
    router::{CommunicationRouter, SendOptions},
    sessions::{
        session::{SessionRecord, SessionRequest, SessionStatus},
        store::SessionStore,
    },
    types::{CorrelationId, MessageEnvelope, SessionId, new_session_id},
};

/// Terminal outcome of a session: the response payload or the error.
pub type SessionOutcome = Result<Value, BrokerError>;

struct ControllerInner {
    router: CommunicationRouter,
    streams: Arc<dyn StreamManager>,
    store: Arc<dyn SessionStore>,
}

/// Ties each session to its pending correlation and its event stream, and
/// releases both exactly once whichever way the session ends.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(
        router: CommunicationRouter,
        streams: Arc<dyn StreamManager>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                router,
                streams,
                store,
            }),
        }
    }

    /// Creates the session, opens its stream and sends the request.
    ///
    /// If the request cannot be sent the session is failed, its stream is
    /// closed and the error is returned.
    pub async fn start(&self, request: SessionRequest) -> Result<SessionHandle, BrokerError> {
        let session_id = request.session_id.unwrap_or_else(new_session_id);
        let envelope = MessageEnvelope::request(
            request.from_agent_id.clone(),
            request.to_agent_id.clone(),
            request.payload,
        );
        let correlation_id = envelope.message_id.clone();

        let mut record = SessionRecord::new(
            session_id.clone(),
            request.from_agent_id,
            request.to_agent_id,
        );
        record.correlation_id = Some(correlation_id.clone());
        self.inner.store.insert(record).await?;

        let events = match self
            .inner
            .streams
            .open(&session_id)
            .and_then(|stream| stream.subscribe())
        {
            Ok(events) => events,
            Err(e) => {
                self.finish(&session_id, Err(e.clone())).await;
                return Err(e);
            }
        };

        let options = SendOptions {
            deadline: request.deadline,
            session_id: Some(session_id.clone()),
        };
        let correlation = match self.inner.router.send_with(envelope, options).await {
            Ok(correlation) => correlation,
            Err(e) => {
                self.finish(&session_id, Err(e.clone())).await;
                return Err(e);
            }
        };

        // A cancel that ran before the request was in flight already
        // finished the session.
        if let Some(record) = self.inner.store.get(&session_id).await {
            if record.status.is_terminal() {
                let _ = self.inner.router.cancel(&correlation_id).await;
                return Err(BrokerError::Cancelled { correlation_id });
            }
        }

        info!(session_id = %session_id, correlation_id = %correlation_id, "Session started");

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let controller = self.clone();
        let supervised_id = session_id.clone();
        tokio::spawn(async move {
            let outcome = correlation
                .into_result()
                .await
                .map(|response| response.payload);
            let outcome = controller.finish(&supervised_id, outcome).await;
            let _ = outcome_tx.send(outcome);
        });

        Ok(SessionHandle {
            session_id,
            correlation_id,
            events: Some(events),
            outcome: Some(outcome_rx),
            controller: self.clone(),
            finished: false,
        })
    }

    /// Moves the session to its terminal status and closes its stream, once.
    async fn finish(&self, session_id: &str, outcome: SessionOutcome) -> SessionOutcome {
        let (status, reason) = match &outcome {
            Ok(_) => (SessionStatus::Completed, CloseReason::Completed),
            Err(e @ BrokerError::RequestTimeout { .. }) => {
                (SessionStatus::Expired, CloseReason::from_error(e))
            }
            Err(e) => (SessionStatus::Failed, CloseReason::from_error(e)),
        };
        let (result, error) = match &outcome {
            Ok(payload) => (Some(payload.clone()), None),
            Err(e) => (None, Some(e.to_payload())),
        };

        if let Some(record) = self
            .inner
            .store
            .finish(session_id, status, result, error)
            .await
        {
            self.inner.streams.close(session_id, reason);
            info!(session_id = %session_id, status = ?record.status, "Session finished");
        }
        outcome
    }

    /// Cancels an active session. Cancelling a finished session is a no-op.
    pub async fn cancel(&self, session_id: &str) -> Result<(), BrokerError> {
        let record = self
            .inner
            .store
            .get(session_id)
            .await
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Session, session_id))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        let Some(correlation_id) = record.correlation_id else {
            return Ok(());
        };

        match self.inner.router.cancel(&correlation_id).await {
            Ok(()) => {
                self.finish(
                    session_id,
                    Err(BrokerError::Cancelled {
                        correlation_id: correlation_id.clone(),
                    }),
                )
                .await;
                Ok(())
            }
            // Not sent yet; `start` sees the terminal record and stops.
            Err(BrokerError::UnknownCorrelation { .. })
                if self.inner.router.correlation_state(&correlation_id).is_none() =>
            {
                self.finish(
                    session_id,
                    Err(BrokerError::Cancelled {
                        correlation_id: correlation_id.clone(),
                    }),
                )
                .await;
                Ok(())
            }
            // The correlation already resolved; its supervisor finishes the session.
            Err(BrokerError::UnknownCorrelation { .. }) => {
                debug!(session_id = %session_id, "Cancel raced with resolution");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn session(&self, session_id: &str) -> Result<SessionRecord, BrokerError> {
        self.inner
            .store
            .get(session_id)
            .await
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Session, session_id))
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.store.active_count().await
    }
}

/// The caller's side of a started session.
///
/// Dropping the handle before [`SessionHandle::result`] completes cancels
/// the session.
pub struct SessionHandle {
    session_id: SessionId,
    correlation_id: CorrelationId,
    events: Option<EventSubscription>,
    outcome: Option<oneshot::Receiver<SessionOutcome>>,
    controller: SessionController,
    finished: bool,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Takes the event subscription. Returns `None` after the first call.
    pub fn events(&mut self) -> Option<EventSubscription> {
        self.events.take()
    }

    /// Waits for the terminal outcome.
    pub async fn result(mut self) -> SessionOutcome {
        let outcome = match self.outcome.take() {
            Some(receiver) => receiver
                .await
                .unwrap_or_else(|_| Err(BrokerError::internal("session supervisor stopped"))),
            None => Err(BrokerError::internal("session outcome already taken")),
        };
        self.finished = true;
        outcome
    }

    pub async fn status(&self) -> Result<SessionStatus, BrokerError> {
        self.controller
            .session(&self.session_id)
            .await
            .map(|record| record.status)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let controller = self.controller.clone();
        let session_id = self.session_id.clone();
        runtime.spawn(async move {
            if let Err(e) = controller.cancel(&session_id).await {
                debug!(session_id = %session_id, error = %e, "Cancel on disconnect failed");
            }
        });
    }
}
