use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::{
    errors::BrokerError,
    types::{AgentId, CorrelationId, MessageEnvelope, SessionId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationState {
    Waiting,
    Resolved,
    TimedOut,
    Cancelled,
}

/// The single outcome of a correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub correlation_id: CorrelationId,
    pub state: CorrelationState,
    /// The `response` envelope, or the error the caller observes.
    pub result: Result<MessageEnvelope, BrokerError>,
}

impl Resolution {
    pub fn into_result(self) -> Result<MessageEnvelope, BrokerError> {
        self.result
    }
}

pub(crate) struct PendingCorrelation {
    pub(crate) correlation_id: CorrelationId,
    pub(crate) from_agent_id: AgentId,
    pub(crate) to_agent_id: AgentId,
    pub(crate) session_id: Option<SessionId>,
    pub(crate) timeout: Duration,
    request: MessageEnvelope,
    waker: oneshot::Sender<Resolution>,
    timer: Option<AbortHandle>,
}

/// Read-only copy of a waiting entry.
#[derive(Debug, Clone)]
pub(crate) struct PendingView {
    pub(crate) from_agent_id: AgentId,
    pub(crate) to_agent_id: AgentId,
    pub(crate) session_id: Option<SessionId>,
    pub(crate) timeout: Duration,
}

struct ResolvedHistory {
    states: HashMap<CorrelationId, CorrelationState>,
    order: VecDeque<CorrelationId>,
    capacity: usize,
}

impl ResolvedHistory {
    fn record(&mut self, correlation_id: CorrelationId, state: CorrelationState) {
        if self.capacity == 0 {
            return;
        }
        if self.states.insert(correlation_id.clone(), state).is_none() {
            self.order.push_back(correlation_id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.states.remove(&evicted);
            }
        }
    }
}

/// Pending correlation entries keyed by `correlation_id`.
///
/// Removing an entry from the map is the only way to resolve it, so when a
/// response, an error, a timeout and a cancellation race, exactly one of
/// them gets the entry and the others see it as unknown.
pub(crate) struct CorrelationTable {
    pending: DashMap<CorrelationId, PendingCorrelation>,
    history: Mutex<ResolvedHistory>,
}

impl CorrelationTable {
    pub(crate) fn new(history_capacity: usize) -> Self {
        Self {
            pending: DashMap::new(),
            history: Mutex::new(ResolvedHistory {
                states: HashMap::new(),
                order: VecDeque::new(),
                capacity: history_capacity,
            }),
        }
    }

    /// Creates a waiting entry for `request` and returns the caller's handle.
    pub(crate) fn insert(
        &self,
        request: &MessageEnvelope,
        session_id: Option<SessionId>,
        timeout: Duration,
    ) -> Result<CorrelationHandle, BrokerError> {
        let correlation_id = request.message_id.clone();
        if self.history.lock().states.contains_key(&correlation_id) {
            return Err(BrokerError::invalid_envelope(format!(
                "message_id {correlation_id} was already used by a finished request"
            )));
        }

        let (waker, receiver) = oneshot::channel();

        match self.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => {
                return Err(BrokerError::invalid_envelope(format!(
                    "message_id {correlation_id} is already in flight"
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingCorrelation {
                    correlation_id: correlation_id.clone(),
                    from_agent_id: request.from_agent_id.clone(),
                    to_agent_id: request.to_agent_id.clone(),
                    session_id,
                    timeout,
                    request: request.clone(),
                    waker,
                    timer: None,
                });
            }
        }

        debug!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "Created pending correlation");

        Ok(CorrelationHandle {
            correlation_id,
            receiver,
            resolution: None,
        })
    }

    /// Attaches the deadline timer of an entry, aborting it if the entry is
    /// already gone.
    pub(crate) fn set_timer(&self, correlation_id: &str, timer: AbortHandle) {
        match self.pending.get_mut(correlation_id) {
            Some(mut entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    pub(crate) fn lookup(&self, correlation_id: &str) -> Option<PendingView> {
        self.pending.get(correlation_id).map(|entry| PendingView {
            from_agent_id: entry.from_agent_id.clone(),
            to_agent_id: entry.to_agent_id.clone(),
            session_id: entry.session_id.clone(),
            timeout: entry.timeout,
        })
    }

    /// Transitions an entry out of `waiting`, wakes its caller and hands back
    /// the original request.
    ///
    /// Fails with `UnknownCorrelation` if the entry does not exist or another
    /// outcome already won.
    pub(crate) fn resolve(
        &self,
        correlation_id: &str,
        state: CorrelationState,
        result: Result<MessageEnvelope, BrokerError>,
    ) -> Result<MessageEnvelope, BrokerError> {
        let Some((_, entry)) = self.pending.remove(correlation_id) else {
            return Err(BrokerError::UnknownCorrelation {
                correlation_id: correlation_id.to_string(),
            });
        };

        if let Some(timer) = &entry.timer {
            timer.abort();
        }
        self.history
            .lock()
            .record(entry.correlation_id.clone(), state);

        debug!(correlation_id = %correlation_id, state = ?state, "Resolved correlation");

        // The caller may have stopped waiting; the entry is released either way.
        let _ = entry.waker.send(Resolution {
            correlation_id: entry.correlation_id,
            state,
            result,
        });
        Ok(entry.request)
    }

    /// Ids of waiting entries addressed to `agent_id`.
    pub(crate) fn ids_targeting(&self, agent_id: &str) -> Vec<CorrelationId> {
        self.pending
            .iter()
            .filter(|entry| entry.to_agent_id == agent_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// `Waiting` for pending entries, otherwise the recorded final state.
    pub(crate) fn state(&self, correlation_id: &str) -> Option<CorrelationState> {
        if self.pending.contains_key(correlation_id) {
            return Some(CorrelationState::Waiting);
        }
        self.history.lock().states.get(correlation_id).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// The caller's side of a pending correlation.
///
/// Dropping the handle does not cancel the request; the entry is still
/// reclaimed by its deadline.
#[derive(Debug)]
pub struct CorrelationHandle {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Resolution>,
    resolution: Option<Resolution>,
}

impl CorrelationHandle {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Polls for the outcome without waiting.
    pub fn try_resolution(&mut self) -> Option<&Resolution> {
        if self.resolution.is_none() {
            match self.receiver.try_recv() {
                Ok(resolution) => self.resolution = Some(resolution),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.resolution = Some(self.dropped());
                }
            }
        }
        self.resolution.as_ref()
    }

    /// Waits for the outcome.
    pub async fn wait(mut self) -> Resolution {
        if let Some(resolution) = self.resolution.take() {
            return resolution;
        }
        match (&mut self.receiver).await {
            Ok(resolution) => resolution,
            Err(_) => self.dropped(),
        }
    }

    pub async fn into_result(self) -> Result<MessageEnvelope, BrokerError> {
        self.wait().await.into_result()
    }

    fn dropped(&self) -> Resolution {
        Resolution {
            correlation_id: self.correlation_id.clone(),
            state: CorrelationState::Cancelled,
            result: Err(BrokerError::internal(format!(
                "correlation {} was dropped without a resolution",
                self.correlation_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> MessageEnvelope {
        MessageEnvelope::request("caller", "weather", json!({}))
    }

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let table = CorrelationTable::new(16);
        let request = request();
        let handle = table
            .insert(&request, None, Duration::from_secs(5))
            .unwrap();

        let response = MessageEnvelope::response_to(&request, json!({"temp_c": 18}));
        table
            .resolve(&request.message_id, CorrelationState::Resolved, Ok(response.clone()))
            .unwrap();

        let late = table.resolve(
            &request.message_id,
            CorrelationState::TimedOut,
            Err(BrokerError::RequestTimeout {
                correlation_id: request.message_id.clone(),
                timeout_ms: 1,
            }),
        );
        assert!(matches!(late, Err(BrokerError::UnknownCorrelation { .. })));

        let resolution = handle.wait().await;
        assert_eq!(resolution.state, CorrelationState::Resolved);
        assert_eq!(resolution.result, Ok(response));
        assert_eq!(
            table.state(&request.message_id),
            Some(CorrelationState::Resolved)
        );
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_message_id_is_rejected() {
        let table = CorrelationTable::new(16);
        let request = request();
        let _handle = table.insert(&request, None, Duration::from_secs(5)).unwrap();

        assert!(matches!(
            table.insert(&request, None, Duration::from_secs(5)),
            Err(BrokerError::InvalidEnvelope { .. })
        ));

        table
            .resolve(
                &request.message_id,
                CorrelationState::Cancelled,
                Err(BrokerError::Cancelled {
                    correlation_id: request.message_id.clone(),
                }),
            )
            .unwrap();
        assert!(matches!(
            table.insert(&request, None, Duration::from_secs(5)),
            Err(BrokerError::InvalidEnvelope { .. })
        ));
    }

    #[tokio::test]
    async fn test_try_resolution_polls_without_waiting() {
        let table = CorrelationTable::new(16);
        let request = request();
        let mut handle = table.insert(&request, None, Duration::from_secs(5)).unwrap();
        assert!(handle.try_resolution().is_none());
        assert_eq!(
            table.state(&request.message_id),
            Some(CorrelationState::Waiting)
        );

        table
            .resolve(
                &request.message_id,
                CorrelationState::Cancelled,
                Err(BrokerError::Cancelled {
                    correlation_id: request.message_id.clone(),
                }),
            )
            .unwrap();

        assert_eq!(
            handle.try_resolution().map(|r| r.state),
            Some(CorrelationState::Cancelled)
        );
        // The polled outcome is kept for a later wait.
        assert_eq!(handle.wait().await.state, CorrelationState::Cancelled);
    }

    #[test]
    fn test_history_is_bounded() {
        let table = CorrelationTable::new(2);
        let requests: Vec<_> = (0..3).map(|_| request()).collect();
        for request in &requests {
            let _handle = table.insert(request, None, Duration::from_secs(5)).unwrap();
            table
                .resolve(
                    &request.message_id,
                    CorrelationState::Resolved,
                    Ok(MessageEnvelope::response_to(request, json!(null))),
                )
                .unwrap();
        }

        assert_eq!(table.state(&requests[0].message_id), None);
        assert_eq!(
            table.state(&requests[2].message_id),
            Some(CorrelationState::Resolved)
        );
    }
}
