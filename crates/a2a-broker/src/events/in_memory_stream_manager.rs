use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::{
    errors::BrokerError,
    events::{
        event_stream::{CloseReason, EventStream, StreamEvent},
        stream_manager::StreamManager,
        subscription::EventSubscription,
    },
    types::SessionId,
};

/// InMemoryStreamManager keeps every open stream in process memory.
///
/// All producers and the subscriber of a session must reach the same broker
/// instance.
pub struct InMemoryStreamManager {
    streams: RwLock<HashMap<SessionId, Arc<EventStream>>>,
    capacity: usize,
}

impl InMemoryStreamManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    fn get(&self, session_id: &str) -> Option<Arc<EventStream>> {
        self.streams.read().get(session_id).cloned()
    }
}

impl StreamManager for InMemoryStreamManager {
    fn open(&self, session_id: &str) -> Result<Arc<EventStream>, BrokerError> {
        let mut streams = self.streams.write();
        if streams.contains_key(session_id) {
            return Err(BrokerError::DuplicateStream {
                session_id: session_id.to_string(),
            });
        }
        let stream = Arc::new(EventStream::new(session_id, self.capacity));
        streams.insert(session_id.to_string(), stream.clone());
        Ok(stream)
    }

    fn publish(&self, session_id: &str, event: StreamEvent) -> Result<u64, BrokerError> {
        match self.get(session_id) {
            Some(stream) => stream.publish(event),
            None => Err(BrokerError::StreamClosed {
                session_id: session_id.to_string(),
            }),
        }
    }

    fn subscribe(&self, session_id: &str) -> Result<EventSubscription, BrokerError> {
        match self.get(session_id) {
            Some(stream) => stream.subscribe(),
            None => Err(BrokerError::StreamClosed {
                session_id: session_id.to_string(),
            }),
        }
    }

    fn close(&self, session_id: &str, reason: CloseReason) -> bool {
        let removed = self.streams.write().remove(session_id);
        match removed {
            Some(stream) => stream.close(reason),
            None => {
                debug!(session_id = %session_id, "Close called for unknown stream");
                false
            }
        }
    }

    fn is_open(&self, session_id: &str) -> bool {
        self.streams.read().contains_key(session_id)
    }

    fn open_count(&self) -> usize {
        self.streams.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_twice_fails_with_duplicate_stream() {
        let manager = InMemoryStreamManager::new(4);
        manager.open("s-1").unwrap();
        assert!(matches!(
            manager.open("s-1"),
            Err(BrokerError::DuplicateStream { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_flushes_buffered_events_and_releases_stream() {
        let manager = InMemoryStreamManager::new(4);
        manager.open("s-1").unwrap();
        let subscription = manager.subscribe("s-1").unwrap();
        manager
            .publish("s-1", StreamEvent::new("s-1", json!({"status": "searching"})))
            .unwrap();

        assert!(manager.close("s-1", CloseReason::Completed));
        assert!(!manager.close("s-1", CloseReason::Completed));
        assert!(!manager.is_open("s-1"));
        assert_eq!(manager.open_count(), 0);

        let (events, reason) = subscription.collect_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, json!({"status": "searching"}));
        assert_eq!(reason, Some(CloseReason::Completed));
    }

    #[tokio::test]
    async fn test_publish_to_closed_stream_fails() {
        let manager = InMemoryStreamManager::new(4);
        assert!(matches!(
            manager.publish("missing", StreamEvent::new("missing", json!(1))),
            Err(BrokerError::StreamClosed { .. })
        ));

        manager.open("s-1").unwrap();
        manager.close("s-1", CloseReason::Cancelled);
        assert!(matches!(
            manager.publish("s-1", StreamEvent::new("s-1", json!(1))),
            Err(BrokerError::StreamClosed { .. })
        ));
        // A closed session may be reopened under the same id.
        assert!(manager.open("s-1").is_ok());
    }
}
