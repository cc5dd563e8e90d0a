use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::{
    errors::BrokerError,
    events::subscription::EventSubscription,
    types::{CorrelationId, MessageEnvelope, SessionId, new_message_id},
};

pub const DEFAULT_EVENT_TYPE: &str = "progress";
const EVENT_TYPE_KEY: &str = "event_type";
const DATA_KEY: &str = "data";

/// An intermediate update published while a request is being processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_id: String,
    pub session_id: SessionId,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    /// Publish order within the stream, starting at 0. Assigned on publish.
    #[serde(default)]
    pub sequence: u64,
    pub event_type: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(session_id: impl Into<SessionId>, data: Value) -> Self {
        Self {
            event_id: new_message_id(),
            session_id: session_id.into(),
            correlation_id: None,
            sequence: 0,
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            data,
            created_at: Utc::now(),
        }
    }

    /// Builds the event carried by a `stream_event` envelope.
    ///
    /// A payload of exactly `{"event_type": <string>, "data": <any>}` names
    /// its event type; any other payload is `data` of a
    /// [`DEFAULT_EVENT_TYPE`] event.
    pub fn from_envelope(session_id: impl Into<SessionId>, envelope: &MessageEnvelope) -> Self {
        let (event_type, data) = split_typed_payload(&envelope.payload)
            .unwrap_or_else(|| (DEFAULT_EVENT_TYPE.to_string(), envelope.payload.clone()));
        Self {
            event_id: envelope.message_id.clone(),
            session_id: session_id.into(),
            correlation_id: envelope.correlation_id.clone(),
            sequence: 0,
            event_type,
            data,
            created_at: envelope.created_at,
        }
    }
}

/// Payload of a `stream_event` envelope that carries its own event type.
pub fn typed_payload(event_type: impl Into<String>, data: Value) -> Value {
    let mut object = Map::new();
    object.insert(EVENT_TYPE_KEY.to_string(), Value::String(event_type.into()));
    object.insert(DATA_KEY.to_string(), data);
    Value::Object(object)
}

fn split_typed_payload(payload: &Value) -> Option<(String, Value)> {
    let object = payload.as_object()?;
    if object.len() != 2 {
        return None;
    }
    let event_type = object.get(EVENT_TYPE_KEY)?.as_str()?;
    let data = object.get(DATA_KEY)?;
    Some((event_type.to_string(), data.clone()))
}

/// Why a stream was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    Completed,
    Failed { message: String },
    RequestTimeout,
    Cancelled,
}

impl CloseReason {
    pub fn from_error(error: &BrokerError) -> Self {
        match error {
            BrokerError::RequestTimeout { .. } => CloseReason::RequestTimeout,
            BrokerError::Cancelled { .. } => CloseReason::Cancelled,
            other => CloseReason::Failed {
                message: other.message(),
            },
        }
    }
}

struct StreamWriter {
    sender: Option<mpsc::Sender<StreamEvent>>,
    next_sequence: u64,
}

/// Ordered, bounded event channel of one session.
///
/// Single producer side guarded by a lock so that sequence numbers follow
/// channel order, single consumer taken once by [`EventStream::subscribe`].
/// Events published before the subscriber attaches stay buffered in the
/// channel up to `capacity`.
pub struct EventStream {
    session_id: SessionId,
    capacity: usize,
    writer: Mutex<StreamWriter>,
    receiver: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    close_reason: Arc<Mutex<Option<CloseReason>>>,
}

impl EventStream {
    pub fn new(session_id: impl Into<SessionId>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let session_id = session_id.into();

        debug!(session_id = %session_id, capacity, "EventStream initialized");

        Self {
            session_id,
            capacity,
            writer: Mutex::new(StreamWriter {
                sender: Some(sender),
                next_sequence: 0,
            }),
            receiver: Mutex::new(Some(receiver)),
            close_reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `event` and returns its sequence number.
    pub fn publish(&self, mut event: StreamEvent) -> Result<u64, BrokerError> {
        let mut writer = self.writer.lock();
        let Some(sender) = writer.sender.as_ref() else {
            return Err(BrokerError::StreamClosed {
                session_id: self.session_id.clone(),
            });
        };

        let sequence = writer.next_sequence;
        event.sequence = sequence;
        event.session_id = self.session_id.clone();

        match sender.try_send(event) {
            Ok(()) => {
                writer.next_sequence += 1;
                debug!(session_id = %self.session_id, sequence, "Published stream event");
                Ok(sequence)
            }
            Err(TrySendError::Full(_)) => Err(BrokerError::StreamBackpressure {
                session_id: self.session_id.clone(),
                capacity: self.capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(BrokerError::StreamClosed {
                session_id: self.session_id.clone(),
            }),
        }
    }

    /// Attaches the single subscriber.
    pub fn subscribe(&self) -> Result<EventSubscription, BrokerError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| BrokerError::SubscriberAttached {
                session_id: self.session_id.clone(),
            })?;

        debug!(session_id = %self.session_id, "Subscriber attached");
        Ok(EventSubscription::new(
            self.session_id.clone(),
            receiver,
            self.close_reason.clone(),
        ))
    }

    /// Marks the stream terminal. Buffered events stay readable by the
    /// subscriber, after which its sequence ends. Returns `false` if the
    /// stream was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut writer = self.writer.lock();
        if writer.sender.is_none() {
            return false;
        }

        // Recorded before the sender drops so the subscriber sees it once the sequence ends.
        *self.close_reason.lock() = Some(reason.clone());
        writer.sender = None;

        debug!(session_id = %self.session_id, reason = ?reason, "EventStream closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.writer.lock().sender.is_none()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Events published and not yet consumed.
    pub fn buffered(&self) -> usize {
        match self.writer.lock().sender.as_ref() {
            Some(sender) => self.capacity - sender.capacity(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_comes_from_typed_payload() {
        let request = MessageEnvelope::request("caller", "planner", json!({}));

        let plain = MessageEnvelope::stream_event_for(&request, json!({"status": "searching"}));
        let event = StreamEvent::from_envelope("s-1", &plain);
        assert_eq!(event.event_type, DEFAULT_EVENT_TYPE);
        assert_eq!(event.data, json!({"status": "searching"}));
        assert_eq!(event.correlation_id.as_deref(), Some(request.message_id.as_str()));

        let typed = MessageEnvelope::stream_event_for(
            &request,
            typed_payload("recommendation_progress", json!({"step": 2})),
        );
        let event = StreamEvent::from_envelope("s-1", &typed);
        assert_eq!(event.event_type, "recommendation_progress");
        assert_eq!(event.data, json!({"step": 2}));

        // Extra keys make it ordinary data.
        let untyped = MessageEnvelope::stream_event_for(
            &request,
            json!({"event_type": "heartbeat", "data": 1, "other": true}),
        );
        let event = StreamEvent::from_envelope("s-1", &untyped);
        assert_eq!(event.event_type, DEFAULT_EVENT_TYPE);
        assert_eq!(event.data["other"], true);
    }

    #[tokio::test]
    async fn test_events_published_before_subscribe_are_delivered_in_order() {
        let stream = EventStream::new("s-1", 8);
        for i in 0..3 {
            assert_eq!(stream.publish(StreamEvent::new("s-1", json!({"i": i}))).unwrap(), i);
        }
        assert_eq!(stream.buffered(), 3);

        let subscription = stream.subscribe().unwrap();
        stream.close(CloseReason::Completed);

        let (events, reason) = subscription.collect_events().await;
        let data: Vec<_> = events.iter().map(|e| e.data["i"].as_u64().unwrap()).collect();
        assert_eq!(data, vec![0, 1, 2]);
        assert_eq!(events[2].sequence, 2);
        assert_eq!(reason, Some(CloseReason::Completed));
    }

    #[tokio::test]
    async fn test_publish_past_capacity_signals_backpressure() {
        let stream = EventStream::new("s-1", 2);
        stream.publish(StreamEvent::new("s-1", json!(1))).unwrap();
        stream.publish(StreamEvent::new("s-1", json!(2))).unwrap();

        let err = stream.publish(StreamEvent::new("s-1", json!(3))).unwrap_err();
        assert_eq!(
            err,
            BrokerError::StreamBackpressure {
                session_id: "s-1".to_string(),
                capacity: 2
            }
        );

        // The rejected event does not consume a sequence number.
        let mut subscription = stream.subscribe().unwrap();
        assert_eq!(subscription.next_event().await.unwrap().sequence, 0);
        assert_eq!(stream.publish(StreamEvent::new("s-1", json!(3))).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_second_subscriber_is_rejected() {
        let stream = EventStream::new("s-1", 2);
        let _first = stream.subscribe().unwrap();
        assert!(matches!(
            stream.subscribe(),
            Err(BrokerError::SubscriberAttached { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_publish() {
        let stream = EventStream::new("s-1", 2);
        assert!(stream.close(CloseReason::RequestTimeout));
        assert!(!stream.close(CloseReason::Completed));
        assert_eq!(stream.close_reason(), Some(CloseReason::RequestTimeout));
        assert!(stream.is_closed());

        assert!(matches!(
            stream.publish(StreamEvent::new("s-1", json!(1))),
            Err(BrokerError::StreamClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_after_subscriber_disconnects_fails() {
        let stream = EventStream::new("s-1", 2);
        drop(stream.subscribe().unwrap());

        assert!(matches!(
            stream.publish(StreamEvent::new("s-1", json!(1))),
            Err(BrokerError::StreamClosed { .. })
        ));
    }

    #[test]
    fn test_close_reason_wire_shape() {
        let value = serde_json::to_value(CloseReason::Failed {
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"reason": "failed", "message": "boom"}));
        assert_eq!(
            serde_json::to_value(CloseReason::RequestTimeout).unwrap(),
            json!({"reason": "request_timeout"})
        );
    }
}
