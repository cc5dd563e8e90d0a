use std::sync::Arc;

use crate::{
    errors::BrokerError,
    events::{
        event_stream::{CloseReason, EventStream, StreamEvent},
        subscription::EventSubscription,
    },
};

/// Interface for managing the event stream lifecycle per session.
///
/// Synchronous because publishing happens from agent callbacks that must not
/// suspend; only consuming a subscription waits.
pub trait StreamManager: Send + Sync {
    /// Creates the stream of a session.
    fn open(&self, session_id: &str) -> Result<Arc<EventStream>, BrokerError>;

    /// Appends an event and returns its sequence number.
    fn publish(&self, session_id: &str, event: StreamEvent) -> Result<u64, BrokerError>;

    /// Attaches the single subscriber of a session's stream.
    fn subscribe(&self, session_id: &str) -> Result<EventSubscription, BrokerError>;

    /// Closes and releases a session's stream. Returns `false` if no stream was open.
    fn close(&self, session_id: &str, reason: CloseReason) -> bool;

    fn is_open(&self, session_id: &str) -> bool;

    fn open_count(&self) -> usize;
}
