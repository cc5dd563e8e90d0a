use async_trait::async_trait;
use serde_json::Value;

use crate::{
    errors::BrokerError,
    sessions::session::{SessionRecord, SessionStatus},
    types::ErrorPayload,
};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Stores a new active session. Fails with `DuplicateSession` if the id
    /// is still known.
    async fn insert(&self, record: SessionRecord) -> Result<(), BrokerError>;

    async fn get(&self, session_id: &str) -> Option<SessionRecord>;

    /// Moves an active session to a terminal status and returns the updated
    /// record. Returns `None` if the session is unknown or already terminal,
    /// so exactly one caller finishes a session.
    async fn finish(
        &self,
        session_id: &str,
        status: SessionStatus,
        result: Option<Value>,
        error: Option<ErrorPayload>,
    ) -> Option<SessionRecord>;

    async fn active_count(&self) -> usize;
}
