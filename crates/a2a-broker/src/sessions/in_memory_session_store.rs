use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::{
    errors::BrokerError,
    sessions::{
        session::{SessionRecord, SessionStatus},
        store::SessionStore,
    },
    types::{ErrorPayload, SessionId},
};

#[derive(Default)]
struct SessionTable {
    records: HashMap<SessionId, SessionRecord>,
    /// Terminal sessions, oldest first.
    finished: VecDeque<SessionId>,
}

/// In-memory implementation of SessionStore.
///
/// Active sessions are always kept; only the most recent `retention`
/// terminal records are, the oldest are evicted first.
pub struct InMemorySessionStore {
    table: RwLock<SessionTable>,
    retention: usize,
}

impl InMemorySessionStore {
    pub fn new(retention: usize) -> Self {
        Self {
            table: RwLock::new(SessionTable::default()),
            retention,
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, record: SessionRecord) -> Result<(), BrokerError> {
        let mut table = self.table.write();
        if table.records.contains_key(&record.session_id) {
            return Err(BrokerError::DuplicateSession {
                session_id: record.session_id,
            });
        }
        debug!(session_id = %record.session_id, "Session saved");
        table.records.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.table.read().records.get(session_id).cloned()
    }

    async fn finish(
        &self,
        session_id: &str,
        status: SessionStatus,
        result: Option<Value>,
        error: Option<ErrorPayload>,
    ) -> Option<SessionRecord> {
        let mut table = self.table.write();
        let record = table.records.get_mut(session_id)?;
        if record.status.is_terminal() {
            return None;
        }

        record.status = status;
        record.finished_at = Some(Utc::now());
        record.result = result;
        record.error = error;
        let finished = record.clone();

        table.finished.push_back(finished.session_id.clone());
        while table.finished.len() > self.retention {
            if let Some(evicted) = table.finished.pop_front() {
                table.records.remove(&evicted);
                debug!(session_id = %evicted, "Evicted finished session");
            }
        }

        Some(finished)
    }

    async fn active_count(&self) -> usize {
        self.table
            .read()
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }
}
