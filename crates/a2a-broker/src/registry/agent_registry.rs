use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    agent_execution::AgentHandler,
    errors::{BrokerError, ResourceKind},
    config::DEFAULT_OFFLINE_AGENT_RETENTION,
    registry::agent::{Agent, AgentCard, AgentStatus, Capability},
    types::AgentId,
};

struct RegistryEntry {
    agent: Agent,
    card: Arc<AgentCard>,
    handler: Arc<dyn AgentHandler>,
    sequence: u64,
}

struct RegistryState {
    entries: HashMap<AgentId, RegistryEntry>,
    next_sequence: u64,
    /// Deregistered agent ids, oldest first.
    offline: VecDeque<AgentId>,
    offline_retention: usize,
}

impl RegistryState {
    /// Drops the oldest offline entries beyond the retention limit. Ids that
    /// were registered again since are skipped.
    fn evict_offline(&mut self) {
        while self.offline.len() > self.offline_retention {
            let Some(agent_id) = self.offline.pop_front() else {
                break;
            };
            let still_offline = self
                .entries
                .get(&agent_id)
                .is_some_and(|e| e.agent.status == AgentStatus::Offline);
            if still_offline && !self.offline.contains(&agent_id) {
                self.entries.remove(&agent_id);
                debug!(agent_id = %agent_id, "Evicted offline agent");
            }
        }
    }

    /// Cards of every agent that is not offline, in registration order.
    fn discoverable_cards(&self) -> Vec<Arc<AgentCard>> {
        let mut entries: Vec<&RegistryEntry> = self
            .entries
            .values()
            .filter(|e| e.agent.status != AgentStatus::Offline)
            .collect();
        entries.sort_by_key(|e| e.sequence);
        entries.into_iter().map(|e| e.card.clone()).collect()
    }
}

/// In-memory directory of known agents and their inbound handlers.
///
/// Deregistration is only reachable through
/// [`CommunicationRouter::deregister_agent`](crate::router::CommunicationRouter::deregister_agent)
/// so that requests pending against the agent are failed at the same time.
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::with_offline_retention(DEFAULT_OFFLINE_AGENT_RETENTION)
    }

    /// Keeps at most `offline_retention` deregistered agents for lookups.
    pub fn with_offline_retention(offline_retention: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                entries: HashMap::new(),
                next_sequence: 0,
                offline: VecDeque::new(),
                offline_retention,
            }),
        }
    }

    /// Registers `agent`, replacing an offline or degraded registration with the same id.
    pub fn register(
        &self,
        mut agent: Agent,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<Arc<AgentCard>, BrokerError> {
        let mut state = self.state.write();

        if let Some(existing) = state.entries.get(&agent.agent_id) {
            if existing.agent.status == AgentStatus::Online {
                return Err(BrokerError::DuplicateAgent {
                    agent_id: agent.agent_id,
                });
            }
        }

        let mut seen = HashSet::new();
        agent.capabilities.retain(|c| seen.insert(c.name.clone()));
        agent.status = AgentStatus::Online;
        agent.registered_at = Utc::now();
        agent.last_heartbeat = None;

        let card = Arc::new(AgentCard::from_agent(&agent));
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        info!(
            agent_id = %agent.agent_id,
            capabilities = agent.capabilities.len(),
            "Registered agent"
        );

        state.entries.insert(
            agent.agent_id.clone(),
            RegistryEntry {
                agent,
                card: card.clone(),
                handler,
                sequence,
            },
        );

        Ok(card)
    }

    /// Marks the agent offline. Returns `false` if it was unknown or already offline.
    ///
    /// Offline agents stay visible to [`AgentRegistry::lookup`] until they fall
    /// out of the offline retention window.
    pub(crate) fn deregister(&self, agent_id: &str) -> bool {
        let mut state = self.state.write();
        match state.entries.get_mut(agent_id) {
            Some(entry) if entry.agent.status != AgentStatus::Offline => {
                entry.agent.status = AgentStatus::Offline;
                info!(agent_id = %agent_id, "Deregistered agent");
                state.offline.push_back(agent_id.to_string());
                state.evict_offline();
                true
            }
            _ => {
                debug!(agent_id = %agent_id, "Deregister called for unknown or offline agent");
                false
            }
        }
    }

    pub fn lookup(&self, agent_id: &str) -> Result<Agent, BrokerError> {
        self.state
            .read()
            .entries
            .get(agent_id)
            .map(|e| e.agent.clone())
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Agent, agent_id))
    }

    /// The current Agent Card of a discoverable agent.
    pub fn card(&self, agent_id: &str) -> Result<Arc<AgentCard>, BrokerError> {
        let state = self.state.read();
        match state.entries.get(agent_id) {
            Some(entry) if entry.agent.status != AgentStatus::Offline => Ok(entry.card.clone()),
            _ => Err(BrokerError::not_found(ResourceKind::Agent, agent_id)),
        }
    }

    /// Cards of agents offering `capability`: exact name matches first, then
    /// case-insensitive name or tag matches, each in registration order.
    pub fn discover(&self, capability: &str) -> Discovery {
        let candidates = self.state.read().discoverable_cards();
        Discovery {
            capability: capability.to_string(),
            candidates: candidates.into(),
        }
    }

    pub fn list(&self) -> Vec<Arc<AgentCard>> {
        self.state.read().discoverable_cards()
    }

    /// Records a heartbeat, bringing a degraded agent back online.
    pub fn heartbeat(&self, agent_id: &str) -> Result<AgentStatus, BrokerError> {
        let mut state = self.state.write();
        let entry = state
            .entries
            .get_mut(agent_id)
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Agent, agent_id))?;

        if entry.agent.status == AgentStatus::Offline {
            return Err(BrokerError::DestinationUnavailable {
                agent_id: agent_id.to_string(),
                reason: "agent is deregistered".to_string(),
            });
        }

        if entry.agent.status == AgentStatus::Degraded {
            info!(agent_id = %agent_id, "Agent recovered after heartbeat");
        }
        entry.agent.status = AgentStatus::Online;
        entry.agent.last_heartbeat = Some(Utc::now());
        Ok(entry.agent.status)
    }

    /// Marks an online agent degraded after a failed delivery.
    pub fn mark_degraded(&self, agent_id: &str) -> bool {
        let mut state = self.state.write();
        match state.entries.get_mut(agent_id) {
            Some(entry) if entry.agent.status == AgentStatus::Online => {
                entry.agent.status = AgentStatus::Degraded;
                warn!(agent_id = %agent_id, "Agent marked degraded");
                true
            }
            _ => false,
        }
    }

    /// Degrades online agents whose last heartbeat is older than `timeout`.
    ///
    /// Agents that never sent a heartbeat are not tracked.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<AgentId> {
        let now = Utc::now();
        let mut state = self.state.write();
        let mut degraded = vec![];

        for entry in state.entries.values_mut() {
            if entry.agent.status != AgentStatus::Online {
                continue;
            }
            let Some(last_heartbeat) = entry.agent.last_heartbeat else {
                continue;
            };
            let silence = (now - last_heartbeat).to_std().unwrap_or_default();
            if silence > timeout {
                entry.agent.status = AgentStatus::Degraded;
                degraded.push(entry.agent.agent_id.clone());
            }
        }

        if !degraded.is_empty() {
            warn!(agents = ?degraded, "Degraded agents with stale heartbeats");
        }
        degraded
    }

    /// Replaces the capabilities of an agent and regenerates its card.
    pub fn update_capabilities(
        &self,
        agent_id: &str,
        capabilities: Vec<Capability>,
    ) -> Result<Arc<AgentCard>, BrokerError> {
        let mut state = self.state.write();
        let entry = state
            .entries
            .get_mut(agent_id)
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Agent, agent_id))?;

        let mut seen = HashSet::new();
        entry.agent.capabilities = capabilities
            .into_iter()
            .filter(|c| seen.insert(c.name.clone()))
            .collect();
        entry.card = Arc::new(AgentCard::from_agent(&entry.agent));

        debug!(agent_id = %agent_id, "Regenerated agent card");
        Ok(entry.card.clone())
    }

    /// Handler of an online agent, or `DestinationUnavailable`.
    pub(crate) fn resolve_destination(
        &self,
        agent_id: &str,
    ) -> Result<Arc<dyn AgentHandler>, BrokerError> {
        let state = self.state.read();
        match state.entries.get(agent_id) {
            Some(entry) if entry.agent.status == AgentStatus::Online => Ok(entry.handler.clone()),
            Some(entry) => Err(BrokerError::DestinationUnavailable {
                agent_id: agent_id.to_string(),
                reason: format!("agent is {:?}", entry.agent.status).to_lowercase(),
            }),
            None => Err(BrokerError::DestinationUnavailable {
                agent_id: agent_id.to_string(),
                reason: "agent is not registered".to_string(),
            }),
        }
    }

    /// Handler regardless of status, used for best-effort notifications.
    pub(crate) fn handler(&self, agent_id: &str) -> Option<Arc<dyn AgentHandler>> {
        self.state
            .read()
            .entries
            .get(agent_id)
            .map(|e| e.handler.clone())
    }

    /// Number of agents that are not offline.
    pub fn len(&self) -> usize {
        self.state
            .read()
            .entries
            .values()
            .filter(|e| e.agent.status != AgentStatus::Offline)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a discovery query.
///
/// Holds a snapshot of the discoverable agents taken at query time; matching
/// happens lazily on iteration and `iter` can be called any number of times.
#[derive(Debug, Clone)]
pub struct Discovery {
    capability: String,
    candidates: Arc<[Arc<AgentCard>]>,
}

impl Discovery {
    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentCard>> + '_ {
        let query = self.capability.as_str();
        let exact = self.candidates.iter().filter(move |c| c.has_capability(query));
        let loose = self
            .candidates
            .iter()
            .filter(move |c| !c.has_capability(query) && c.loosely_matches(query));
        exact.chain(loose)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn to_vec(&self) -> Vec<Arc<AgentCard>> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a Discovery {
    type Item = &'a Arc<AgentCard>;
    type IntoIter = Box<dyn Iterator<Item = &'a Arc<AgentCard>> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_execution::{AgentContext, HandlerError};
    use async_trait::async_trait;
    use serde_json::Value;

    struct NoopHandler;

    #[async_trait]
    impl AgentHandler for NoopHandler {
        async fn handle(&self, _ctx: AgentContext) -> Result<Option<Value>, HandlerError> {
            Ok(None)
        }
    }

    fn handler() -> Arc<dyn AgentHandler> {
        Arc::new(NoopHandler)
    }

    fn agent(id: &str, capabilities: &[&str]) -> Agent {
        capabilities
            .iter()
            .fold(Agent::new(id, format!("local://{id}")), |a, c| {
                a.with_capability(Capability::named(*c))
            })
    }

    fn ids(discovery: &Discovery) -> Vec<String> {
        discovery.iter().map(|c| c.agent_id.clone()).collect()
    }

    #[test]
    fn test_register_returns_card() {
        let registry = AgentRegistry::new();
        let card = registry
            .register(agent("weather", &["weather"]), handler())
            .unwrap();

        assert_eq!(card.agent_id, "weather");
        assert!(card.has_capability("weather"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("weather").unwrap().status, AgentStatus::Online);
    }

    #[test]
    fn test_register_duplicate_online_agent_fails() {
        let registry = AgentRegistry::new();
        registry.register(agent("a", &[]), handler()).unwrap();

        let err = registry.register(agent("a", &[]), handler()).unwrap_err();
        assert_eq!(
            err,
            BrokerError::DuplicateAgent {
                agent_id: "a".to_string()
            }
        );
    }

    #[test]
    fn test_register_overwrites_offline_agent() {
        let registry = AgentRegistry::new();
        registry.register(agent("a", &["old"]), handler()).unwrap();
        assert!(registry.deregister("a"));

        let card = registry.register(agent("a", &["new"]), handler()).unwrap();
        assert!(card.has_capability("new"));
        assert!(!card.has_capability("old"));
        assert_eq!(registry.lookup("a").unwrap().status, AgentStatus::Online);
    }

    #[test]
    fn test_deregister_is_idempotent_and_hides_agent() {
        let registry = AgentRegistry::new();
        registry.register(agent("a", &["weather"]), handler()).unwrap();

        assert!(registry.deregister("a"));
        assert!(!registry.deregister("a"));
        assert!(!registry.deregister("never-registered"));

        assert!(registry.discover("weather").is_empty());
        assert_eq!(registry.lookup("a").unwrap().status, AgentStatus::Offline);
        assert!(matches!(
            registry.card("a"),
            Err(BrokerError::NotFound {
                kind: ResourceKind::Agent,
                ..
            })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_unknown_agent() {
        let registry = AgentRegistry::new();
        assert_eq!(
            registry.lookup("z").unwrap_err(),
            BrokerError::not_found(ResourceKind::Agent, "z")
        );
    }

    #[test]
    fn test_discover_orders_exact_matches_then_registration_order() {
        let registry = AgentRegistry::new();
        let tagged = Agent::new("tagged", "local://tagged")
            .with_capability(Capability::named("forecast").with_tags(["weather"]));
        registry.register(tagged, handler()).unwrap();
        registry.register(agent("b", &["weather"]), handler()).unwrap();
        registry.register(agent("c", &["maps"]), handler()).unwrap();
        registry.register(agent("a", &["weather", "maps"]), handler()).unwrap();
        registry.register(agent("upper", &["WEATHER"]), handler()).unwrap();

        let discovery = registry.discover("weather");
        assert_eq!(ids(&discovery), vec!["b", "a", "tagged", "upper"]);
        assert_eq!(discovery.len(), 4);
        assert_eq!(discovery.capability(), "weather");
    }

    #[test]
    fn test_discovery_is_restartable_snapshot() {
        let registry = AgentRegistry::new();
        registry.register(agent("a", &["weather"]), handler()).unwrap();

        let discovery = registry.discover("weather");
        registry.register(agent("b", &["weather"]), handler()).unwrap();

        assert_eq!(ids(&discovery), vec!["a"]);
        assert_eq!(ids(&discovery), vec!["a"]);
        let via_into_iter: Vec<_> = (&discovery).into_iter().map(|c| c.agent_id.clone()).collect();
        assert_eq!(via_into_iter, vec!["a"]);
        assert_eq!(ids(&registry.discover("weather")), vec!["a", "b"]);
    }

    #[test]
    fn test_update_capabilities_regenerates_card() {
        let registry = AgentRegistry::new();
        let first = registry.register(agent("a", &["weather"]), handler()).unwrap();

        let second = registry
            .update_capabilities(
                "a",
                vec![Capability::named("maps"), Capability::named("maps")],
            )
            .unwrap();

        assert!(first.has_capability("weather"));
        assert!(!second.has_capability("weather"));
        assert_eq!(second.capabilities.len(), 1);
        assert!(registry.discover("weather").is_empty());
        assert_eq!(ids(&registry.discover("maps")), vec!["a"]);
    }

    #[test]
    fn test_heartbeat_restores_degraded_agent() {
        let registry = AgentRegistry::new();
        registry.register(agent("a", &[]), handler()).unwrap();

        assert!(registry.mark_degraded("a"));
        assert!(!registry.mark_degraded("a"));
        assert!(registry.resolve_destination("a").is_err());

        assert_eq!(registry.heartbeat("a").unwrap(), AgentStatus::Online);
        assert!(registry.lookup("a").unwrap().last_heartbeat.is_some());
        assert!(registry.resolve_destination("a").is_ok());
    }

    #[test]
    fn test_heartbeat_for_offline_agent_fails() {
        let registry = AgentRegistry::new();
        registry.register(agent("a", &[]), handler()).unwrap();
        registry.deregister("a");

        assert!(matches!(
            registry.heartbeat("a"),
            Err(BrokerError::DestinationUnavailable { .. })
        ));
        assert!(matches!(
            registry.heartbeat("nobody"),
            Err(BrokerError::NotFound { .. })
        ));
    }

    #[test]
    fn test_sweep_stale_only_tracks_heartbeating_agents() {
        let registry = AgentRegistry::new();
        registry.register(agent("silent", &[]), handler()).unwrap();
        registry.register(agent("beating", &[]), handler()).unwrap();
        registry.heartbeat("beating").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let degraded = registry.sweep_stale(Duration::from_millis(5));

        assert_eq!(degraded, vec!["beating".to_string()]);
        assert_eq!(registry.lookup("silent").unwrap().status, AgentStatus::Online);
        assert_eq!(
            registry.lookup("beating").unwrap().status,
            AgentStatus::Degraded
        );
    }

    #[test]
    fn test_resolve_destination_rejects_unknown_and_offline() {
        let registry = AgentRegistry::new();
        assert!(matches!(
            registry.resolve_destination("z"),
            Err(BrokerError::DestinationUnavailable { .. })
        ));

        registry.register(agent("a", &[]), handler()).unwrap();
        registry.deregister("a");
        match registry.resolve_destination("a") {
            Err(BrokerError::DestinationUnavailable { reason, .. }) => {
                assert_eq!(reason, "agent is offline")
            }
            Err(other) => panic!("Expected DestinationUnavailable, got {other:?}"),
            Ok(_) => panic!("Expected DestinationUnavailable, got a handler"),
        }
        assert!(registry.handler("a").is_some());
    }

    #[test]
    fn test_offline_agents_are_evicted_beyond_retention() {
        let registry = AgentRegistry::with_offline_retention(2);
        for id in ["a", "b", "c"] {
            registry.register(agent(id, &["weather"]), handler()).unwrap();
            assert!(registry.deregister(id));
        }

        assert!(matches!(
            registry.lookup("a"),
            Err(BrokerError::NotFound { .. })
        ));
        assert_eq!(registry.lookup("b").unwrap().status, AgentStatus::Offline);
        assert_eq!(registry.lookup("c").unwrap().status, AgentStatus::Offline);
        assert_eq!(registry.state.read().entries.len(), 2);

        // A re-registered agent is not evicted by its stale offline record.
        registry.register(agent("b", &["weather"]), handler()).unwrap();
        registry.register(agent("d", &["weather"]), handler()).unwrap();
        assert!(registry.deregister("d"));
        assert_eq!(registry.lookup("b").unwrap().status, AgentStatus::Online);
        assert_eq!(registry.lookup("c").unwrap().status, AgentStatus::Offline);
    }
}
