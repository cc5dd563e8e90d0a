use std::sync::Arc;

use shared::subsystem::{SubsystemHandle, spawn_subsystem};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    agent_execution::AgentHandler,
    config::BrokerConfig,
    errors::BrokerError,
    events::{InMemoryStreamManager, StreamManager},
    registry::{Agent, AgentCard, AgentRegistry},
    router::CommunicationRouter,
    sessions::{InMemorySessionStore, SessionController, SessionHandle, SessionRequest},
};

/// Wires the registry, router, stream manager and session controller from
/// one [`BrokerConfig`]. Cheap to clone.
#[derive(Clone)]
pub struct A2aBroker {
    config: Arc<BrokerConfig>,
    registry: Arc<AgentRegistry>,
    streams: Arc<dyn StreamManager>,
    router: CommunicationRouter,
    sessions: SessionController,
}

impl A2aBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(AgentRegistry::with_offline_retention(
            config.offline_agent_retention,
        ));
        let streams: Arc<dyn StreamManager> =
            Arc::new(InMemoryStreamManager::new(config.stream_capacity));
        let router = CommunicationRouter::new(registry.clone(), streams.clone(), &config);
        let sessions = SessionController::new(
            router.clone(),
            streams.clone(),
            Arc::new(InMemorySessionStore::new(config.session_retention)),
        );

        Self {
            config: Arc::new(config),
            registry,
            streams,
            router,
            sessions,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn streams(&self) -> &Arc<dyn StreamManager> {
        &self.streams
    }

    pub fn router(&self) -> &CommunicationRouter {
        &self.router
    }

    pub fn sessions(&self) -> &SessionController {
        &self.sessions
    }

    pub fn register_agent(
        &self,
        agent: Agent,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<Arc<AgentCard>, BrokerError> {
        self.registry.register(agent, handler)
    }

    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        self.router.deregister_agent(agent_id)
    }

    pub async fn start_session(&self, request: SessionRequest) -> Result<SessionHandle, BrokerError> {
        self.sessions.start(request).await
    }

    pub async fn cancel_session(&self, session_id: &str) -> Result<(), BrokerError> {
        self.sessions.cancel(session_id).await
    }

    /// Periodically degrades agents whose heartbeats stopped, until `shutdown` fires.
    pub fn spawn_heartbeat_monitor(&self, shutdown: broadcast::Receiver<()>) -> SubsystemHandle {
        let registry = self.registry.clone();
        let sweep_interval = self.config.heartbeat_sweep_interval;
        let timeout = self.config.heartbeat_timeout;

        spawn_subsystem("heartbeat monitor", shutdown, move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(?sweep_interval, ?timeout, "Heartbeat monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let degraded = registry.sweep_stale(timeout);
                        debug!(degraded = degraded.len(), "Heartbeat sweep finished");
                    }
                    _ = shutdown.recv() => {
                        break;
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent_execution::{AgentContext, HandlerError},
        config::BrokerConfigBuilder,
        registry::AgentStatus,
        sessions::{SessionRequestBuilder, SessionStatus},
    };
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::time::Duration;

    struct EchoAgent;

    #[async_trait]
    impl AgentHandler for EchoAgent {
        async fn handle(&self, ctx: AgentContext) -> Result<Option<Value>, HandlerError> {
            Ok(Some(ctx.payload().clone()))
        }
    }

    #[tokio::test]
    async fn test_broker_runs_session_end_to_end() {
        shared::setup_test!();
        let broker = A2aBroker::new(BrokerConfig::default());
        broker
            .register_agent(Agent::new("echo", "local://echo"), Arc::new(EchoAgent))
            .unwrap();

        let handle = broker
            .start_session(
                SessionRequestBuilder::default()
                    .from_agent_id("caller")
                    .to_agent_id("echo")
                    .payload(json!({"hello": "world"}))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        let session_id = handle.session_id().clone();

        assert_eq!(handle.result().await.unwrap(), json!({"hello": "world"}));
        assert_eq!(
            broker.sessions().session(&session_id).await.unwrap().status,
            SessionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_heartbeat_monitor_degrades_silent_agents_and_stops() {
        shared::setup_test!();
        let config = BrokerConfigBuilder::default()
            .heartbeat_sweep_interval(Duration::from_millis(10))
            .heartbeat_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let broker = A2aBroker::new(config);
        broker
            .register_agent(Agent::new("echo", "local://echo"), Arc::new(EchoAgent))
            .unwrap();
        broker.registry().heartbeat("echo").unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let monitor = broker.spawn_heartbeat_monitor(shutdown_rx);

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.registry().lookup("echo").unwrap().status != AgentStatus::Degraded {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), monitor.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deregister_through_broker_hides_agent() {
        let broker = A2aBroker::new(BrokerConfig::default());
        broker
            .register_agent(Agent::new("echo", "local://echo"), Arc::new(EchoAgent))
            .unwrap();

        assert!(broker.deregister_agent("echo"));
        assert!(broker.registry().list().is_empty());
        assert!(matches!(
            broker
                .start_session(
                    SessionRequestBuilder::default()
                        .from_agent_id("caller")
                        .to_agent_id("echo")
                        .build()
                        .unwrap()
                )
                .await,
            Err(BrokerError::DestinationUnavailable { .. })
        ));
    }
}
