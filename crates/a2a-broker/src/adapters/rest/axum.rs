use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;

use super::utils::JsonResponse;
use crate::{
    agent_execution::RemoteAgentHandler,
    errors::BrokerError,
    events::{CloseReason, StreamEvent},
    registry::{Agent, AgentCard, AgentStatus, Capability},
    router::Delivery,
    service::A2aBroker,
    sessions::{SessionRecord, SessionRequest, SessionStatus},
    types::{CorrelationId, ErrorPayload, MessageEnvelope, SessionId},
};

#[derive(Clone)]
pub struct AppState {
    pub broker: A2aBroker,
    pub http_client: Arc<reqwest::Client>,
}

impl AppState {
    pub fn new(broker: A2aBroker) -> Self {
        Self {
            broker,
            http_client: Arc::new(reqwest::Client::new()),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents).post(register_agent))
        .route("/agents/discover", get(discover_agents))
        .route("/agents/{agent_id}", get(get_agent).delete(deregister_agent))
        .route("/agents/{agent_id}/heartbeat", post(heartbeat))
        .route("/messages", post(deliver_message))
        .route("/sessions", post(start_session))
        .route("/sessions/{session_id}", get(get_session).delete(cancel_session))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub agents: usize,
    pub pending_requests: usize,
    pub open_streams: usize,
    pub active_sessions: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let broker = &state.broker;
    Json(HealthResponse {
        status: "ok".to_string(),
        agents: broker.registry().len(),
        pending_requests: broker.router().pending_count(),
        open_streams: broker.streams().open_count(),
        active_sessions: broker.sessions().active_sessions().await,
    })
}

fn cards(cards: Vec<Arc<AgentCard>>) -> Vec<AgentCard> {
    cards.iter().map(|card| card.as_ref().clone()).collect()
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentCard>> {
    Json(cards(state.broker.registry().list()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    pub agent_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// URL the broker POSTs request envelopes to.
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

async fn register_agent(
    State(state): State<AppState>,
    Json(body): Json<RegisterAgentRequest>,
) -> JsonResponse<AgentCard, BrokerError> {
    info!(agent_id = %body.agent_id, endpoint = %body.endpoint, "Received agent registration");

    let mut agent = Agent::new(body.agent_id, body.endpoint.clone());
    if let Some(name) = body.name {
        agent = agent.with_name(name);
    }
    if let Some(description) = body.description {
        agent = agent.with_description(description);
    }
    agent.capabilities = body.capabilities;
    agent.metadata = body.metadata;

    let handler = Arc::new(RemoteAgentHandler::new(
        state.http_client.clone(),
        body.endpoint,
    ));
    state
        .broker
        .register_agent(agent, handler)
        .map(|card| card.as_ref().clone())
        .into()
}

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    capability: String,
}

async fn discover_agents(
    State(state): State<AppState>,
    Query(query): Query<DiscoverQuery>,
) -> Json<Vec<AgentCard>> {
    Json(cards(state.broker.registry().discover(&query.capability).to_vec()))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> JsonResponse<Agent, BrokerError> {
    state.broker.registry().lookup(&agent_id).into()
}

async fn deregister_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Json<Value> {
    let deregistered = state.broker.deregister_agent(&agent_id);
    Json(json!({ "agent_id": agent_id, "deregistered": deregistered }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub agent_id: String,
    pub status: AgentStatus,
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> JsonResponse<HeartbeatResponse, BrokerError> {
    state
        .broker
        .registry()
        .heartbeat(&agent_id)
        .map(|status| HeartbeatResponse { agent_id, status })
        .into()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeliverResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

async fn deliver_message(
    State(state): State<AppState>,
    Json(envelope): Json<MessageEnvelope>,
) -> JsonResponse<DeliverResponse, BrokerError> {
    state
        .broker
        .router()
        .deliver(envelope)
        .map(|delivery| match delivery {
            Delivery::Published { sequence } => DeliverResponse {
                accepted: true,
                sequence: Some(sequence),
            },
            Delivery::Resolved => DeliverResponse {
                accepted: true,
                sequence: None,
            },
        })
        .into()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub from_agent_id: String,
    pub to_agent_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Answer with a `text/event-stream` instead of a single JSON body.
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: SessionId,
    pub correlation_id: CorrelationId,
    pub status: SessionStatus,
    pub events: Vec<StreamEvent>,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

async fn start_session(
    State(state): State<AppState>,
    Json(body): Json<StartSessionRequest>,
) -> Response {
    info!(to_agent_id = %body.to_agent_id, stream = body.stream, "Received session request");

    let request = SessionRequest {
        session_id: body.session_id,
        from_agent_id: body.from_agent_id,
        to_agent_id: body.to_agent_id,
        payload: body.payload,
        deadline: body.deadline_ms.map(Duration::from_millis),
    };
    let mut handle = match state.broker.start_session(request).await {
        Ok(handle) => handle,
        Err(e) => return e.into_response(),
    };

    if body.stream {
        let keep_alive = state.broker.config().keep_alive_interval;
        let stream = async_stream::stream! {
            if let Some(mut events) = handle.events() {
                while let Some(event) = events.next_event().await {
                    yield Event::default()
                        .event(event.event_type.as_str())
                        .id(event.sequence.to_string())
                        .json_data(&event);
                }
            }
            let session_id = handle.session_id().clone();
            match handle.result().await {
                Ok(result) => {
                    yield Event::default()
                        .event("result")
                        .json_data(json!({ "session_id": session_id, "result": result }));
                }
                Err(e) => {
                    yield Event::default().event("error").json_data(e.to_payload());
                }
            }
        };

        return Sse::new(stream)
            .keep_alive(
                KeepAlive::new()
                    .interval(keep_alive)
                    .text("keep-alive"),
            )
            .into_response();
    }

    let session_id = handle.session_id().clone();
    let correlation_id = handle.correlation_id().clone();
    let ((events, close_reason), outcome) = match handle.events() {
        Some(events) => tokio::join!(events.collect_events(), handle.result()),
        None => ((vec![], None), handle.result().await),
    };

    let (status_code, status, result, error) = match outcome {
        Ok(result) => (StatusCode::OK, SessionStatus::Completed, Some(result), None),
        Err(e) => {
            let status = match e {
                BrokerError::RequestTimeout { .. } => SessionStatus::Expired,
                _ => SessionStatus::Failed,
            };
            (e.status_code(), status, None, Some(e.to_payload()))
        }
    };

    (
        status_code,
        Json(SessionResponse {
            session_id,
            correlation_id,
            status,
            events,
            close_reason,
            result,
            error,
        }),
    )
        .into_response()
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> JsonResponse<SessionRecord, BrokerError> {
    state.broker.sessions().session(&session_id).await.into()
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> JsonResponse<SessionRecord, BrokerError> {
    let result = match state.broker.cancel_session(&session_id).await {
        Ok(()) => state.broker.sessions().session(&session_id).await,
        Err(e) => Err(e),
    };
    result.into()
}
