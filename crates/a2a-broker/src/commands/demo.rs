use std::sync::Arc;
use std::time::Duration;

use a2a_broker::{
    config::BrokerConfig,
    demo_agent::{WEATHER_AGENT_ID, WeatherAgent},
    service::A2aBroker,
    sessions::SessionRequestBuilder,
};
use clap::Parser;
use serde_json::json;
use shared::error::CommonError;
use tracing::info;

#[derive(Debug, Clone, Parser)]
pub struct DemoParams {
    #[arg(long, default_value = "Seoul")]
    pub city: String,
    #[arg(long, default_value = "5000")]
    pub deadline_ms: u64,
}

pub async fn cmd_demo(params: DemoParams) -> Result<(), CommonError> {
    let broker = A2aBroker::new(BrokerConfig::default());
    broker.register_agent(WeatherAgent::agent(), Arc::new(WeatherAgent))?;

    let discovered: Vec<String> = broker
        .registry()
        .discover("weather")
        .iter()
        .map(|card| card.agent_id.clone())
        .collect();
    info!(?discovered, "Discovered weather agents");

    let request = SessionRequestBuilder::default()
        .from_agent_id("demo")
        .to_agent_id(WEATHER_AGENT_ID)
        .payload(json!({ "city": params.city }))
        .deadline(Duration::from_millis(params.deadline_ms))
        .build()
        .map_err(|e| CommonError::InvalidRequest {
            msg: format!("invalid session request: {e}"),
            source: None,
        })?;

    let mut handle = broker.start_session(request).await?;
    let session_id = handle.session_id().clone();
    info!(session_id = %session_id, "Session started");

    let (events, outcome) = match handle.events() {
        Some(events) => tokio::join!(events.collect_events(), handle.result()),
        None => ((vec![], None), handle.result().await),
    };
    let (events, close_reason) = events;
    for event in &events {
        info!(sequence = event.sequence, data = %event.data, "Stream event");
    }
    info!(?close_reason, "Stream closed");

    let result = outcome?;
    info!(result = %result, "Session completed");

    let record = broker.sessions().session(&session_id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
