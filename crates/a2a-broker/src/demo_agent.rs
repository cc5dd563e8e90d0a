use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    agent_execution::{AgentContext, AgentHandler, HandlerError},
    registry::{Agent, Capability},
};

pub const WEATHER_AGENT_ID: &str = "weather";

/// In-process agent that reports a fixed temperature for any city.
///
/// It publishes a single `{"status": "searching"}` progress event before
/// answering, so it exercises both the stream and the correlation paths.
#[derive(Debug, Default, Clone)]
pub struct WeatherAgent;

impl WeatherAgent {
    pub fn agent() -> Agent {
        Agent::new(WEATHER_AGENT_ID, "local://weather")
            .with_name("Weather")
            .with_description("Reports the current temperature for a city")
            .with_capability(
                Capability::named("weather")
                    .with_tags(["forecast"])
                    .with_description("Current temperature lookup")
                    .with_schemas(
                        json!({
                            "type": "object",
                            "properties": {"city": {"type": "string"}},
                            "required": ["city"]
                        }),
                        json!({
                            "type": "object",
                            "properties": {"temp_c": {"type": "number"}}
                        }),
                    ),
            )
    }
}

#[async_trait]
impl AgentHandler for WeatherAgent {
    async fn handle(&self, ctx: AgentContext) -> Result<Option<Value>, HandlerError> {
        let city = ctx
            .payload()
            .get("city")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        info!(city = %city, correlation_id = %ctx.correlation_id(), "Looking up weather");

        ctx.publish(json!({"status": "searching"}))?;
        Ok(Some(json!({"temp_c": 18})))
    }
}
