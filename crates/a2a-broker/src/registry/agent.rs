use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Degraded,
}

/// A named skill an agent declares, with the shapes it accepts and returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Capability {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: Value::Null,
            output_schema: Value::Null,
            tags: vec![],
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_schemas(mut self, input_schema: Value, output_schema: Value) -> Self {
        self.input_schema = input_schema;
        self.output_schema = output_schema;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Weaker match used after exact name matches: case-insensitive name or tag.
    pub(crate) fn loosely_matches(&self, query: &str) -> bool {
        self.name.eq_ignore_ascii_case(query)
            || self.tags.iter().any(|tag| tag.eq_ignore_ascii_case(query))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Opaque address, e.g. the URL a remote agent receives requests on.
    pub endpoint: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(agent_id: impl Into<AgentId>, endpoint: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            name: agent_id.clone(),
            agent_id,
            description: None,
            capabilities: vec![],
            endpoint: endpoint.into(),
            status: AgentStatus::Online,
            metadata: Map::new(),
            registered_at: Utc::now(),
            last_heartbeat: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }
}

/// Public, immutable snapshot of an agent used for discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCard {
    pub agent_id: AgentId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub endpoint: String,
    pub capabilities: Vec<Capability>,
    pub generated_at: DateTime<Utc>,
}

impl AgentCard {
    pub fn from_agent(agent: &Agent) -> Self {
        Self {
            agent_id: agent.agent_id.clone(),
            name: agent.name.clone(),
            description: agent.description.clone(),
            endpoint: agent.endpoint.clone(),
            capabilities: agent.capabilities.clone(),
            generated_at: Utc::now(),
        }
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    pub(crate) fn loosely_matches(&self, query: &str) -> bool {
        self.capabilities.iter().any(|c| c.loosely_matches(query))
    }
}
