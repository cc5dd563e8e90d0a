pub mod adapters;
pub mod agent_execution;
pub mod config;
pub mod demo_agent;
pub mod errors;
pub mod events;
pub mod registry;
pub mod router;
pub mod service;
pub mod sessions;
pub mod types;
