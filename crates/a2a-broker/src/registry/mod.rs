pub mod agent;
pub mod agent_registry;

pub use agent::*;
pub use agent_registry::*;
