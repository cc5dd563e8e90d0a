pub mod agent_handler;
pub mod context;
pub mod remote_agent_handler;

pub use agent_handler::*;
pub use context::*;
pub use remote_agent_handler::*;
