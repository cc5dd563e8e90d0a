pub mod controller;
pub mod in_memory_session_store;
pub mod session;
pub mod store;

pub use controller::{SessionController, SessionHandle, SessionOutcome};
pub use in_memory_session_store::InMemorySessionStore;
pub use session::{SessionRecord, SessionRequest, SessionRequestBuilder, SessionStatus};
pub use store::SessionStore;
