pub mod communication_router;
pub mod correlation;

pub use communication_router::{CommunicationRouter, Delivery, SendOptions};
pub use correlation::{CorrelationHandle, CorrelationState, Resolution};
