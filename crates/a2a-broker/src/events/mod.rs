pub mod event_stream;
pub mod in_memory_stream_manager;
pub mod stream_manager;
pub mod subscription;

pub use event_stream::{
    CloseReason, DEFAULT_EVENT_TYPE, EventStream, StreamEvent, typed_payload,
};
pub use in_memory_stream_manager::InMemoryStreamManager;
pub use stream_manager::StreamManager;
pub use subscription::EventSubscription;
