pub mod axum;
pub mod utils;

pub use self::axum::{AppState, create_router};
