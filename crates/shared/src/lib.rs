pub mod env;
pub mod error;
pub mod logging;
pub mod subsystem;
pub mod test_utils;
