use std::sync::Once;

pub static INIT_TEST_ONCE: Once = Once::new();

/// Loads `.env` files and installs logging, once per test binary.
#[macro_export]
macro_rules! setup_test {
    () => {{
        $crate::test_utils::helpers::INIT_TEST_ONCE.call_once(|| {
            $crate::env::load_optional_env_files();
            if let Err(e) = $crate::logging::configure_logging() {
                eprintln!("failed to configure test logging: {e}");
            }
        });
    }};
}
