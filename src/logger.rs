//! Logging bring-up
//!
//! Library code logs through the `log` facade only. Binaries call
//! [`init`]; tests call [`init_for_tests`]. Both are idempotent.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install `env_logger`, honouring `RUST_LOG` (default `info`)
pub fn init() {
    INIT.call_once(|| {
        let env = env_logger::Env::default().default_filter_or("info");
        if env_logger::Builder::from_env(env).format_timestamp_millis().try_init().is_err() {
            log::debug!("logger already installed");
        }
    });
}

/// Logger for unit and integration tests; output is captured per test
pub fn init_for_tests() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
