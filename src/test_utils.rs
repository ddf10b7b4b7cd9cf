//! Shared support for unit tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing` subscriber honoring `RUST_LOG`. Idempotent.
pub(crate) fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
