//! Tracing setup for tests.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a fmt subscriber writing through the test harness.
///
/// The filter comes from `RUST_LOG` and defaults to `debug` for the datasync
/// crates. Calling this more than once is harmless.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,datasync_engine=debug,datasync_matrix=debug,datasync_cloud=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
