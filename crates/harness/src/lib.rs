pub mod backend;
pub mod client;
pub mod faults;

pub use backend::TestBackend;
pub use client::{TestClient, WAIT, eventually};
pub use faults::{Fault, FaultyChannel, GatedRemote};

use std::sync::Once;

/// Install a fmt subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
