//! Tracing subscriber setup for binaries and tests.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to the host
//! application. Events carry `job_id`, `document_id`, `service` and `tier` fields so logs can
//! be joined across components; secrets only ever appear as fingerprints.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `INTAKE_LOG`, then `RUST_LOG`, then `default`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(default: &str) {
    let filter = std::env::var("INTAKE_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
