//! Structured logging initialization.
//!
//! Library code never calls `println!`; every module emits `tracing` events
//! carrying the fields the error design calls out (`image`, `digest`,
//! `manifest_id`, `path`). This module only wires up a subscriber for
//! binaries that embed the crate — the library itself stays subscriber-agnostic.

use tracing_subscriber::{EnvFilter, fmt};

/// Installs a global `tracing` subscriber honoring `RUST_LOG`, defaulting to
/// `info` level when the environment variable is unset.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
