// Copyright 2024 contributors to BeholdFS.

//! Tracing subscriber setup for the mount entry point (spec §5 "Shared
//! resources", SPEC_FULL.md "Logging").
//!
//! Grounded on conserve's `mount.rs` / `logger.rs` pattern of installing
//! one process-wide subscriber before doing any real work, generalized
//! from `log`+`term` to `tracing`+`tracing_subscriber`.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber filtered at `level`, or below
/// it if `RUST_LOG` is set (which always wins, matching
/// `EnvFilter::from_default_env`'s usual precedence).
///
/// Fails only if a subscriber is already installed, which would
/// indicate a programming error (`main` calls this exactly once).
pub fn init(level: tracing::Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already installed; ignoring later init() call");
    }
}
