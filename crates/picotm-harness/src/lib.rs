//! Shared support for the integration tests under `tests/`: one file per
//! end-to-end scenario of spec.md §8, in the teacher's `tests/`-directory,
//! scenario-per-file convention (`fsqlite-harness`).

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Installs a `tracing` subscriber once per test binary, so a failing
/// scenario's transaction-boundary logs (emitted by `picotm-core` at
/// `debug`/`info`) show up in `cargo test -- --nocapture` output.
pub fn init_test_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .try_init();
    });
}
