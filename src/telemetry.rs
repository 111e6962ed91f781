//! Tracing setup. Call [`init`] once, early in `main`, before any graph is
//! built; every module logs through `tracing` rather than `println!`.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global `tracing` subscriber honoring `RUST_LOG` (defaulting to
/// `info` when unset). Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
