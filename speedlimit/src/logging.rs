//! One-shot subscriber setup for binaries. Library code never calls this —
//! only `main.rs` does, so the library composes inside a caller's own
//! tracing setup (tests included) without a second subscriber fighting it.
use tracing_subscriber::EnvFilter;

/// Honors `SPEEDLIMIT_LOG`, falling back to `RUST_LOG`, falling back to
/// `info`.
pub fn init() {
    let filter = EnvFilter::try_from_env("SPEEDLIMIT_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
