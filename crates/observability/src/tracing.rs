//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Install a JSON subscriber filtered by `RUST_LOG`, or `default_level`.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // JSON logs + timestamps.
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        ::tracing::debug!(default_level, "tracing initialized");
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init("debug");
        super::init("warn");
        crate::init();
    }
}
