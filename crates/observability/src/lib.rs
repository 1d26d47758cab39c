//! Tracing and logging setup shared by binaries and tests.

/// Initialize process-wide tracing with the default `info` filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Initialize process-wide tracing, falling back to `default_level` when
/// `RUST_LOG` is unset or unparsable.
pub fn init_with_level(default_level: &str) {
    tracing::init(default_level);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
