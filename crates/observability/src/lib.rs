//! Process-wide tracing setup shared by the deferq binaries.

/// Tracing configuration (filters, layers).
pub mod subscriber;

pub use subscriber::{LogFormat, LogSettings};

/// Initialize process-wide tracing with JSON output and an `info` default
/// filter, overridable through `RUST_LOG`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(&LogSettings::default());
}
