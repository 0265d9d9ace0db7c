//! Tracing and logging setup shared by every process.

/// Subscriber configuration (filter, output format).
pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat, ParseLogFormatError};

/// Initialize process-wide logging from `RUST_LOG` and `LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init(LogConfig::from_env());
}
