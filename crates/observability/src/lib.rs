//! Process-wide logging setup for boxoffice binaries.

/// Initialize tracing for the process with the format chosen by
/// `BOXOFFICE_LOG_FORMAT` (`json`, the default, or `pretty`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber configuration (filters, formats).
pub mod tracing;

pub use crate::tracing::LogFormat;
