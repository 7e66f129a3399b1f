/// Tracing subscriber installation and log file housekeeping.
pub mod logsetup;

pub use logsetup::{cleanup_old_logs, init_logging, LogError, LogOptions};
