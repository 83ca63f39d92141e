//! Health checking: sweep, history/uptime, liveness and diagnostics

pub mod checker;
pub mod diagnostics;
pub mod history;

pub use checker::{classify_http_status, HealthChecker};
pub use diagnostics::{memory_stats, KERNEL_VERSION};
pub use history::{uptime_percent, HealthHistory};
