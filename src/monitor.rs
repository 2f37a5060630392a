//! Operator-facing status and light resource sampling.
//!
//! The daemon renders a [`StatusSnapshot`] on SIGUSR1; validation records
//! peak RSS after large passes. Both are read-only observers, never inputs
//! to pipeline decisions.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time view of the daemon, logged on SIGUSR1.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub watermark: Option<DateTime<Utc>>,
    pub last_cycle_secs: Option<f64>,
    pub cycles_completed: u64,
    pub consecutive_errors: u32,
}

impl StatusSnapshot {
    pub fn render(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

/// Peak resident set size in KiB, from `/proc/self/status` (`VmHWM`).
/// `None` off Linux or if procfs is unreadable.
pub fn peak_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            return rest.trim().trim_end_matches(" kB").trim().parse().ok();
        }
    }
    None
}
