//! Worker memory watchdog.
//!
//! Samples resident set size from `/proc/self/status` and logs a warning
//! when it crosses the configured threshold. Enabled by the
//! `MEMORY_MONITORING` environment flag; a no-op on platforms without
//! procfs.

use std::time::Duration;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns the sampling task. Detached; lives for the process lifetime.
pub fn spawn_monitor(warn_threshold_mb: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            interval.tick().await;
            let Some(rss_kb) = resident_set_kb() else {
                return;
            };
            let rss_mb = rss_kb / 1024;
            if rss_mb >= warn_threshold_mb {
                tracing::warn!(rss_mb, threshold_mb = warn_threshold_mb, "worker memory above threshold");
            } else {
                tracing::debug!(rss_mb, "worker memory sample");
            }
        }
    });
}

fn resident_set_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss_kb(&status)
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}
