//! System resource sampling.
//!
//! Sampling walks the process table and is CPU-bound, so it always runs on
//! the blocking pool and never stalls the cooperative scheduler.

use sysinfo::{ProcessesToUpdate, System};

/// Memory-usage percentage above which an alert is raised.
pub const HIGH_MEMORY_PERCENT: f64 = 85.0;

/// CPU-usage percentage above which an alert is raised.
pub const HIGH_CPU_PERCENT: f64 = 90.0;

/// Browser process count above which an alert is raised.
pub const HIGH_BROWSER_PROCESS_COUNT: usize = 20;

/// One sample of system resource usage.
#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    /// Used memory as a percentage of total.
    pub memory_percent: f64,
    /// Available memory in GiB.
    pub memory_available_gb: f64,
    /// Global CPU usage percentage.
    pub cpu_percent: f64,
    /// One-minute load average (0.0 where unsupported).
    pub load_one: f64,
    /// Total number of processes.
    pub process_count: usize,
    /// Number of browser (chrome/chromium) processes.
    pub browser_process_count: usize,
}

impl ResourceSnapshot {
    /// Whether any alert threshold is exceeded.
    pub fn has_alerts(&self) -> bool {
        self.memory_percent > HIGH_MEMORY_PERCENT
            || self.cpu_percent > HIGH_CPU_PERCENT
            || self.browser_process_count > HIGH_BROWSER_PROCESS_COUNT
    }
}

/// Takes a sample on the current thread.
pub fn sample_blocking() -> ResourceSnapshot {
    let mut sys = System::new();
    sys.refresh_memory();

    // CPU usage needs two refreshes a short interval apart.
    sys.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();

    sys.refresh_processes(ProcessesToUpdate::All, true);

    let total = sys.total_memory();
    let memory_percent = if total > 0 {
        sys.used_memory() as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    let memory_available_gb = sys.available_memory() as f64 / (1024.0 * 1024.0 * 1024.0);

    let browser_process_count = sys
        .processes()
        .values()
        .filter(|p| {
            let name = p.name().to_string_lossy().to_lowercase();
            name.contains("chrome") || name.contains("chromium")
        })
        .count();

    ResourceSnapshot {
        memory_percent,
        memory_available_gb,
        cpu_percent: sys.global_cpu_usage() as f64,
        load_one: System::load_average().one,
        process_count: sys.processes().len(),
        browser_process_count,
    }
}

/// Takes a sample on the blocking pool.
pub async fn sample() -> ResourceSnapshot {
    tokio::task::spawn_blocking(sample_blocking)
        .await
        .unwrap_or_default()
}

/// Logs a snapshot with a context label.
pub fn log_resources(context: &str, snapshot: &ResourceSnapshot) {
    tracing::info!(
        context = %context,
        memory_pct = format!("{:.1}", snapshot.memory_percent),
        memory_available_gb = format!("{:.2}", snapshot.memory_available_gb),
        cpu_pct = format!("{:.1}", snapshot.cpu_percent),
        load_1min = format!("{:.2}", snapshot.load_one),
        processes = snapshot.process_count,
        browser_processes = snapshot.browser_process_count,
        "System resources"
    );
}

/// Raises warnings for concerning resource levels.
pub fn check_alerts(snapshot: &ResourceSnapshot) {
    if snapshot.memory_percent > HIGH_MEMORY_PERCENT {
        tracing::warn!(
            memory_pct = format!("{:.1}", snapshot.memory_percent),
            "High memory usage"
        );
    }
    if snapshot.cpu_percent > HIGH_CPU_PERCENT {
        tracing::warn!(
            cpu_pct = format!("{:.1}", snapshot.cpu_percent),
            "High CPU usage"
        );
    }
    if snapshot.browser_process_count > HIGH_BROWSER_PROCESS_COUNT {
        tracing::warn!(
            browser_processes = snapshot.browser_process_count,
            "High browser process count"
        );
    }
}
