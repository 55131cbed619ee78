//! Background observability and lifecycle monitoring.
//!
//! Two background loops run for a batch's duration: the resource monitor
//! (periodic sampling with alerts) and the heartbeat (liveness logging for
//! long batches). Both exist purely for observability and make no
//! guarantees about when they interleave with task stages. The shutdown
//! controller coordinates graceful termination via a cancellation token.

pub mod resources;
pub mod shutdown;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

pub use resources::{check_alerts, log_resources, sample, ResourceSnapshot};
pub use shutdown::ShutdownController;

/// Bound on waiting for a background loop to stop before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Background resource-sampling loop.
///
/// Wakes every `interval`, logs the sample, and raises alerts for
/// concerning levels. Call [`ResourceMonitor::stop`] to tear it down.
pub struct ResourceMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    /// Starts the monitor loop.
    pub fn start(interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop_flag);

        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Resource monitoring started");
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snapshot = resources::sample().await;
                resources::log_resources("monitor", &snapshot);
                resources::check_alerts(&snapshot);
            }

            tracing::info!("Resource monitoring stopped");
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signals the loop to stop and joins it, bounded by 5s, else aborts.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!("Resource monitor did not stop gracefully");
                handle.abort();
            }
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Periodic liveness log for long-running batches.
pub struct Heartbeat {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Starts the heartbeat, reporting elapsed time since `batch_start`.
    pub fn start(batch_start: Instant, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop_flag);

        let handle = tokio::spawn(async move {
            tracing::info!("Heartbeat monitoring started");
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            let mut beats: u64 = 0;

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                beats += 1;
                let snapshot = resources::sample().await;
                tracing::info!(
                    beat = beats,
                    elapsed_secs = format!("{:.1}", batch_start.elapsed().as_secs_f64()),
                    "Batch still running"
                );
                resources::log_resources("heartbeat", &snapshot);

                if snapshot.memory_percent > 90.0 {
                    tracing::error!(
                        memory_pct = format!("{:.1}", snapshot.memory_percent),
                        "Memory usage critical, OOM risk"
                    );
                }
                if snapshot.browser_process_count > 50 {
                    tracing::warn!(
                        browser_processes = snapshot.browser_process_count,
                        "Very high browser process count"
                    );
                }
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signals the loop to stop and joins it, bounded by 5s, else aborts.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!("Heartbeat task did not stop gracefully");
                handle.abort();
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resource_monitor_start_stop() {
        let monitor = ResourceMonitor::start(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(120)).await;
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_start_stop() {
        let heartbeat = Heartbeat::start(Instant::now(), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(120)).await;
        heartbeat.stop().await;
    }
}
