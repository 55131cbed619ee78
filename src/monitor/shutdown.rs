//! Graceful shutdown coordination.
//!
//! A [`ShutdownController`] owns the cancellation token propagated into the
//! coordinator and every task pipeline. The binary entry point installs the
//! interrupt listener: the first signal requests cooperative shutdown and
//! arms a hard watchdog that force-exits once the grace period elapses; a
//! second signal exits immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default grace period before the watchdog force-exits.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Coordinates cooperative shutdown across the batch.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    token: CancellationToken,
    grace_period: Duration,
    requested: Arc<AtomicBool>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ShutdownController {
    /// Creates a controller with the given maximum grace period.
    pub fn new(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace_period,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The cancellation token to propagate into the coordinator.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Requests cooperative shutdown.
    ///
    /// Returns `true` on the first request; subsequent requests return
    /// `false` so callers can escalate.
    pub fn request(&self) -> bool {
        let first = !self.requested.swap(true, Ordering::SeqCst);
        if first {
            tracing::warn!(
                grace_secs = self.grace_period.as_secs(),
                "Graceful shutdown requested"
            );
            self.token.cancel();
            self.arm_watchdog();
        }
        first
    }

    /// Arms a hard watchdog that force-exits the process once the grace
    /// period elapses. The thread does not keep the process alive, so a
    /// clean exit beforehand is unaffected.
    fn arm_watchdog(&self) {
        let grace_period = self.grace_period;
        std::thread::spawn(move || {
            std::thread::sleep(grace_period);
            tracing::error!(
                grace_secs = grace_period.as_secs(),
                "Graceful shutdown timed out, terminating"
            );
            std::process::exit(1);
        });
    }

    /// Installs the interrupt listener on the current runtime.
    ///
    /// First interrupt: cooperative shutdown plus watchdog. Second
    /// interrupt: immediate exit.
    pub fn install_interrupt_handler(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    tracing::error!("Failed to listen for interrupt signal");
                    return;
                }
                if !controller.request() {
                    tracing::error!("Second interrupt received, terminating immediately");
                    std::process::exit(1);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // request() arms a real watchdog thread; tests use a grace period far
    // longer than the test runtime so it never fires.
    #[test]
    fn test_first_request_wins() {
        let controller = ShutdownController::new(Duration::from_secs(3600));
        assert!(!controller.is_requested());
        assert!(controller.request());
        assert!(controller.is_requested());
        assert!(!controller.request());
    }

    #[tokio::test]
    async fn test_request_cancels_token() {
        let controller = ShutdownController::new(Duration::from_secs(3600));
        let token = controller.token();
        assert!(!token.is_cancelled());

        controller.request();
        token.cancelled().await;
    }
}
