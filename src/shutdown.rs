use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cooperative shutdown flag shared by every polling loop in a job.
///
/// Setting it only stops new work from being started. Remote calls already in flight run to
/// completion against their own time limits.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a handler that flips the flag on SIGTERM or SIGINT.
    pub fn install_signal_handler(&self) -> std::io::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::warn!("Received SIGTERM, will try to shut down gracefully");
                }
                _ = sigint.recv() => {
                    tracing::warn!("Received SIGINT, will try to shut down gracefully");
                }
                _ = token.cancelled() => return,
            }
            token.cancel();
        });
        Ok(())
    }

    pub fn signal(&self) {
        self.token.cancel();
    }

    /// Non-blocking read of the flag.
    pub fn is_signaled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sleeps for `period`, waking early if shutdown is signaled.
    pub async fn sleep(&self, period: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = self.token.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    #[tokio::test]
    async fn signal_is_visible_to_clones() {
        let shutdown = ShutdownCoordinator::new();
        let clone = shutdown.clone();
        assert!(!clone.is_signaled());
        shutdown.signal();
        assert!(clone.is_signaled());
        // Idempotent.
        shutdown.signal();
        assert!(clone.is_signaled());
    }

    #[tokio::test]
    async fn sleep_wakes_early_on_signal() {
        let shutdown = ShutdownCoordinator::new();
        let waker = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waker.signal();
        });
        let start = Instant::now();
        shutdown.sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
