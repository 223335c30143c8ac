use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative shutdown for the daemon's server and background loops.
///
/// The trigger is a latched `watch` flag, so a loop that starts waiting
/// after [`ShutdownSignal::trigger`] still observes it. Loops hold a
/// [`ShutdownGuard`] and the daemon waits for all of them with
/// [`ShutdownSignal::wait_for_drain`].
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let _guard = shutdown.guard();
///
/// tokio::select! {
///     _ = shutdown.triggered() => { /* drain */ }
///     _ = ticker.tick() => { /* work */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    triggered: Arc<watch::Sender<bool>>,
    drained: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (triggered, _) = watch::channel(false);
        let (drained, _) = watch::channel(0);
        Self {
            triggered: Arc::new(triggered),
            drained: Arc::new(drained),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.triggered.borrow()
    }

    /// Latch the shutdown flag. Repeated calls are no-ops.
    pub fn trigger(&self) {
        let first = self.triggered.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        });
        if first {
            info!("shutdown signal triggered");
        } else {
            debug!("shutdown already triggered");
        }
    }

    /// Resolves once shutdown has been triggered, immediately if it already was.
    pub async fn triggered(&self) {
        let mut rx = self.triggered.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|flag| *flag).await;
    }

    /// A guard that counts as drained when dropped.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            signal: self.clone(),
        }
    }

    pub fn drained_count(&self) -> usize {
        *self.drained.borrow()
    }

    /// Wait for `expected` guards to drop, with a timeout.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drained.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|count| *count >= expected))
            .await
            .map(|res| res.map(|count| *count));

        match waited {
            Ok(Ok(count)) => {
                info!(count, "background loops drained");
                DrainResult::Complete(count)
            }
            Ok(Err(_)) => DrainResult::Complete(self.drained_count()),
            Err(_) => {
                let confirmed = self.drained_count();
                warn!(confirmed, expected, "drain timed out before every loop stopped");
                DrainResult::Timeout {
                    confirmed,
                    expected,
                }
            }
        }
    }

    fn confirm_drained(&self) {
        self.drained.send_modify(|count| *count += 1);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard
// ---------------------------------------------------------------------------

/// Held by a background loop; dropping it confirms the loop has stopped.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
