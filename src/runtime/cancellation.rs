//! Per-run cancellation token.
//!
//! Aborting flips the token; adapters race their work against
//! [`RunCancellation::cancelled`] and terminate their child process when it
//! fires. The worker resolves the run's pending permissions on abort.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// One token per run. Cloning shares the same token.
#[derive(Debug, Clone, Default)]
pub struct RunCancellation {
    token: CancellationToken,
}

impl RunCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn abort(&self) {
        if !self.token.is_cancelled() {
            log::debug!("Run cancellation requested");
        }
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once [`abort`](Self::abort) has been called.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
