//! Workflow-level cancellation.
//!
//! A cheap, cloneable token checked at every suspension point. Cancelling
//! signals all outstanding invocations; newly arriving intents are rejected
//! with [`EngineError::Cancelled`](crate::error::EngineError::Cancelled).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cloneable cancellation signal. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been signalled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check to close the race between the flag store and waiter
            // registration.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
