//! Cooperative cancellation handed to backends alongside the context.
//!
//! The orchestrator fires the signal when a run overstays its budget.
//! Backends that can actually interrupt the in-flight work call
//! [`CancelSignal::acknowledge`] so the outcome can say so.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    acknowledged: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that also fires when `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            acknowledged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Records that in-flight work was really interrupted.
    ///
    /// Ignored unless cancellation was requested first.
    pub fn acknowledge(&self) {
        if self.is_cancelled() {
            self.acknowledged.store(true, Ordering::Release);
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }
}
