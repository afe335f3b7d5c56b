//! Cancellable call context passed to every store operation.

use crate::error::{ErrorKind, StoreError, StoreResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Carries cancellation into store calls.
///
/// Clones share the cancellation flag, so cancelling any clone cancels all
/// calls made with the others.
#[derive(Debug, Clone, Default)]
pub struct StoreContext {
    cancelled: Arc<AtomicBool>,
}

impl StoreContext {
    /// A context that is not cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fails with `Canceled` once the context is cancelled.
    pub fn check(&self, op: &'static str, path: &str) -> StoreResult<()> {
        if self.is_cancelled() {
            return Err(StoreError::new(ErrorKind::Canceled, op, path));
        }
        Ok(())
    }
}
