//! In-flight operation tracking.
//!
//! Counts outstanding units of work so the coordinator can wait for the
//! count to drain to zero before declaring shutdown complete.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::error;

/// Errors reported by the operation tracker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("unbalanced end: no operation in flight")]
    Unbalanced,
}

/// Process-wide counter of outstanding operations.
///
/// Cloning the tracker yields another handle to the same counter.
#[derive(Clone, Debug)]
pub struct OperationTracker {
    count: Arc<watch::Sender<usize>>,
}

impl OperationTracker {
    /// Create a tracker with no operations in flight.
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Record the start of an operation.
    pub fn begin(&self) {
        self.count.send_modify(|count| *count += 1);
    }

    /// Record the end of an operation.
    ///
    /// Calling this without a matching `begin` is a caller bug; it is
    /// reported and the counter is left at zero.
    pub fn end(&self) -> Result<(), TrackerError> {
        let decremented = self.count.send_if_modified(|count| {
            if *count == 0 {
                false
            } else {
                *count -= 1;
                true
            }
        });

        if decremented {
            Ok(())
        } else {
            error!("operation ended without a matching begin");
            Err(TrackerError::Unbalanced)
        }
    }

    /// Record the start of an operation and return a guard that ends it on drop.
    pub fn track(&self) -> OperationGuard {
        self.begin();
        OperationGuard {
            tracker: self.clone(),
        }
    }

    /// Number of operations currently in flight.
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no operations are in flight.
    ///
    /// Returns immediately if the count is already zero. Any number of tasks
    /// may wait concurrently; all are released together.
    pub async fn wait_zero(&self) {
        let mut receiver = self.count.subscribe();
        let _ = receiver.wait_for(|count| *count == 0).await;
    }
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for a single in-flight operation.
///
/// Ends the operation exactly once when dropped.
#[derive(Debug)]
#[must_use = "dropping the guard ends the operation immediately"]
pub struct OperationGuard {
    tracker: OperationTracker,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        // A guard always pairs with its own begin.
        let _ = self.tracker.end();
    }
}
