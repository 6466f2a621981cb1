//! One-shot broadcast signal.
//!
//! A `Signal` starts unset and transitions to set exactly once. Any number of
//! tasks may wait on it, before or after the transition. A [`SignalWatch`]
//! observes a signal without being able to set it.

use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable one-shot notification.
#[derive(Clone, Debug)]
pub struct Signal {
    sender: Arc<watch::Sender<bool>>,
}

impl Signal {
    /// Create a new, unset signal.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Set the signal.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn fire(&self) -> bool {
        self.sender.send_if_modified(|set| {
            if *set {
                false
            } else {
                *set = true;
                true
            }
        })
    }

    /// Check whether the signal has been set.
    pub fn is_set(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait until the signal is set.
    pub async fn wait(&self) {
        wait_set(&self.sender).await
    }

    /// Read-only view of this signal.
    pub fn watch(&self) -> SignalWatch {
        SignalWatch {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes a [`Signal`] without being able to set it.
#[derive(Clone, Debug)]
pub struct SignalWatch {
    sender: Arc<watch::Sender<bool>>,
}

impl SignalWatch {
    /// Check whether the signal has been set.
    pub fn is_set(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait until the signal is set.
    pub async fn wait(&self) {
        wait_set(&self.sender).await
    }
}

async fn wait_set(sender: &watch::Sender<bool>) {
    let mut receiver = sender.subscribe();
    // The sender lives as long as the caller's handle, so the channel cannot close here.
    let _ = receiver.wait_for(|set| *set).await;
}
