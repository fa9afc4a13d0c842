//! Run-until-cancelled signalling.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation signal shared by every long-running task.
///
/// Backed by a watch channel, so a task that starts waiting after
/// [`ShutdownSignal::shutdown`] was called still returns immediately.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create a new, untriggered signal.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger the signal. Returns `true` only for the call that flipped it.
    pub fn shutdown(&self) -> bool {
        !self.sender.send_replace(true)
    }

    /// Whether the signal has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait until the signal is triggered.
    pub async fn wait(&self) {
        let mut rx = self.sender.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
