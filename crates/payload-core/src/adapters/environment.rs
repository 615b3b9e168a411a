//! # Environment
//!
//! Focus and connectivity flags shared by every entry and observer of one
//! client. Platform detection is left to the embedder, which reports changes
//! through `PayloadClient::set_focused` / `set_online`.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Focus and connectivity state.
#[derive(Debug)]
pub struct Environment {
    focused: AtomicBool,
    online: watch::Sender<bool>,
}

impl Environment {
    /// Focused and online.
    pub fn new() -> Self {
        let (online, _) = watch::channel(true);
        Self {
            focused: AtomicBool::new(true),
            online,
        }
    }

    /// Whether the consumer is in the foreground.
    pub fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    /// Record a focus change. Returns true if the flag changed.
    pub fn set_focused(&self, focused: bool) -> bool {
        self.focused.swap(focused, Ordering::SeqCst) != focused
    }

    /// Whether the network is reachable.
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Record a connectivity change. Returns true if the flag changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    /// Resolve once online. Returns immediately if already online.
    pub async fn wait_online(&self) {
        let mut rx = self.online.subscribe();
        // wait_for only errors when the sender is gone, which cannot happen while &self lives
        let _ = rx.wait_for(|online| *online).await;
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
