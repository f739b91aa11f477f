//! Browser environment signals.
//!
//! The context reacts to connectivity, page visibility, window focus and
//! whether its host element is attached to the document. The embedding host
//! forwards those events here; contexts sharing one page can share one
//! [`BrowserSignals`].

use std::sync::Arc;

use tokio::sync::{Notify, watch};

#[derive(Debug)]
struct SignalsInner {
    online: watch::Sender<bool>,
    visible: watch::Sender<bool>,
    host_attached: watch::Sender<bool>,
    focus: Notify,
}

/// Handle to the browser state a context depends on.
#[derive(Debug, Clone)]
pub struct BrowserSignals {
    inner: Arc<SignalsInner>,
}

impl Default for BrowserSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl BrowserSignals {
    /// Signals for an online, visible page with the host attached.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalsInner {
                online: watch::Sender::new(true),
                visible: watch::Sender::new(true),
                host_attached: watch::Sender::new(true),
                focus: Notify::new(),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Forward a `window` `online`/`offline` event.
    pub fn set_online(&self, online: bool) {
        self.inner.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn is_visible(&self) -> bool {
        *self.inner.visible.borrow()
    }

    /// Forward a `visibilitychange` event.
    pub fn set_visible(&self, visible: bool) {
        self.inner.visible.send_if_modified(|current| {
            let changed = *current != visible;
            *current = visible;
            changed
        });
    }

    /// Forward a window `focus` event.
    pub fn focus(&self) {
        self.inner.focus.notify_waiters();
    }

    pub fn is_host_attached(&self) -> bool {
        *self.inner.host_attached.borrow()
    }

    /// Forward host element connect/disconnect from the document.
    pub fn set_host_attached(&self, attached: bool) {
        self.inner.host_attached.send_if_modified(|current| {
            let changed = *current != attached;
            *current = attached;
            changed
        });
    }

    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    pub fn watch_host_attached(&self) -> watch::Receiver<bool> {
        self.inner.host_attached.subscribe()
    }

    /// Resolves on the next online/offline flip.
    pub async fn online_changed(&self) {
        let mut rx = self.inner.online.subscribe();
        // The sender lives in `self`, so `changed` can only fail after drop.
        let _ = rx.changed().await;
    }

    /// Resolves once the browser reports connectivity.
    pub async fn until_online(&self) {
        let mut rx = self.inner.online.subscribe();
        let _ = rx.wait_for(|online| *online).await;
    }

    /// Resolves on the next window focus.
    pub async fn focused(&self) {
        self.inner.focus.notified().await;
    }
}
