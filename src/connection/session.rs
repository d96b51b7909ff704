//! Hooks for components that live on top of a session
//!
//! Receivers register here so the manager can replay their subscriptions
//! after every successful connect and hand them inbound traffic. The
//! registry holds weak references; a dropped receiver simply disappears.

use crate::message::InboundMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

#[async_trait]
pub(crate) trait SessionListener: Send + Sync {
    /// A new session is up; reinstall whatever the listener needs
    async fn on_session_established(&self);

    /// Inbound message from the live session. May wait, which slows the
    /// session read loop down.
    async fn on_inbound(&self, message: &InboundMessage);
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Weak<dyn SessionListener>)>>,
}

impl SessionRegistry {
    pub(crate) fn register(&self, listener: Weak<dyn SessionListener>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(entry_id, _)| *entry_id != id);
    }

    /// Live listeners in registration order; prunes dropped ones
    pub(crate) fn live(&self) -> Vec<Arc<dyn SessionListener>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(_, weak)| weak.strong_count() > 0);
        entries.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    pub(crate) async fn session_established(&self) {
        for listener in self.live() {
            listener.on_session_established().await;
        }
    }

    pub(crate) async fn dispatch(&self, message: &InboundMessage) {
        for listener in self.live() {
            listener.on_inbound(message).await;
        }
    }
}
