//! In-process cross-document message channel.
//!
//! Mirrors a window's `message` event: listeners are registered and removed by
//! id, and every dispatched event is delivered synchronously to the listeners
//! registered at dispatch time, in registration order. A listener removed
//! while an event is being delivered does not see that event; one added
//! during delivery only sees later events.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;

/// One message delivered on the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// Origin of the sender, as reported by the platform.
    pub origin: String,
    pub data: Value,
}

impl MessageEvent {
    pub fn new(origin: impl Into<String>, data: Value) -> Self {
        Self {
            origin: origin.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
}

/// Shared handle to the channel. Clones refer to the same listener set.
#[derive(Clone, Default)]
pub struct MessageChannel {
    inner: Arc<Inner>,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners().push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Deliver an event to every registered listener.
    pub fn dispatch(&self, event: &MessageEvent) {
        let snapshot: Vec<(ListenerId, Listener)> = self.listeners().clone();

        for (id, listener) in snapshot {
            // Skip listeners removed by an earlier listener for this event.
            if !self.listeners().iter().any(|(existing, _)| *existing == id) {
                continue;
            }
            listener(event);
        }
    }

    /// Convenience for `dispatch(&MessageEvent::new(origin, data))`.
    pub fn post_message(&self, origin: impl Into<String>, data: Value) {
        self.dispatch(&MessageEvent::new(origin, data));
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
