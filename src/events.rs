//! Event bus: in-process delivery of inbound service notifications.
//!
//! DESIGN
//! ======
//! An external transport decodes push notifications into `Event`s and calls
//! `publish`. The cache-update hook runs first, then listeners in
//! registration order, so a listener that reads the cache sees the change
//! that caused its notification. Listeners are snapshotted before delivery;
//! subscribing from inside a listener affects the next event only.
//!
//! ERROR HANDLING
//! ==============
//! A listener that returns an error or panics is logged and skipped. The
//! remaining listeners still receive the event. Nothing is persisted or
//! replayed; a closed bus drops events.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

// =============================================================================
// EVENT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Typing,
    MessageReceived,
    TopicChanged,
    MemberJoined,
    MemberLeft,
    RoleChanged,
    Other(String),
}

/// One decoded notification. `payload` carries kind-specific fields
/// (`topic`, `role`, message text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub user: Option<String>,
    pub conversation: Option<String>,
    pub payload: Value,
}

impl Event {
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self { id: Uuid::new_v4(), kind, user: None, conversation: None, payload: Value::Null }
    }

    #[must_use]
    pub fn typing(user: impl Into<String>, conversation: impl Into<String>) -> Self {
        Self::new(EventKind::Typing).user(user).conversation(conversation)
    }

    #[must_use]
    pub fn topic_changed(conversation: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::new(EventKind::TopicChanged)
            .conversation(conversation)
            .payload(serde_json::json!({ "topic": topic.into() }))
    }

    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn conversation(mut self, conversation: impl Into<String>) -> Self {
        self.conversation = Some(conversation.into());
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

// =============================================================================
// LISTENER
// =============================================================================

pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives published events. Closures `Fn(&Event) -> ListenerResult` qualify.
pub trait EventListener: Send + Sync {
    /// # Errors
    ///
    /// An error is logged by the bus and does not stop delivery to others.
    fn on_event(&self, event: &Event) -> ListenerResult;
}

impl<F> EventListener for F
where
    F: Fn(&Event) -> ListenerResult + Send + Sync,
{
    fn on_event(&self, event: &Event) -> ListenerResult {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// =============================================================================
// EVENT BUS
// =============================================================================

/// Shared handle to the bus. Clone is cheap.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

#[derive(Default)]
struct EventBusInner {
    hook: RwLock<Option<Arc<dyn EventListener>>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EventListener>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the hook that runs before every listener. Replaces any previous hook.
    pub fn set_cache_hook(&self, hook: impl EventListener + 'static) {
        *self
            .inner
            .hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    pub fn subscribe(&self, listener: impl EventListener + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::AcqRel));
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        debug!(%id, "listener subscribed");
        id
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to the hook, then to each listener once. Returns the
    /// number of listeners that accepted it.
    pub fn publish(&self, event: &Event) -> usize {
        if self.is_closed() {
            debug!(event_id = %event.id, kind = ?event.kind, "event bus closed; dropping event");
            return 0;
        }

        let hook = self
            .inner
            .hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let listeners = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(hook) = hook {
            deliver("cache_hook", hook.as_ref(), event);
        }
        listeners
            .iter()
            .filter(|(id, listener)| deliver(&id.to_string(), listener.as_ref(), event))
            .count()
    }

    /// Drop every later event.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn deliver(name: &str, listener: &dyn EventListener, event: &Event) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(listener = name, event_id = %event.id, kind = ?event.kind, error = %e, "listener failed");
            false
        }
        Err(_) => {
            warn!(listener = name, event_id = %event.id, kind = ?event.kind, "listener panicked");
            false
        }
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
