use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::dto::events::{DuelEvent, EventKind};

/// Handle returned by [`ListenerRegistry::on`], used to unregister a single handler.
pub type ListenerId = Uuid;

/// Callback invoked for every matching event.
pub type Listener = Arc<dyn Fn(&DuelEvent) + Send + Sync>;

/// Event listeners keyed by event kind. Lives outside the transport so registrations
/// carry over to the next link after a reconnect.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<EventKind, Vec<(ListenerId, Listener)>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `kind`.
    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = Uuid::new_v4();
        self.listeners.entry(kind).or_default().push((id, listener));
        id
    }

    /// Remove one listener, or every listener of `kind` when `id` is `None`.
    pub fn off(&self, kind: EventKind, id: Option<ListenerId>) {
        match id {
            Some(id) => {
                if let Some(mut entry) = self.listeners.get_mut(&kind) {
                    entry.retain(|(existing, _)| *existing != id);
                }
                self.listeners.remove_if(&kind, |_, entries| entries.is_empty());
            }
            None => {
                self.listeners.remove(&kind);
            }
        }
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.listeners.clear();
    }

    /// Number of listeners registered for `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, |entry| entry.len())
    }

    /// Invoke every listener of the event's kind.
    pub fn dispatch(&self, event: &DuelEvent) {
        // Clone out of the map so handlers may register or unregister without
        // deadlocking on the shard lock.
        let listeners: Vec<Listener> = match self.listeners.get(&event.kind()) {
            Some(entry) => entry.iter().map(|(_, listener)| Arc::clone(listener)).collect(),
            None => return,
        };
        for listener in listeners {
            listener(event);
        }
    }
}
