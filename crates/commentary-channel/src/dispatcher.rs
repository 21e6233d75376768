//! Event name to handler routing for one session.
//!
//! Each event has at most one handler. Binding an event that already has one
//! replaces it (the last registration wins) and returns a fresh
//! [`BindingRef`]. Unbinding with a stale ref is a no-op, so code holding an
//! old ref cannot remove its replacement.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

/// Handler invoked with a live event payload.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle to one registration, used to remove it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BindingRef {
    event: String,
    id: u64,
}

impl BindingRef {
    /// Event name this binding is registered for.
    pub fn event(&self) -> &str {
        &self.event
    }
}

struct Binding {
    id: u64,
    handler: EventHandler,
}

/// Handlers for one session, keyed by event name.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    bindings: HashMap<String, Binding>,
    next_id: u64,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`, replacing any previous handler.
    pub(crate) fn bind(&mut self, event: &str, handler: EventHandler) -> BindingRef {
        self.next_id += 1;
        let id = self.next_id;
        if let Some(previous) = self
            .bindings
            .insert(event.to_owned(), Binding { id, handler })
        {
            debug!(event, replaced = previous.id, "replaced event handler");
        }
        BindingRef {
            event: event.to_owned(),
            id,
        }
    }

    /// Remove the binding if it is still the current one for its event.
    pub(crate) fn unbind(&mut self, binding: &BindingRef) -> bool {
        match self.bindings.get(&binding.event) {
            Some(current) if current.id == binding.id => {
                let _ = self.bindings.remove(&binding.event);
                true
            }
            _ => false,
        }
    }

    /// Handler to invoke for `event`, cloned out so the caller can release
    /// any lock before running it.
    pub(crate) fn handler_for(&self, event: &str) -> Option<EventHandler> {
        self.bindings.get(event).map(|b| Arc::clone(&b.handler))
    }

    #[cfg(test)]
    pub(crate) fn is_bound(&self, event: &str) -> bool {
        self.bindings.contains_key(event)
    }

    pub(crate) fn len(&self) -> usize {
        self.bindings.len()
    }
}
