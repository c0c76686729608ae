//! # Typed Event Observers
//!
//! A small observer registry used by the sessions instead of a stringly-typed
//! event bus: each session event owns one `Listeners<T>` with the payload
//! type fixed at compile time. Listeners run synchronously in registration
//! order; `once` listeners remove themselves after the first invocation.

/// Identifier handed out by `on`/`once`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry<T> {
    id: ListenerId,
    callback: Box<dyn FnMut(&T) + Send>,
    once: bool,
}

/// Ordered list of subscribers for one event.
pub struct Listeners<T> {
    entries: Vec<ListenerEntry<T>>,
    next_id: u64,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, callback: impl FnMut(&T) + Send + 'static) -> ListenerId {
        self.subscribe(Box::new(callback), false)
    }

    pub fn once(&mut self, callback: impl FnMut(&T) + Send + 'static) -> ListenerId {
        self.subscribe(Box::new(callback), true)
    }

    fn subscribe(&mut self, callback: Box<dyn FnMut(&T) + Send>, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push(ListenerEntry { id, callback, once });
        id
    }

    /// Remove a subscription. Returns false if the id is unknown (already
    /// removed or consumed by `once`).
    pub fn off(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Invoke all listeners in registration order. Returns true if at least
    /// one listener ran.
    pub fn emit(&mut self, payload: &T) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        for entry in &mut self.entries {
            (entry.callback)(payload);
        }
        self.entries.retain(|e| !e.once);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
