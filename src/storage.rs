//! Persisted property store abstraction.
//!
//! A small key-value seam used to persist the queue and a few flags across
//! host reloads. Concrete backends are selected by the host environment; the
//! SDK ships an in-memory map and a no-op store.

use std::collections::HashMap;
use std::sync::Mutex;

/// Named slots in the property store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistedProperty {
    Props,
    Queue,
    OptedOut,
}

impl PersistedProperty {
    pub fn key(self) -> &'static str {
        match self {
            PersistedProperty::Props => "traceline_props",
            PersistedProperty::Queue => "traceline_queue",
            PersistedProperty::OptedOut => "traceline_opted_out",
        }
    }
}

/// Key-value storage backend.
///
/// Implementations must be cheap and non-blocking; they are called from the
/// enqueue path on every queue mutation.
pub trait PropertyStore: Send + Sync {
    fn get_item(&self, property: PersistedProperty) -> Option<String>;
    fn set_item(&self, property: PersistedProperty, value: String);

    /// Whether this store actually retains data. The queue skips
    /// serialization work for stores that do not.
    fn is_durable(&self) -> bool {
        true
    }
}

/// In-memory store. Survives for the process lifetime only.
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<PersistedProperty, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PropertyStore for MemoryStore {
    fn get_item(&self, property: PersistedProperty) -> Option<String> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&property)
            .cloned()
    }

    fn set_item(&self, property: PersistedProperty, value: String) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(property, value);
    }
}

/// Store that retains nothing. The default backend.
#[derive(Default)]
pub struct NoopStore;

impl NoopStore {
    pub fn new() -> Self {
        Self
    }
}

impl PropertyStore for NoopStore {
    fn get_item(&self, _property: PersistedProperty) -> Option<String> {
        None
    }

    fn set_item(&self, _property: PersistedProperty, _value: String) {}

    fn is_durable(&self) -> bool {
        false
    }
}
