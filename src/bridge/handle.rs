// ABOUTME: Opaque handles and the process-wide registry of live bridge objects
// ABOUTME: Foreign callbacks carry a handle string which is resolved back to a Connection, Operation or Stream

use crate::bridge::connection::ConnectionInner;
use crate::bridge::operation::OperationInner;
use crate::stream::StreamInner;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Opaque token identifying one live bridge object across the callback boundary
///
/// Handles are random v4 UUIDs, so a released handle value is never handed out
/// again while foreign callbacks may still reference it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(String);

impl Handle {
    /// Create a fresh, globally unique handle
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the handle as the string passed to the foreign side
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Thread-safe table of live objects keyed by handle
///
/// None of the operations block beyond the short internal read/write lock, and
/// the table is independent of any connection's event-loop lock.
#[derive(Debug)]
pub struct Registry<T> {
    objects: RwLock<HashMap<String, T>>,
}

impl<T: Clone> Registry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Associate `object` with `handle`, replacing any previous association
    ///
    /// Returns true if an older entry was replaced.
    pub fn register(&self, handle: &str, object: T) -> bool {
        self.objects
            .write()
            .insert(handle.to_string(), object)
            .is_some()
    }

    /// Look up a handle without removing it
    pub fn get(&self, handle: &str) -> Option<T> {
        self.objects.read().get(handle).cloned()
    }

    /// Remove a handle unconditionally, returning the entry if it was present
    pub fn unregister(&self, handle: &str) -> Option<T> {
        self.objects.write().remove(handle)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the registry holds no entries
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Every kind of object the foreign side may call back into
#[derive(Clone)]
pub(crate) enum Registered {
    Connection(Arc<ConnectionInner>),
    Operation(Arc<OperationInner>),
    Stream(Arc<StreamInner>),
}

impl Registered {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Registered::Connection(_) => "connection",
            Registered::Operation(_) => "operation",
            Registered::Stream(_) => "stream",
        }
    }
}

static OBJECTS: LazyLock<Registry<Registered>> = LazyLock::new(Registry::new);

pub(crate) fn register(handle: &Handle, object: Registered) {
    let kind = object.kind();
    if OBJECTS.register(handle.as_str(), object) {
        log::warn!("Handle {} re-registered as {}, previous entry replaced", handle, kind);
    } else {
        log::trace!("Registered {} {}", kind, handle);
    }
}

pub(crate) fn get(handle: &str) -> Option<Registered> {
    OBJECTS.get(handle)
}

pub(crate) fn unregister(handle: &Handle) {
    if let Some(object) = OBJECTS.unregister(handle.as_str()) {
        log::trace!("Unregistered {} {}", object.kind(), handle);
    }
}

/// Number of connections, operations and streams currently reachable by handle
pub fn live_handles() -> usize {
    OBJECTS.len()
}
