use crate::change::ChangeEvent;
use crate::error::Error;
use crate::namespace::Namespace;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A subscriber to configuration changes for one or more namespaces.
///
/// Implementations should return quickly; the change dispatcher isolates
/// each listener invocation but does not itself impose a timeout, so a
/// listener that blocks indefinitely will delay delivery to listeners
/// registered after it.
pub trait Listener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);

    /// Called when a `sync()` attempt exhausts its retry budget without
    /// producing a fresh snapshot. The prior snapshot, if any, remains in
    /// effect; this is advisory only and most listeners can ignore it.
    fn on_error(&self, _namespace: &Namespace, _error: &Error) {}
}

impl<F> Listener for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) {
        (self)(event)
    }
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle returned by registration, used only to remove a listener
/// later. Carries no ordering or equality semantics beyond identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}
