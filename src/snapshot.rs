use crate::namespace::Namespace;
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque, server-assigned version identifier. Equality of two release keys
/// implies byte-equal `configurations` contents; the reverse need not hold
/// in principle, but in practice a release key change always accompanies at
/// least one differing entry (see [`Snapshot`] invariants).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReleaseKey(pub String);

impl std::fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable snapshot of one namespace's remote configuration.
///
/// Snapshots are never mutated after construction; a [`crate::repository::RemoteRepository`]
/// publishes a new `Arc<Snapshot>` via an atomic swap rather than mutating
/// the one readers may be holding. Two snapshots are considered equal iff
/// their `release_key`s are equal.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub namespace: Namespace,
    pub release_key: ReleaseKey,
    pub configurations: HashMap<String, String>,
    pub notification_messages: Option<HashMap<String, i64>>,
}

impl Snapshot {
    pub fn new(
        namespace: Namespace,
        release_key: ReleaseKey,
        configurations: HashMap<String, String>,
    ) -> Self {
        Self {
            namespace,
            release_key,
            configurations,
            notification_messages: None,
        }
    }

    pub fn with_notification_messages(
        mut self,
        messages: impl Into<Option<HashMap<String, i64>>>,
    ) -> Self {
        self.notification_messages = messages.into();
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.configurations.get(key).map(String::as_str)
    }
}

/// Equality is defined purely in terms of the release key, matching the
/// data-model invariant in the fetch/notify design: two snapshots are
/// "the same" iff the server considers them the same published version.
impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.release_key == other.release_key
    }
}
impl Eq for Snapshot {}

/// Returns whether `new` represents a release distinct from `old`, per the
/// `sync()` algorithm: `N != P` by release key, or `P` was absent.
pub fn is_new_release(old: Option<&Arc<Snapshot>>, new: &Snapshot) -> bool {
    match old {
        None => true,
        Some(old) => old.release_key != new.release_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(key: &str) -> Snapshot {
        Snapshot::new(
            Namespace::new("app", "default", "application"),
            ReleaseKey(key.to_string()),
            HashMap::new(),
        )
    }

    #[test]
    fn equality_is_release_key_only() {
        let mut a = snap("r1");
        a.configurations.insert("k".into(), "v1".into());
        let mut b = snap("r1");
        b.configurations.insert("k".into(), "v2".into());
        // Same release key, differing configurations: still "equal" per the
        // data-model's definition. A real server would never actually do
        // this, but the type itself only promises release-key equality.
        assert_eq!(a, b);
    }

    #[test]
    fn differing_release_keys_are_not_equal() {
        assert_ne!(snap("r1"), snap("r2"));
    }

    #[test]
    fn absent_old_snapshot_is_always_new() {
        let new = snap("r1");
        assert!(is_new_release(None, &new));
    }

    #[test]
    fn same_release_key_is_not_new() {
        let old = Arc::new(snap("r1"));
        let new = snap("r1");
        assert!(!is_new_release(Some(&old), &new));
    }
}
