use crate::namespace::Namespace;
use crate::snapshot::Snapshot;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub namespace: Namespace,
    pub changes: Vec<PropertyChange>,
}

impl ChangeEvent {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn change_for(&self, key: &str) -> Option<&PropertyChange> {
        self.changes.iter().find(|c| c.key == key)
    }
}

/// Diffs two configuration maps and builds the `{key, oldValue, newValue,
/// changeType}` tuples the change dispatcher delivers to listeners.
///
/// `previous` is `None` for a namespace's first-ever snapshot, in which case
/// no event is produced at all (cold start fires no change event, per the
/// fetch/notify design).
pub fn diff_snapshots(previous: Option<&Snapshot>, current: &Snapshot) -> Option<ChangeEvent> {
    let previous = previous?;

    let mut changes = Vec::new();

    for (key, new_value) in &current.configurations {
        match previous.configurations.get(key) {
            None => changes.push(PropertyChange {
                key: key.clone(),
                old_value: None,
                new_value: Some(new_value.clone()),
                change_type: ChangeType::Added,
            }),
            Some(old_value) if old_value != new_value => changes.push(PropertyChange {
                key: key.clone(),
                old_value: Some(old_value.clone()),
                new_value: Some(new_value.clone()),
                change_type: ChangeType::Modified,
            }),
            Some(_) => {}
        }
    }

    for (key, old_value) in &previous.configurations {
        if !current.configurations.contains_key(key) {
            changes.push(PropertyChange {
                key: key.clone(),
                old_value: Some(old_value.clone()),
                new_value: None,
                change_type: ChangeType::Deleted,
            });
        }
    }

    if changes.is_empty() {
        return None;
    }

    Some(ChangeEvent {
        namespace: current.namespace.clone(),
        changes,
    })
}

/// Applies a set of property changes onto a plain map, used by the facade
/// when it needs to reconstruct "what changed after priority filtering".
pub fn apply_changes(base: &mut HashMap<String, String>, event: &ChangeEvent) {
    for change in &event.changes {
        match change.change_type {
            ChangeType::Added | ChangeType::Modified => {
                if let Some(v) = &change.new_value {
                    base.insert(change.key.clone(), v.clone());
                }
            }
            ChangeType::Deleted => {
                base.remove(&change.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ReleaseKey;

    fn snap(kvs: &[(&str, &str)]) -> Snapshot {
        let mut configurations = HashMap::new();
        for (k, v) in kvs {
            configurations.insert(k.to_string(), v.to_string());
        }
        Snapshot::new(
            Namespace::new("app", "default", "application"),
            ReleaseKey("r".into()),
            configurations,
        )
    }

    #[test]
    fn cold_start_fires_no_event() {
        let current = snap(&[("k", "v1")]);
        assert!(diff_snapshots(None, &current).is_none());
    }

    #[test]
    fn detects_added_modified_deleted() {
        let previous = snap(&[("k", "v1"), ("gone", "bye")]);
        let current = snap(&[("k", "v2"), ("new", "n1")]);

        let event = diff_snapshots(Some(&previous), &current).unwrap();
        assert_eq!(event.changes.len(), 3);

        let modified = event.change_for("k").unwrap();
        assert_eq!(modified.change_type, ChangeType::Modified);
        assert_eq!(modified.old_value.as_deref(), Some("v1"));
        assert_eq!(modified.new_value.as_deref(), Some("v2"));

        let added = event.change_for("new").unwrap();
        assert_eq!(added.change_type, ChangeType::Added);
        assert_eq!(added.old_value, None);

        let deleted = event.change_for("gone").unwrap();
        assert_eq!(deleted.change_type, ChangeType::Deleted);
        assert_eq!(deleted.new_value, None);
    }

    #[test]
    fn identical_configs_produce_no_event() {
        let previous = snap(&[("k", "v1")]);
        let current = snap(&[("k", "v1")]);
        assert!(diff_snapshots(Some(&previous), &current).is_none());
    }
}
