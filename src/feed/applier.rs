//! Change Applier
//!
//! Folds one change event at a time into the snapshot. Holds no state
//! of its own beyond the index field name.

use crate::row::RowKey;
use crate::snapshot::Snapshot;

use super::ChangeEvent;

/// Outcome of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Row inserted or replaced
    Upserted(RowKey),
    /// Row removed (or already absent)
    Removed(RowKey),
    /// Event carried no usable key and was dropped
    Malformed,
}

/// Stateless dispatcher from change events to snapshot mutations
#[derive(Debug, Clone)]
pub struct ChangeApplier {
    index_name: String,
}

impl ChangeApplier {
    /// Create an applier for rows keyed by `index_name`
    pub fn new(index_name: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
        }
    }

    /// Apply a single event
    pub fn apply(&self, snapshot: &mut Snapshot, event: ChangeEvent) -> Applied {
        let Some(key) = event.key(&self.index_name) else {
            tracing::warn!(
                "Dropping malformed {} event: no '{}' on either side",
                event.kind(),
                self.index_name
            );
            return Applied::Malformed;
        };

        match event {
            ChangeEvent::Insert { new } => {
                tracing::debug!("Feed INSERT {}", key);
                snapshot.upsert(new);
                Applied::Upserted(key)
            }
            ChangeEvent::Update { new, .. } => {
                tracing::debug!("Feed UPDATE {}", key);
                // Missed inserts heal here: upsert appends unknown keys
                let mut row = new;
                if row.key(&self.index_name).is_none() {
                    row.set(self.index_name.clone(), key.as_str());
                }
                snapshot.upsert(row);
                Applied::Upserted(key)
            }
            ChangeEvent::Delete { .. } => {
                tracing::debug!("Feed DELETE {}", key);
                snapshot.remove_by_key(&key);
                Applied::Removed(key)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;
    use std::collections::HashMap;

    fn row(id: i64, text: &str) -> Row {
        Row::new().with("id", id).with("text", text)
    }

    fn insert(id: i64, text: &str) -> ChangeEvent {
        ChangeEvent::Insert { new: row(id, text) }
    }

    fn update(id: i64, text: &str) -> ChangeEvent {
        ChangeEvent::Update {
            old: Row::new().with("id", id),
            new: row(id, text),
        }
    }

    fn delete(id: i64) -> ChangeEvent {
        ChangeEvent::Delete {
            old: Row::new().with("id", id),
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let applier = ChangeApplier::new("id");
        let mut once = Snapshot::new("id");
        let mut twice = Snapshot::new("id");

        applier.apply(&mut once, insert(1, "a"));
        applier.apply(&mut twice, insert(1, "a"));
        applier.apply(&mut twice, insert(1, "a"));

        assert_eq!(once.rows(), twice.rows());
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn test_update_heals_missed_insert() {
        let applier = ChangeApplier::new("id");
        let mut snapshot = Snapshot::new("id");

        let applied = applier.apply(&mut snapshot, update(4, "late"));
        assert_eq!(applied, Applied::Upserted(RowKey::from(4)));
        assert_eq!(snapshot.rows(), &[row(4, "late")]);
    }

    #[test]
    fn test_delete_removes_row() {
        let applier = ChangeApplier::new("id");
        let mut snapshot = Snapshot::new("id");

        applier.apply(&mut snapshot, insert(1, "a"));
        applier.apply(&mut snapshot, insert(2, "b"));
        applier.apply(&mut snapshot, delete(1));
        applier.apply(&mut snapshot, delete(1));

        assert_eq!(snapshot.rows(), &[row(2, "b")]);
    }

    #[test]
    fn test_malformed_event_leaves_snapshot() {
        let applier = ChangeApplier::new("id");
        let mut snapshot = Snapshot::new("id");
        applier.apply(&mut snapshot, insert(1, "a"));

        let applied = applier.apply(
            &mut snapshot,
            ChangeEvent::Update {
                old: Row::new(),
                new: Row::new().with("text", "who"),
            },
        );
        assert_eq!(applied, Applied::Malformed);
        assert_eq!(
            applier.apply(&mut snapshot, ChangeEvent::Delete { old: Row::new() }),
            Applied::Malformed
        );
        assert_eq!(snapshot.rows(), &[row(1, "a")]);
    }

    #[test]
    fn test_replay_converges() {
        let applier = ChangeApplier::new("id");
        let events = vec![
            insert(1, "a"),
            insert(2, "b"),
            update(1, "a2"),
            insert(3, "c"),
            delete(2),
            update(3, "c2"),
            insert(2, "b2"),
            delete(3),
            update(5, "e"),
        ];

        // Expected: last non-delete per key, unless a delete follows it
        let mut expected: HashMap<String, Option<Row>> = HashMap::new();
        for event in &events {
            let key = event.key("id").unwrap().to_string();
            let value = match event {
                ChangeEvent::Insert { new } | ChangeEvent::Update { new, .. } => Some(new.clone()),
                ChangeEvent::Delete { .. } => None,
            };
            expected.insert(key, value);
        }

        // Deliver everything, then redeliver a duplicated tail
        let mut snapshot = Snapshot::new("id");
        for event in events.iter().chain(events[4..].iter()) {
            applier.apply(&mut snapshot, event.clone());
        }

        let live: Vec<_> = expected.values().flatten().collect();
        assert_eq!(snapshot.len(), live.len());
        for row in live {
            let key = row.key("id").unwrap();
            assert_eq!(snapshot.find(&key), Some(row));
        }
    }
}
