//! Snapshot
//!
//! Ordered local mirror of the remote table: last known remote state
//! plus locally buffered edits that are not yet confirmed. Every
//! mutating call notifies observers exactly once with the full row
//! sequence.

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::row::{Row, RowKey, Value};

/// Snapshot shared between the store, the dispatch loop and the drain
pub type SharedSnapshot = Arc<RwLock<Snapshot>>;

/// Observer callback, invoked with the full current row sequence
pub type Observer = Arc<dyn Fn(&[Row]) + Send + Sync>;

/// Handle returned by [`Snapshot::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Ordered row mirror
pub struct Snapshot {
    /// Field that identifies a row
    index_name: String,
    /// Rows in sequence order
    rows: Vec<Row>,
    /// Registered observers
    observers: Vec<(ObserverId, Observer)>,
    /// Next observer id
    next_observer: u64,
}

impl Snapshot {
    /// Create an empty snapshot keyed by `index_name`
    pub fn new(index_name: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            rows: Vec::new(),
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Wrap in the shared handle
    pub fn shared(self) -> SharedSnapshot {
        Arc::new(RwLock::new(self))
    }

    /// The index field name
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Replace the whole sequence (initial fetch)
    pub fn replace_all(&mut self, rows: Vec<Row>) {
        let total = rows.len();
        let mut kept: Vec<Row> = Vec::with_capacity(total);

        for row in rows {
            let Some(key) = row.key(&self.index_name) else {
                tracing::warn!("Dropping fetched row without a valid '{}'", self.index_name);
                continue;
            };

            // Later duplicates win, in place
            match kept.iter().position(|r| r.key(&self.index_name).as_ref() == Some(&key)) {
                Some(pos) => kept[pos] = row,
                None => kept.push(row),
            }
        }

        tracing::debug!("Snapshot replaced: {} of {} rows kept", kept.len(), total);
        self.rows = kept;
        self.notify();
    }

    /// Replace the row with the same key in place, or append
    pub fn upsert(&mut self, row: Row) {
        let Some(key) = row.key(&self.index_name) else {
            tracing::warn!("Ignoring upsert of row without a valid '{}'", self.index_name);
            return;
        };

        match self.position(&key) {
            Some(pos) => self.rows[pos] = row,
            None => self.rows.push(row),
        }
        self.notify();
    }

    /// Overlay `fields` onto the row with `key`, or append a new row
    /// made of `fields` and the key. The stored index value is never
    /// overwritten; an appended row takes the index value from `fields`
    /// when it matches `key`.
    pub fn merge(&mut self, key: &RowKey, fields: &Row) {
        let index_value = fields
            .get(&self.index_name)
            .filter(|value| RowKey::from_value(value).ok().as_ref() == Some(key))
            .cloned()
            .unwrap_or_else(|| Value::from(key.as_str()));
        let fields = fields.without(&self.index_name);

        match self.position(key) {
            Some(pos) => self.rows[pos].merge(&fields),
            None => {
                let mut row = fields;
                row.set(self.index_name.clone(), index_value);
                self.rows.push(row);
            }
        }
        self.notify();
    }

    /// Put back the row `key` had before a local edit, removing it if
    /// there was none
    pub fn restore(&mut self, key: &RowKey, previous: Option<Row>) {
        match previous {
            Some(row) => match self.position(key) {
                Some(pos) => self.rows[pos] = row,
                None => self.rows.push(row),
            },
            None => {
                if let Some(pos) = self.position(key) {
                    self.rows.remove(pos);
                }
            }
        }
        self.notify();
    }

    /// Remove the row with `key`; absent keys are a no-op
    pub fn remove_by_key(&mut self, key: &RowKey) {
        if let Some(pos) = self.position(key) {
            self.rows.remove(pos);
        }
        self.notify();
    }

    /// Current rows
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Look up a row by key
    pub fn find(&self, key: &RowKey) -> Option<&Row> {
        self.position(key).map(|pos| &self.rows[pos])
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the snapshot holds no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Register an observer
    pub fn subscribe(&mut self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, observer));
        id
    }

    /// Remove an observer, returning whether it was registered
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn position(&self, key: &RowKey) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.key(&self.index_name).as_ref() == Some(key))
    }

    fn notify(&self) {
        for (_, observer) in &self.observers {
            observer(&self.rows);
        }
    }
}
