//! Row Types
//!
//! Schema-less rows as delivered by the remote table, plus the
//! canonical key used to address them.

use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::error::{Error, Result};

pub use serde_json::Value;

/// Canonical form of an index value.
///
/// Numbers and strings that print the same address the same row,
/// so `1` and `"1"` are one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    /// Build a key from a raw index value
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Ok(Self(s.clone())),
            Value::String(_) => Err(Error::InvalidKey("key is empty".into())),
            Value::Number(n) => Ok(Self(n.to_string())),
            Value::Null => Err(Error::InvalidKey("key is null".into())),
            other => Err(Error::InvalidKey(format!("unsupported key value {}", other))),
        }
    }

    /// Key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for RowKey {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_value(&Value::String(value.to_string()))
    }
}

impl From<i64> for RowKey {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

/// A row: an open-ended mapping from column name to value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Create an empty row
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style field setter
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Set a field, returning the previous value
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(column.into(), value.into())
    }

    /// Get a field
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Resolve the row's key from its index field
    pub fn key(&self, index_name: &str) -> Option<RowKey> {
        self.0
            .get(index_name)
            .and_then(|v| RowKey::from_value(v).ok())
    }

    /// Overlay every field of `partial` onto this row
    pub fn merge(&mut self, partial: &Row) {
        for (column, value) in &partial.0 {
            self.0.insert(column.clone(), value.clone());
        }
    }

    /// Copy of this row without `column`
    pub fn without(&self, column: &str) -> Row {
        let mut copy = self.clone();
        copy.0.remove(column);
        copy
    }

    /// Iterate over fields
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the row has no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Value> for Row {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidRow(format!("expected an object, got {}", other))),
        }
    }
}

impl From<Row> for Value {
    fn from(row: Row) -> Self {
        Value::Object(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_normalization() {
        let numeric = Row::new().with("id", 1);
        let textual = Row::new().with("id", "1");
        assert_eq!(numeric.key("id"), textual.key("id"));
        assert_eq!(numeric.key("id").unwrap().as_str(), "1");
    }

    #[test]
    fn test_invalid_keys() {
        assert!(RowKey::from_value(&Value::Null).is_err());
        assert!(RowKey::from_value(&json!("")).is_err());
        assert!(RowKey::from_value(&json!(true)).is_err());
        assert!(RowKey::from_value(&json!({"a": 1})).is_err());
        assert!(Row::new().with("name", "x").key("id").is_none());
    }

    #[test]
    fn test_merge_and_strip() {
        let mut row = Row::try_from(json!({"id": 7, "text": "a", "done": false})).unwrap();
        row.merge(&Row::new().with("text", "b"));

        assert_eq!(row.get("text"), Some(&json!("b")));
        assert_eq!(row.get("done"), Some(&json!(false)));

        let payload = row.without("id");
        assert!(payload.get("id").is_none());
        assert_eq!(payload.len(), 2);
    }

    #[test]
    fn test_row_from_non_object() {
        assert!(Row::try_from(json!([1, 2])).is_err());
    }
}
