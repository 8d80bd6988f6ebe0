//! Immutable row snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::value::Value;

/// Separator between a joint-prefetch namespace and a column name.
pub const NAMESPACE_SEPARATOR: char = '.';

/// Column values of one row at a point in time.
///
/// Snapshots are immutable and cheap to clone. "Updating" a snapshot means
/// building a new one (see [`RowSnapshot::with`]) and replacing the cached
/// entry. The `version` is stamped by the snapshot store and does not take
/// part in equality.
#[derive(Debug, Clone, Default)]
pub struct RowSnapshot {
    values: Arc<BTreeMap<String, Value>>,
    version: u64,
}

impl RowSnapshot {
    /// Build a snapshot from column/value pairs.
    pub fn new<I, C>(values: I) -> Self
    where
        I: IntoIterator<Item = (C, Value)>,
        C: Into<String>,
    {
        Self {
            values: Arc::new(values.into_iter().map(|(c, v)| (c.into(), v)).collect()),
            version: 0,
        }
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Get a column value, treating a missing column as NULL.
    pub fn get_or_null(&self, column: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(column).unwrap_or(&NULL)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Copy of this snapshot carrying a new version stamp.
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            values: Arc::clone(&self.values),
            version,
        }
    }

    /// New snapshot with one column replaced or added.
    pub fn with(&self, column: impl Into<String>, value: Value) -> Self {
        let mut values = (*self.values).clone();
        values.insert(column.into(), value);
        Self {
            values: Arc::new(values),
            version: 0,
        }
    }

    /// New snapshot with `other`'s columns laid over this one.
    pub fn merged(&self, other: &RowSnapshot) -> Self {
        let mut values = (*self.values).clone();
        for (column, value) in other.values.iter() {
            values.insert(column.clone(), value.clone());
        }
        Self {
            values: Arc::new(values),
            version: 0,
        }
    }

    /// Columns whose values differ between the two snapshots.
    ///
    /// A column present on only one side counts as changed.
    pub fn changed_columns(&self, other: &RowSnapshot) -> Vec<String> {
        let mut changed: Vec<String> = self
            .values
            .iter()
            .filter(|(c, v)| other.values.get(*c) != Some(*v))
            .map(|(c, _)| c.clone())
            .collect();
        for column in other.values.keys() {
            if !self.values.contains_key(column) {
                changed.push(column.clone());
            }
        }
        changed
    }

    /// Values of the given columns in order, or `None` if any is missing.
    pub fn tuple(&self, columns: &[&str]) -> Option<Vec<Value>> {
        columns.iter().map(|c| self.values.get(*c).cloned()).collect()
    }

    /// Unprefixed columns of a joint (wide) row.
    pub fn root_columns(&self) -> Self {
        Self::new(
            self.values
                .iter()
                .filter(|(c, _)| !c.contains(NAMESPACE_SEPARATOR))
                .map(|(c, v)| (c.clone(), v.clone())),
        )
    }

    /// Columns under `prefix.` with the prefix stripped.
    ///
    /// Nested namespaces survive one level down: `a.b.id` under prefix `a`
    /// becomes `b.id`.
    pub fn namespace(&self, prefix: &str) -> Self {
        let mut wanted = String::with_capacity(prefix.len() + 1);
        wanted.push_str(prefix);
        wanted.push(NAMESPACE_SEPARATOR);
        Self::new(
            self.values
                .iter()
                .filter_map(|(c, v)| c.strip_prefix(&wanted).map(|rest| (rest.to_string(), v.clone()))),
        )
    }

    /// Prefix every column with `prefix.`.
    pub fn prefixed(&self, prefix: &str) -> Self {
        Self::new(
            self.values
                .iter()
                .map(|(c, v)| (format!("{prefix}{NAMESPACE_SEPARATOR}{c}"), v.clone())),
        )
    }
}

impl PartialEq for RowSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for RowSnapshot {}

impl<C: Into<String>> FromIterator<(C, Value)> for RowSnapshot {
    fn from_iter<T: IntoIterator<Item = (C, Value)>>(iter: T) -> Self {
        Self::new(iter)
    }
}
