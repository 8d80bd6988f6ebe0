//! Object identities.
//!
//! An [`ObjectIdentity`] names one persisted row (permanent identity) or one
//! not-yet-persisted object (temporary identity). Identities are cheap to
//! clone: the entity tag and key are shared behind `Arc`s.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::Value;

static NEXT_TEMPORARY: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, PartialEq, Eq, Hash)]
enum IdentityKey {
    /// Primary key columns, sorted by column name.
    Permanent(Arc<[(String, Value)]>),
    /// Process-unique surrogate token.
    Temporary(u64),
}

/// Stable identity of a domain object.
///
/// Two identities are equal iff they carry the same entity tag and the same
/// key. A temporary identity never equals a permanent one, even after the
/// object it named has been assigned a permanent key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    entity: Arc<str>,
    key: IdentityKey,
}

impl ObjectIdentity {
    /// Create a permanent identity from primary key columns.
    ///
    /// Column order does not matter; components are kept sorted by name.
    pub fn permanent<I, C>(entity: &str, key: I) -> Self
    where
        I: IntoIterator<Item = (C, Value)>,
        C: Into<String>,
    {
        let mut pairs: Vec<(String, Value)> = key.into_iter().map(|(c, v)| (c.into(), v)).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            entity: Arc::from(entity),
            key: IdentityKey::Permanent(pairs.into()),
        }
    }

    /// Create a permanent identity for a single-column key.
    pub fn single(entity: &str, column: &str, value: impl Into<Value>) -> Self {
        Self::permanent(entity, [(column, value.into())])
    }

    /// Create a fresh temporary identity, unique within the process.
    pub fn temporary(entity: &str) -> Self {
        Self {
            entity: Arc::from(entity),
            key: IdentityKey::Temporary(NEXT_TEMPORARY.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Entity tag (the root entity of an inheritance hierarchy).
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdentityKey::Temporary(_))
    }

    /// Key columns of a permanent identity, sorted by column name.
    pub fn key(&self) -> Option<&[(String, Value)]> {
        match &self.key {
            IdentityKey::Permanent(pairs) => Some(pairs),
            IdentityKey::Temporary(_) => None,
        }
    }

    /// Value of one key column, if this identity is permanent.
    pub fn key_value(&self, column: &str) -> Option<&Value> {
        self.key()?
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Key values in the given column order.
    ///
    /// Returns `None` for temporary identities or when a column is missing.
    pub fn key_tuple(&self, columns: &[&str]) -> Option<Vec<Value>> {
        columns
            .iter()
            .map(|c| self.key_value(c).cloned())
            .collect()
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdentityKey::Permanent(pairs) => {
                write!(f, "{}{{", self.entity)?;
                for (i, (column, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{column}={value}")?;
                }
                f.write_str("}")
            }
            IdentityKey::Temporary(token) => write!(f, "{}<temp:{token}>", self.entity),
        }
    }
}

impl fmt::Debug for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
