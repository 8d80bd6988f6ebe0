//! Contract between the object-graph engine and a storage backend.
//!
//! The engine never builds SQL. Reads are described by a [`QueryDescriptor`]
//! and writes by an [`OrderedDiff`]; a [`StorageExecutor`] turns them into
//! whatever its backing store understands.
//!
//! # Joint rows
//!
//! When a query carries [`JointPath`]s the executor returns one wide row per
//! root/satellite combination. Root columns are unprefixed; satellite columns
//! are prefixed with the path namespace (`paintings.title`). A root without
//! satellites still yields one row whose satellite columns are NULL.

use std::collections::HashMap;

use crate::error::StorageError;
use crate::identity::ObjectIdentity;
use crate::snapshot::RowSnapshot;
use crate::value::Value;

// ============================================================================
// Reads
// ============================================================================

/// Row filter understood by every executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Qualifier {
    All,
    /// `column = value`
    Eq(String, Value),
    /// `column IN (values)`
    In(String, Vec<Value>),
    /// `(c1, c2, ...) IN ((v1, v2, ...), ...)`: batched key lookup.
    KeysIn {
        columns: Vec<String>,
        tuples: Vec<Vec<Value>>,
    },
    And(Vec<Qualifier>),
}

impl Qualifier {
    /// Evaluate against a row. Missing columns read as NULL, and NULL never
    /// matches anything, NULL included.
    pub fn matches(&self, row: &RowSnapshot) -> bool {
        match self {
            Qualifier::All => true,
            Qualifier::Eq(column, value) => {
                let actual = row.get_or_null(column);
                !actual.is_null() && actual == value
            }
            Qualifier::In(column, values) => {
                let actual = row.get_or_null(column);
                !actual.is_null() && values.contains(actual)
            }
            Qualifier::KeysIn { columns, tuples } => {
                let actual: Vec<&Value> = columns.iter().map(|c| row.get_or_null(c)).collect();
                if actual.iter().any(|v| v.is_null()) {
                    return false;
                }
                tuples
                    .iter()
                    .any(|t| t.len() == actual.len() && t.iter().zip(&actual).all(|(a, b)| a == *b))
            }
            Qualifier::And(parts) => parts.iter().all(|q| q.matches(row)),
        }
    }

    /// Combine with another qualifier, flattening trivial cases.
    pub fn and(self, other: Qualifier) -> Qualifier {
        match (self, other) {
            (Qualifier::All, q) | (q, Qualifier::All) => q,
            (Qualifier::And(mut parts), Qualifier::And(more)) => {
                parts.extend(more);
                Qualifier::And(parts)
            }
            (Qualifier::And(mut parts), q) | (q, Qualifier::And(mut parts)) => {
                parts.push(q);
                Qualifier::And(parts)
            }
            (a, b) => Qualifier::And(vec![a, b]),
        }
    }
}

/// One relationship to join into the rows of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct JointPath {
    /// Namespace of the joined columns, e.g. `paintings` or `paintings.gallery`.
    pub path: String,
    /// Namespace the join starts from; empty for the root row.
    pub parent: String,
    /// Table (root entity) of the joined rows.
    pub target: String,
    /// `(source column, target column)` pairs.
    pub joins: Vec<(String, String)>,
    pub to_many: bool,
    /// Extra filter on the joined rows (sub-entity discriminators).
    pub target_filter: Qualifier,
}

/// Abstract description of one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    /// Table (root entity) to read.
    pub entity: String,
    pub qualifier: Qualifier,
    /// Maximum number of distinct root rows. Satellite fan-out is not limited.
    pub fetch_limit: Option<usize>,
    /// Relationships joined into wide rows, parents before children.
    pub joint: Vec<JointPath>,
}

impl QueryDescriptor {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: Qualifier::All,
            fetch_limit: None,
            joint: Vec::new(),
        }
    }

    pub fn qualifier(mut self, qualifier: Qualifier) -> Self {
        self.qualifier = qualifier;
        self
    }

    pub fn fetch_limit(mut self, limit: Option<usize>) -> Self {
        self.fetch_limit = limit;
        self
    }

    pub fn joint(mut self, path: JointPath) -> Self {
        self.joint.push(path);
        self
    }
}

// ============================================================================
// Writes
// ============================================================================

/// Binds local foreign-key columns to the key of another object.
///
/// The target may be a temporary identity inserted earlier in the same
/// diff; executors resolve it through the keys generated so far.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyReference {
    pub target: ObjectIdentity,
    /// `(local column, target key column)` pairs.
    pub columns: Vec<(String, String)>,
}

/// One row operation. The table is the identity's entity tag.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp {
    Insert {
        identity: ObjectIdentity,
        values: RowSnapshot,
        references: Vec<KeyReference>,
    },
    Update {
        identity: ObjectIdentity,
        /// Columns to set.
        values: RowSnapshot,
        references: Vec<KeyReference>,
        /// Optimistic lock: the row must still hold these values.
        expected: Option<RowSnapshot>,
    },
    Delete {
        identity: ObjectIdentity,
        expected: Option<RowSnapshot>,
    },
}

impl DiffOp {
    pub fn identity(&self) -> &ObjectIdentity {
        match self {
            DiffOp::Insert { identity, .. }
            | DiffOp::Update { identity, .. }
            | DiffOp::Delete { identity, .. } => identity,
        }
    }

    /// Column values with every reference resolved to concrete key values.
    pub fn resolved_values(&self, keys: &GeneratedKeys) -> Result<RowSnapshot, StorageError> {
        let (values, references) = match self {
            DiffOp::Insert {
                values, references, ..
            }
            | DiffOp::Update {
                values, references, ..
            } => (values, references),
            DiffOp::Delete { .. } => return Ok(RowSnapshot::default()),
        };
        if references.is_empty() {
            return Ok(values.clone());
        }
        let mut resolved = Vec::new();
        for reference in references {
            resolved.extend(keys.resolve(reference)?);
        }
        Ok(values.merged(&RowSnapshot::new(resolved)))
    }
}

/// Row operations in apply order: inserts (parents first), updates,
/// deletes (dependents first).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderedDiff {
    ops: Vec<DiffOp>,
}

impl OrderedDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: DiffOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[DiffOp] {
        &self.ops
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiffOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// `(inserts, updates, deletes)`
    pub fn counts(&self) -> (usize, usize, usize) {
        self.ops.iter().fold((0, 0, 0), |(i, u, d), op| match op {
            DiffOp::Insert { .. } => (i + 1, u, d),
            DiffOp::Update { .. } => (i, u + 1, d),
            DiffOp::Delete { .. } => (i, u, d + 1),
        })
    }
}

/// Keys assigned by storage to inserted objects, by temporary identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedKeys {
    keys: HashMap<ObjectIdentity, Vec<(String, Value)>>,
}

impl GeneratedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, temporary: ObjectIdentity, key: Vec<(String, Value)>) {
        self.keys.insert(temporary, key);
    }

    pub fn get(&self, temporary: &ObjectIdentity) -> Option<&[(String, Value)]> {
        self.keys.get(temporary).map(Vec::as_slice)
    }

    /// Permanent identity for an inserted object.
    pub fn permanent_identity(&self, temporary: &ObjectIdentity) -> Option<ObjectIdentity> {
        self.keys
            .get(temporary)
            .map(|key| ObjectIdentity::permanent(temporary.entity(), key.iter().cloned()))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectIdentity, &[(String, Value)])> {
        self.keys.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Concrete `(local column, value)` pairs for a reference.
    pub fn resolve(&self, reference: &KeyReference) -> Result<Vec<(String, Value)>, StorageError> {
        let key: &[(String, Value)] = if reference.target.is_temporary() {
            self.get(&reference.target).ok_or_else(|| {
                StorageError::backend(format!(
                    "{} is referenced before it was inserted",
                    reference.target
                ))
            })?
        } else {
            reference.target.key().unwrap_or_default()
        };
        reference
            .columns
            .iter()
            .map(|(local, target)| {
                key.iter()
                    .find(|(c, _)| c == target)
                    .map(|(_, v)| (local.clone(), v.clone()))
                    .ok_or_else(|| {
                        StorageError::backend(format!(
                            "{} has no key column '{target}'",
                            reference.target
                        ))
                    })
            })
            .collect()
    }
}

/// A storage backend.
///
/// `execute` applies the whole diff in one transaction: either every
/// operation takes effect or none does. Both calls block until the backend
/// answers.
pub trait StorageExecutor: Send + Sync {
    fn execute(&self, diff: &OrderedDiff) -> Result<GeneratedKeys, StorageError>;

    fn fetch(&self, query: &QueryDescriptor) -> Result<Vec<RowSnapshot>, StorageError>;
}
