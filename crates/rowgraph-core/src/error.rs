//! Error types for rowgraph operations.

use std::fmt;

use crate::identity::ObjectIdentity;
use crate::state::PersistenceState;

/// The primary error type for all rowgraph operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Re-indexing a temporary identity collided with a live permanent one.
    #[error("identity conflict: {permanent} (assigned to {temporary}) already maps to another live object")]
    IdentityConflict {
        temporary: ObjectIdentity,
        permanent: ObjectIdentity,
    },

    /// The row changed in storage since this context last read it.
    #[error("optimistic lock failure for {identity}: row no longer matches the last known snapshot")]
    OptimisticLockFailure { identity: ObjectIdentity },

    /// A validation hook rejected a pending object.
    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    /// A DENY delete rule found dependent objects.
    #[error("cannot delete {identity}: {dependents} dependent object(s) via '{relationship}'")]
    DeleteRuleViolation {
        identity: ObjectIdentity,
        relationship: String,
        dependents: usize,
    },

    /// The storage executor failed; the transaction was rolled back.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Satellite rows did not match the fetched roots.
    #[error(transparent)]
    Prefetch(#[from] PrefetchResolutionError),

    /// New objects reference each other in a cycle that no insert order satisfies.
    #[error("dependency cycle between new objects: {}", join_identities(.identities))]
    DependencyCycle { identities: Vec<ObjectIdentity> },

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("entity '{entity}' has no attribute '{attribute}'")]
    UnknownAttribute { entity: String, attribute: String },

    #[error("entity '{entity}' has no relationship '{relationship}'")]
    UnknownRelationship { entity: String, relationship: String },

    #[error("object {0} is not registered in this context")]
    ObjectNotFound(ObjectIdentity),

    /// An operation is not allowed in the object's current state.
    #[error("cannot {operation} {identity} in state {state}")]
    InvalidState {
        identity: ObjectIdentity,
        state: PersistenceState,
        operation: &'static str,
    },

    /// Value conversion failed.
    #[error("type error: expected {expected}, found {actual}")]
    Type {
        expected: &'static str,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    /// A context hook aborted the operation.
    #[error("callback aborted the operation: {0}")]
    Callback(String),
}

fn join_identities(identities: &[ObjectIdentity]) -> String {
    identities
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    /// Whether this error was produced before anything reached storage.
    pub fn is_pre_apply(&self) -> bool {
        !matches!(self, Error::Storage(_) | Error::OptimisticLockFailure { .. })
    }
}

/// Result type alias for rowgraph operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Storage errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Backend failure (constraint violation, lost connection, ...).
    Backend,
    /// An update or delete matched a different number of rows than expected.
    RowCountMismatch {
        identity: ObjectIdentity,
        expected: u64,
        actual: u64,
    },
    /// The backend cannot serve this request.
    Unsupported,
}

/// Opaque error raised by a storage executor.
#[derive(Debug, thiserror::Error)]
#[error("storage error: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Backend,
            message: message.into(),
            source: None,
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Unsupported,
            message: message.into(),
            source: None,
        }
    }

    pub fn row_count_mismatch(identity: ObjectIdentity, expected: u64, actual: u64) -> Self {
        let message = format!("{identity}: expected {expected} row(s), matched {actual}");
        Self {
            kind: StorageErrorKind::RowCountMismatch {
                identity,
                expected,
                actual,
            },
            message,
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

// ============================================================================
// Validation errors
// ============================================================================

/// One failed check on one attribute (or on the object as a whole).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValidationError {
    /// Attribute name, or `None` for object-level failures.
    pub attribute: Option<String>,
    pub message: String,
}

impl fmt::Display for FieldValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attribute) => write!(f, "{attribute}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Validation failure for one pending object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("validation failed for {identity}: {}", join_errors(.errors))]
pub struct ValidationFailure {
    pub identity: ObjectIdentity,
    pub errors: Vec<FieldValidationError>,
}

fn join_errors(errors: &[FieldValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationFailure {
    pub fn new(identity: ObjectIdentity) -> Self {
        Self {
            identity,
            errors: Vec::new(),
        }
    }

    /// Add an attribute-level error.
    pub fn add(&mut self, attribute: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldValidationError {
            attribute: Some(attribute.into()),
            message: message.into(),
        });
    }

    /// Add an object-level error.
    pub fn add_object(&mut self, message: impl Into<String>) {
        self.errors.push(FieldValidationError {
            attribute: None,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when no errors were collected.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

// ============================================================================
// Prefetch errors
// ============================================================================

/// A satellite row could not be attached during prefetch resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("prefetch '{path}' failed{}: {message}", root_suffix(.root.as_ref()))]
pub struct PrefetchResolutionError {
    /// Prefetch path, e.g. `paintings.gallery`.
    pub path: String,
    /// The affected root, when known.
    pub root: Option<ObjectIdentity>,
    pub message: String,
}

fn root_suffix(root: Option<&ObjectIdentity>) -> String {
    root.map(|r| format!(" for {r}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_failure_display() {
        let mut failure = ValidationFailure::new(ObjectIdentity::single("Artist", "id", 1_i64));
        failure.add("name", "must not be null");
        failure.add_object("inconsistent");
        assert_eq!(
            failure.to_string(),
            "validation failed for Artist{id=1}: name: must not be null; inconsistent"
        );
    }

    #[test]
    fn test_empty_validation_is_ok() {
        let failure = ValidationFailure::new(ObjectIdentity::temporary("Artist"));
        assert!(failure.into_result().is_ok());
    }

    #[test]
    fn test_storage_error_source_chain() {
        let io = std::io::Error::other("disk full");
        let err: Error = StorageError::backend("insert failed").with_source(io).into();
        assert!(!err.is_pre_apply());
        // Transparent variants forward to the storage error's own source.
        let source = std::error::Error::source(&err);
        assert_eq!(source.map(ToString::to_string), Some("disk full".to_string()));
    }

    #[test]
    fn test_prefetch_error_display() {
        let err = PrefetchResolutionError {
            path: "paintings".into(),
            root: None,
            message: "orphan row".into(),
        };
        assert_eq!(err.to_string(), "prefetch 'paintings' failed: orphan row");
    }
}
