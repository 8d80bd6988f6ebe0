//! Core types for rowgraph.
//!
//! This crate provides the foundational vocabulary shared by every other
//! rowgraph crate:
//!
//! - `Value` for dynamically-typed column values
//! - `ObjectIdentity` for permanent and temporary object identities
//! - `RowSnapshot` for immutable row images
//! - `EntityInfo` / `EntityRegistry` for entity metadata and accessor tables
//! - `StorageExecutor` for the storage backend contract
//! - `Error` for the error taxonomy

pub mod entity;
pub mod error;
pub mod identity;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod value;

pub use entity::{
    AttributeInfo, DeleteRule, Discriminator, EntityDescriptor, EntityInfo, EntityRegistry,
    JoinTable, LockingStrategy, RelationshipInfo, RelationshipKind,
};
pub use error::{
    Error, FieldValidationError, PrefetchResolutionError, Result, StorageError, StorageErrorKind,
    ValidationFailure,
};
pub use identity::ObjectIdentity;
pub use snapshot::{NAMESPACE_SEPARATOR, RowSnapshot};
pub use state::PersistenceState;
pub use storage::{
    DiffOp, GeneratedKeys, JointPath, KeyReference, OrderedDiff, Qualifier, QueryDescriptor,
    StorageExecutor,
};
pub use value::Value;
