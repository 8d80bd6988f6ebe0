//! rowgraph - a transactional object-graph cache over row storage.
//!
//! rowgraph sits between application code and a row store. It provides:
//!
//! - Object contexts with one live object per identity
//! - Recorded edits that fold into a net diff, commit atomically and roll back
//! - Prefetch trees resolved with a bounded number of fetches
//! - A process-wide snapshot store that keeps sibling contexts in sync
//! - Nested contexts that commit into their parent
//!
//! # Quick Start
//!
//! ```ignore
//! use rowgraph::prelude::*;
//!
//! static ARTIST: EntityInfo = EntityInfo::new("Artist", &["id"])
//!     .attributes(&[AttributeInfo::new("name").nullable(false)])
//!     .relationships(&[
//!         RelationshipInfo::to_many("paintings", "Painting", &[("id", "artist_id")]).reverse("artist"),
//!     ]);
//! static PAINTING: EntityInfo = EntityInfo::new("Painting", &["id"])
//!     .attributes(&[AttributeInfo::new("title")])
//!     .relationships(&[
//!         RelationshipInfo::to_one("artist", "Artist", &[("artist_id", "id")]).reverse("paintings"),
//!     ]);
//!
//! let storage = Arc::new(MemoryStorage::new());
//! storage.define_table("Artist", &["id"], true);
//! storage.define_table("Painting", &["id"], true);
//!
//! let domain = Domain::builder(storage).entities(&[&ARTIST, &PAINTING]).build()?;
//! let mut ctx = domain.new_context();
//!
//! let artist = ctx.create("Artist")?;
//! ctx.set_attribute(&artist, "name", "Monet")?;
//! let painting = ctx.create("Painting")?;
//! ctx.set_to_one(&painting, "artist", Some(&artist))?;
//!
//! let outcome = ctx.commit()?;
//! let artist = outcome.permanent_identity(&artist).cloned();
//! ```
//!
//! # Crates
//!
//! - `rowgraph-core`: entity metadata, identities, rows, errors and the
//!   storage executor contract
//! - `rowgraph-cache`: the shared snapshot store and its change events
//! - `rowgraph-session`: object contexts, prefetching and commit
//! - `rowgraph-memory`: an in-memory storage executor

pub use rowgraph_core::{
    AttributeInfo, DeleteRule, DiffOp, Discriminator, EntityDescriptor, EntityInfo, EntityRegistry,
    Error, FieldValidationError, GeneratedKeys, JoinTable, JointPath, KeyReference, LockingStrategy,
    NAMESPACE_SEPARATOR, ObjectIdentity, OrderedDiff, PersistenceState, PrefetchResolutionError,
    Qualifier, QueryDescriptor, RelationshipInfo, RelationshipKind, Result, RowSnapshot,
    StorageError, StorageErrorKind, StorageExecutor, ValidationFailure, Value,
};

pub use rowgraph_cache::{
    DEFAULT_BOUNDED_CAPACITY, EventInbox, SnapshotBatch, SnapshotEvent, SnapshotEventKind,
    SnapshotListener, SnapshotStore, SnapshotStoreConfig, SnapshotStoreStats, SubscriberId,
};

pub use rowgraph_session::{
    AttributeDelta, ChangeCategory, ChangeDiff, ChangeEntry, ChangeRecorder, CommitOutcome,
    CommitPhase, CommitPlan, ContextChannel, ContextConfig, ContextEvent, Domain, DomainBuilder,
    DomainConfig, DomainObject, FaultStats, FaultTracker, IdentityGraph, InverseChange,
    LifecycleCallbacks, LifecycleEvent, Model, NotNullRule, ObjectChange, ObjectContext,
    ObjectHandle, PatternRule, PrefetchNode, PrefetchSemantics, PreparedCommit, Relation,
    RelationshipChange, RelationshipDelta, SelectQuery, SelectResult, SharedContext,
    ValidationHook, attribute, identity_for_row,
};

pub use rowgraph_memory::MemoryStorage;

/// Everything an application typically needs.
pub mod prelude {
    pub use crate::{
        // Metadata
        AttributeInfo,
        // Commit
        CommitOutcome,
        CommitPhase,
        DeleteRule,
        // Contexts
        Domain,
        DomainConfig,
        DomainObject,
        EntityInfo,
        Error,
        JoinTable,
        LifecycleEvent,
        LockingStrategy,
        // Storage
        MemoryStorage,
        Model,
        ObjectContext,
        ObjectIdentity,
        PersistenceState,
        PrefetchSemantics,
        Qualifier,
        RelationshipInfo,
        Result,
        RowSnapshot,
        SelectQuery,
        SharedContext,
        SnapshotStore,
        StorageExecutor,
        Value,
        attribute,
    };
    pub use std::sync::Arc;
}
