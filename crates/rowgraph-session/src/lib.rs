//! Object contexts for rowgraph.
//!
//! `rowgraph-session` is the **object-graph layer**. It turns rows from a
//! [`StorageExecutor`](rowgraph_core::StorageExecutor) into live, mutually
//! referencing domain objects, records every edit made to them and commits
//! the net result back as one ordered, transactional diff.
//!
//! # Role In The Architecture
//!
//! - **Identity graph**: one live object per identity within a context.
//! - **Change recording**: every mutation is logged; the log folds into a
//!   net diff and unwinds for rollback.
//! - **Prefetching**: a select resolves a tree of relationship paths with a
//!   bounded number of fetches.
//! - **Commit**: validation, dependency ordering and delete rules, then one
//!   executor call.
//! - **Nesting**: child contexts commit into their parent's graph.
//! - **Sibling sync**: committed rows flow through the shared
//!   [`SnapshotStore`](rowgraph_cache::SnapshotStore) into other contexts.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: nothing is written until `commit`.
//! - **Local edits win**: fetches and sibling events never overwrite
//!   unsaved changes.
//! - **No half commits**: any failure leaves the context as it was.
//!
//! # Example
//!
//! ```ignore
//! let domain = Domain::builder(storage).entities(&[&ARTIST, &PAINTING]).build()?;
//! let mut ctx = domain.new_context();
//!
//! let artists = ctx.select(
//!     &SelectQuery::new("Artist").prefetch("paintings", PrefetchSemantics::DisjointById),
//! )?;
//! for artist in &artists.objects {
//!     // Already resolved: no fetch here.
//!     let paintings = ctx.to_many(artist, "paintings")?;
//! }
//!
//! let painting = ctx.create("Painting")?;
//! ctx.set_attribute(&painting, "title", "Water Lilies")?;
//! ctx.set_to_one(&painting, "artist", Some(&artists.objects[0]))?;
//! ctx.commit()?;
//! ```

pub mod change_recorder;
pub mod commit;
pub mod context;
pub mod domain;
pub mod fault_tracker;
pub mod flush;
pub mod identity_graph;
pub mod lifecycle;
pub mod object;
pub mod prefetch;
pub mod validation;

pub use change_recorder::{
    AttributeDelta, ChangeCategory, ChangeDiff, ChangeEntry, ChangeRecorder, InverseChange,
    ObjectChange, RelationshipChange, RelationshipDelta,
};
pub use commit::{CommitOutcome, CommitPhase, PreparedCommit};
pub use context::{ContextChannel, ContextEvent, ContextEventCallbacks, ObjectContext, SharedContext};
pub use domain::{ContextConfig, Domain, DomainBuilder, DomainConfig};
pub use fault_tracker::{DEFAULT_FAULT_WARNING_THRESHOLD, FaultSite, FaultStats, FaultTracker};
pub use flush::CommitPlan;
pub use identity_graph::{IdentityGraph, ObjectHandle};
pub use lifecycle::{LifecycleCallbacks, LifecycleEvent};
pub use object::{DomainObject, Fault, Model, Relation, attribute, identity_for_row};
pub use prefetch::{PrefetchNode, PrefetchSemantics, SelectQuery, SelectResult};
pub use validation::{NotNullRule, PatternRule, ValidationHook};
