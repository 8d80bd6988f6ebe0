//! Object contexts: the unit of work application code edits through.
//!
//! An [`ObjectContext`] owns an [`IdentityGraph`] and a [`ChangeRecorder`].
//! Reads fault objects in through its [`ContextChannel`]; writes go through
//! the context so that every change is recorded and both sides of a
//! relationship stay consistent.
//!
//! # Nesting
//!
//! A child context is created from a [`SharedContext`]. It reads through its
//! parent and commits by merging its diff into the parent's graph, where the
//! edits stay pending until the parent commits to storage.
//!
//! # Sibling contexts
//!
//! Top-level contexts subscribe to the domain's snapshot store. Commits of
//! other contexts arrive as queued events and are merged into live objects
//! by [`ObjectContext::process_snapshot_events`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rowgraph_cache::{EventInbox, SnapshotBatch, SnapshotEvent, SnapshotEventKind, SnapshotStore, SubscriberId};
use rowgraph_core::{
    Error, ObjectIdentity, PersistenceState, Qualifier, QueryDescriptor, RelationshipInfo, Result,
    RowSnapshot, StorageExecutor, Value,
};

use crate::change_recorder::{
    ChangeCategory, ChangeDiff, ChangeEntry, ChangeRecorder, InverseChange, RelationshipChange,
};
use crate::commit::CommitPhase;
use crate::domain::Domain;
use crate::fault_tracker::{FaultStats, FaultTracker};
use crate::identity_graph::{IdentityGraph, ObjectHandle};
use crate::lifecycle::LifecycleEvent;
use crate::object::{DomainObject, Fault, Model, Relation};
use crate::prefetch::{PrefetchResolver, SelectQuery, SelectResult, fetch_links};

/// A context behind a lock, shareable as the parent of child contexts.
pub type SharedContext = Arc<Mutex<ObjectContext>>;

pub(crate) fn lock(context: &SharedContext) -> MutexGuard<'_, ObjectContext> {
    context.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Context Events
// ============================================================================

/// Type alias for context event callbacks.
///
/// Returning `Err` aborts the operation in progress.
type ContextEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Callbacks fired at commit and rollback boundaries.
#[derive(Default)]
pub struct ContextEventCallbacks {
    before_commit: Vec<ContextEventFn>,
    after_commit: Vec<ContextEventFn>,
    after_rollback: Vec<ContextEventFn>,
}

impl std::fmt::Debug for ContextEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEventCallbacks")
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl ContextEventCallbacks {
    pub(crate) fn fire(&mut self, event: ContextEvent) -> Result<()> {
        let callbacks = match event {
            ContextEvent::BeforeCommit => &mut self.before_commit,
            ContextEvent::AfterCommit => &mut self.after_commit,
            ContextEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Context lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    /// Fired before VALIDATING; an error aborts the commit.
    BeforeCommit,
    /// Fired after the commit took effect.
    AfterCommit,
    AfterRollback,
}

// ============================================================================
// Channel
// ============================================================================

/// Where a context reads from and commits to.
#[derive(Clone)]
pub enum ContextChannel {
    Storage {
        executor: Arc<dyn StorageExecutor>,
        snapshots: Arc<SnapshotStore>,
    },
    Parent(SharedContext),
}

impl std::fmt::Debug for ContextChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextChannel::Storage { snapshots, .. } => f
                .debug_struct("Storage")
                .field("snapshots", &snapshots.name())
                .finish_non_exhaustive(),
            // Locking the parent here could deadlock.
            ContextChannel::Parent(_) => f.write_str("Parent"),
        }
    }
}

// ============================================================================
// Object Context
// ============================================================================

/// A working set of domain objects plus its pending changes.
///
/// Not safe for concurrent mutation; share it behind a [`SharedContext`]
/// when child contexts need it as their parent.
pub struct ObjectContext {
    pub(crate) domain: Domain,
    pub(crate) channel: ContextChannel,
    pub(crate) graph: IdentityGraph,
    pub(crate) recorder: ChangeRecorder,
    /// Temporary identities re-indexed by this context, with their
    /// permanent identity.
    pub(crate) aliases: HashMap<ObjectIdentity, ObjectIdentity>,
    inbox: Option<Arc<EventInbox>>,
    pub(crate) subscriber: Option<SubscriberId>,
    faults: FaultTracker,
    pub(crate) events: ContextEventCallbacks,
    pub(crate) phase: CommitPhase,
}

impl std::fmt::Debug for ObjectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectContext")
            .field("channel", &self.channel)
            .field("objects", &self.graph.len())
            .field("pending", &self.recorder.len())
            .field("subscriber", &self.subscriber)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl Drop for ObjectContext {
    fn drop(&mut self) {
        if let (Some(id), ContextChannel::Storage { snapshots, .. }) = (self.subscriber, &self.channel) {
            snapshots.unsubscribe(id);
        }
    }
}

impl ObjectContext {
    /// A top-level context bound to the domain's storage and snapshot store.
    pub fn new(domain: &Domain) -> Self {
        let snapshots = Arc::clone(domain.snapshots());
        let inbox = EventInbox::new();
        let subscriber = snapshots.subscribe(inbox.clone());
        let mut context = Self::with_channel(
            domain.clone(),
            ContextChannel::Storage {
                executor: Arc::clone(domain.executor()),
                snapshots,
            },
        );
        context.inbox = Some(inbox);
        context.subscriber = Some(subscriber);
        tracing::debug!(%subscriber, "Object context created");
        context
    }

    /// A child context that reads through and commits into `parent`.
    pub fn new_child(parent: &SharedContext) -> Self {
        let domain = lock(parent).domain.clone();
        tracing::debug!("Child context created");
        Self::with_channel(domain, ContextChannel::Parent(Arc::clone(parent)))
    }

    fn with_channel(domain: Domain, channel: ContextChannel) -> Self {
        let config = domain.config();
        let graph = IdentityGraph::with_gc_threshold(config.gc_threshold);
        let faults = FaultTracker::new(config.fault_warning_threshold);
        Self {
            domain,
            channel,
            graph,
            recorder: ChangeRecorder::new(),
            aliases: HashMap::new(),
            inbox: None,
            subscriber: None,
            faults,
            events: ContextEventCallbacks::default(),
            phase: CommitPhase::Idle,
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn channel(&self) -> &ContextChannel {
        &self.channel
    }

    pub fn is_child(&self) -> bool {
        matches!(self.channel, ContextChannel::Parent(_))
    }

    pub fn graph(&self) -> &IdentityGraph {
        &self.graph
    }

    pub fn recorder(&self) -> &ChangeRecorder {
        &self.recorder
    }

    /// Net pending changes.
    pub fn changes(&self) -> ChangeDiff {
        self.recorder.diff()
    }

    pub fn has_changes(&self) -> bool {
        !self.recorder.is_empty()
    }

    /// Phase the last commit attempt reached.
    pub fn last_phase(&self) -> CommitPhase {
        self.phase
    }

    pub fn subscriber_id(&self) -> Option<SubscriberId> {
        self.subscriber
    }

    pub fn fault_stats(&self) -> FaultStats {
        self.faults.stats()
    }

    pub fn fault_tracker_mut(&mut self) -> &mut FaultTracker {
        &mut self.faults
    }

    // ========================================================================
    // Context Events
    // ========================================================================

    /// Register a callback to run before a commit starts validating.
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Fetch root objects and their prefetched subgraph.
    #[tracing::instrument(level = "debug", skip(self, query), fields(entity = query.entity()))]
    pub fn select(&mut self, query: &SelectQuery) -> Result<SelectResult> {
        let (result, _) = self.select_tracked(query)?;
        Ok(result)
    }

    /// Select, also reporting every identity materialized along the way.
    fn select_tracked(&mut self, query: &SelectQuery) -> Result<(SelectResult, Vec<ObjectIdentity>)> {
        match self.channel.clone() {
            ContextChannel::Storage { executor, snapshots } => {
                let resolution =
                    PrefetchResolver::new(self.domain.registry(), &mut self.graph, executor.as_ref())
                        .select(query)?;
                self.publish_rows(&snapshots, resolution.rows);
                self.fire_post_load(&resolution.loaded)?;

                let mut touched = resolution.loaded;
                let seen: HashSet<ObjectIdentity> = touched.iter().cloned().collect();
                touched.extend(resolution.roots.iter().filter(|r| !seen.contains(*r)).cloned());
                let result = SelectResult {
                    objects: resolution.roots,
                    prefetch_errors: resolution.errors,
                };
                Ok((result, touched))
            }
            ContextChannel::Parent(parent) => {
                self.follow_parent_reindexing()?;
                let (result, images) = lock(&parent).select_for_child(query)?;
                let mut touched = Vec::with_capacity(images.len());
                let mut imported = Vec::new();
                for image in images {
                    let identity = image.identity().clone();
                    if self.import(image) {
                        imported.push(identity.clone());
                    }
                    touched.push(identity);
                }
                self.fire_post_load(&imported)?;
                Ok((result, touched))
            }
        }
    }

    /// Serve a child's select from this context's graph.
    pub(crate) fn select_for_child(&mut self, query: &SelectQuery) -> Result<(SelectResult, Vec<DomainObject>)> {
        let (result, touched) = self.select_tracked(query)?;
        let images = touched
            .iter()
            .filter_map(|identity| self.graph.lookup(identity).cloned())
            .collect();
        Ok((result, images))
    }

    /// Raw rows, without materializing objects or firing callbacks.
    pub fn select_rows(&self, query: &QueryDescriptor) -> Result<Vec<RowSnapshot>> {
        match &self.channel {
            ContextChannel::Storage { executor, .. } => Ok(executor.fetch(query)?),
            ContextChannel::Parent(parent) => lock(parent).select_rows(query),
        }
    }

    /// The object registered under `identity`, faulting it in if needed.
    pub fn object(&mut self, identity: &ObjectIdentity) -> Result<&DomainObject> {
        let identity = &self.current_identity(identity)?;
        self.fault(identity)?;
        self.graph.require(identity)
    }

    /// The registered object, without faulting.
    pub fn lookup(&self, identity: &ObjectIdentity) -> Option<&DomainObject> {
        self.graph.lookup(identity)
    }

    pub fn find<M: Model>(&mut self, identity: &ObjectIdentity) -> Result<M> {
        M::from_object(self.object(identity)?)
    }

    /// Target of a to-one relationship, faulted in.
    #[track_caller]
    pub fn to_one(&mut self, identity: &ObjectIdentity, relationship: &str) -> Result<Option<ObjectIdentity>> {
        let identity = &self.current_identity(identity)?;
        self.fault(identity)?;
        let object = self.graph.require(identity)?;
        let (index, rel) = object.descriptor().require_relationship(relationship)?;
        if rel.is_to_many() {
            return Err(wrong_cardinality("to-one relationship", object.entity(), rel));
        }
        let entity = object.entity();
        let name = rel.name;
        let target = object.to_one_target(index);
        if let Some(target) = &target {
            if !self.is_loaded(target) {
                self.faults.record(entity, name);
                self.fault(target)?;
            }
        }
        Ok(target)
    }

    /// Members of a to-many relationship, fetched on first access.
    #[track_caller]
    pub fn to_many(&mut self, identity: &ObjectIdentity, relationship: &str) -> Result<Vec<ObjectIdentity>> {
        let identity = &self.current_identity(identity)?;
        self.fault(identity)?;
        let object = self.graph.require(identity)?;
        let (index, rel) = object.descriptor().require_relationship(relationship)?;
        if !rel.is_to_many() {
            return Err(wrong_cardinality("to-many relationship", object.entity(), rel));
        }
        if let Relation::ToMany(Fault::Resolved(members)) = object.relation_at(index) {
            return Ok(members.clone());
        }
        let rel = *rel;
        let source_key = object.to_row().tuple(&rel.source_columns());
        self.faults.record(object.entity(), rel.name);

        let members = match self.channel.clone() {
            ContextChannel::Parent(parent) => {
                let (members, images) = {
                    let mut parent = lock(&parent);
                    let members = parent.to_many(identity, relationship)?;
                    let images: Vec<DomainObject> = members
                        .iter()
                        .filter_map(|m| parent.graph.lookup(m).cloned())
                        .collect();
                    (members, images)
                };
                let mut imported = Vec::new();
                for image in images {
                    let id = image.identity().clone();
                    if self.import(image) {
                        imported.push(id);
                    }
                }
                self.fire_post_load(&imported)?;
                members
            }
            ContextChannel::Storage { executor, snapshots } => {
                let mut members = Vec::new();
                let tuples = match (source_key.filter(|t| t.iter().all(|v| !v.is_null())), &rel.through) {
                    (Some(tuple), Some(join)) => fetch_links(executor.as_ref(), join, vec![tuple])?
                        .into_iter()
                        .map(|(_, target)| target)
                        .collect(),
                    (Some(tuple), None) => vec![tuple],
                    (None, _) => Vec::new(),
                };
                if !tuples.is_empty() {
                    let query = SelectQuery::new(rel.target).filter(Qualifier::KeysIn {
                        columns: rel.target_columns().iter().map(ToString::to_string).collect(),
                        tuples,
                    });
                    let resolution =
                        PrefetchResolver::new(self.domain.registry(), &mut self.graph, executor.as_ref())
                            .select(&query)?;
                    self.publish_rows(&snapshots, resolution.rows);
                    self.fire_post_load(&resolution.loaded)?;
                    members = resolution.roots;
                }
                self.graph.reconcile_members(identity, &rel, &mut members);
                members
            }
        };

        let object = self.graph.require_mut(identity)?;
        let (index, _) = object.descriptor().require_relationship(relationship)?;
        object.set_relation(index, Relation::ToMany(Fault::Resolved(members.clone())));
        Ok(members)
    }

    fn is_loaded(&self, identity: &ObjectIdentity) -> bool {
        self.graph
            .lookup(identity)
            .is_some_and(|o| o.state() != PersistenceState::Hollow)
    }

    /// Make sure `identity` is registered with its field data loaded.
    ///
    /// Storage-bound contexts try the snapshot store before fetching.
    pub(crate) fn fault(&mut self, identity: &ObjectIdentity) -> Result<()> {
        if self.is_loaded(identity) {
            return Ok(());
        }
        match self.channel.clone() {
            ContextChannel::Parent(parent) => {
                let image = lock(&parent).object(identity).cloned()?;
                if image.state() == PersistenceState::Deleted {
                    return Err(Error::ObjectNotFound(identity.clone()));
                }
                self.import(image);
            }
            ContextChannel::Storage { executor, snapshots } => {
                if identity.is_temporary() {
                    return Err(Error::ObjectNotFound(identity.clone()));
                }
                let row = match snapshots.get(identity) {
                    Some(row) => row,
                    None => {
                        let row = fetch_by_key(executor.as_ref(), identity)?
                            .ok_or_else(|| Error::ObjectNotFound(identity.clone()))?;
                        self.publish_rows(&snapshots, vec![(identity.clone(), row.clone())]);
                        row
                    }
                };
                let descriptor = self.domain.registry().resolve_variant(identity.entity(), &row)?;
                match self.graph.lookup_mut(identity) {
                    Some(object) => {
                        object.set_descriptor(descriptor);
                        object.load_row(row);
                    }
                    None => {
                        self.graph
                            .register(DomainObject::from_row(identity.clone(), descriptor, row));
                    }
                }
            }
        }
        tracing::trace!(%identity, "Faulted object");
        self.fire_post_load(std::slice::from_ref(identity))
    }

    /// Take over an object image from the parent as COMMITTED data.
    ///
    /// Local changes win: dirty local objects are left alone.
    fn import(&mut self, image: DomainObject) -> bool {
        if image.state() == PersistenceState::Deleted {
            return false;
        }
        if let Some(local) = self.graph.lookup(image.identity()) {
            let hollow_over_loaded = image.state() == PersistenceState::Hollow
                && local.state() != PersistenceState::Hollow;
            if local.state().is_dirty() || hollow_over_loaded {
                return false;
            }
        }
        let mut object = image;
        if object.state() != PersistenceState::Hollow {
            let row = object.to_row();
            object.set_snapshot(Some(row));
            object.set_state(PersistenceState::Committed);
        }
        self.graph.register(object);
        true
    }

    fn fire_post_load(&self, identities: &[ObjectIdentity]) -> Result<()> {
        let callbacks = self.domain.callbacks();
        if callbacks.is_empty() {
            return Ok(());
        }
        for identity in identities {
            if let Some(object) = self.graph.lookup(identity) {
                callbacks.fire(LifecycleEvent::PostLoad, object)?;
            }
        }
        Ok(())
    }

    /// Share freshly read rows with sibling contexts.
    fn publish_rows(&self, snapshots: &SnapshotStore, rows: Vec<(ObjectIdentity, RowSnapshot)>) {
        if !self.domain.config().publish_fetches || rows.is_empty() {
            return;
        }
        let mut batch = SnapshotBatch::new();
        for (identity, row) in rows {
            batch.push_changed(identity, row);
        }
        snapshots.put_batch(batch, self.subscriber);
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Register a NEW object with a temporary identity.
    pub fn create(&mut self, entity: &str) -> Result<ObjectIdentity> {
        let descriptor = self.domain.registry().descriptor(entity)?;
        let identity = ObjectIdentity::temporary(descriptor.root());
        let object = DomainObject::new(identity.clone(), descriptor);
        let attributes = object
            .descriptor()
            .attributes()
            .iter()
            .zip(object.values())
            .filter(|(_, value)| !value.is_null())
            .map(|(attribute, value)| (attribute.name.to_string(), value.clone()))
            .collect();
        self.graph.register(object);
        self.recorder.record(ChangeEntry::Create {
            identity: identity.clone(),
            attributes,
        });
        tracing::trace!(%identity, "Created object");
        Ok(identity)
    }

    /// Create an object from a typed model.
    pub fn insert<M: Model>(&mut self, model: &M) -> Result<ObjectIdentity> {
        let entity = M::entity().name;
        let descriptor = self.domain.registry().descriptor(entity)?;
        let attributes = model.to_attributes();
        for (name, _) in &attributes {
            descriptor.require_attribute(name)?;
        }
        let identity = self.create(entity)?;
        for (name, value) in attributes {
            self.write_attribute(&identity, name, value)?;
        }
        Ok(identity)
    }

    /// Write every attribute of a typed model onto an existing object.
    pub fn update<M: Model>(&mut self, identity: &ObjectIdentity, model: &M) -> Result<()> {
        for (name, value) in model.to_attributes() {
            self.set_attribute(identity, name, value)?;
        }
        Ok(())
    }

    pub fn set_attribute(
        &mut self,
        identity: &ObjectIdentity,
        attribute: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let identity = &self.current_identity(identity)?;
        self.fault(identity)?;
        self.write_attribute(identity, attribute, value.into())
    }

    fn write_attribute(&mut self, identity: &ObjectIdentity, attribute: &str, value: Value) -> Result<()> {
        let object = self.writable(identity, "set_attribute")?;
        let index = object.descriptor().require_attribute(attribute)?;
        if object.values()[index] == value {
            return Ok(());
        }
        let name = object.descriptor().attributes()[index].name;
        let old = object.set_value(index, value.clone());
        object.set_state(object.state().after_write());
        self.recorder.record(ChangeEntry::AttributeEdit {
            identity: identity.clone(),
            attribute: name.to_string(),
            old,
            new: value,
        });
        Ok(())
    }

    /// Point a to-one relationship at `target` (or at nothing) and update
    /// the reverse relationship of the old and new targets.
    pub fn set_to_one(
        &mut self,
        identity: &ObjectIdentity,
        relationship: &str,
        target: Option<&ObjectIdentity>,
    ) -> Result<()> {
        let identity = &self.current_identity(identity)?;
        let target = target.map(|t| self.current_identity(t)).transpose()?;
        let target = target.as_ref();
        self.fault(identity)?;
        if let Some(target) = target {
            self.fault(target)?;
        }
        let (index, rel) = self.relationship_of(identity, relationship)?;
        if rel.is_to_many() {
            let entity = self.graph.require(identity)?.entity();
            return Err(wrong_cardinality("to-one relationship", entity, &rel));
        }
        if let Some(target) = target {
            self.check_target(&rel, target)?;
        }
        let old = self.writable(identity, "set_to_one")?.to_one_target(index);
        if old.as_ref() == target {
            return Ok(());
        }
        self.write_to_one(identity, index, target.cloned());
        if let Some(reverse) = rel.reverse {
            if let Some(old) = &old {
                self.mirror(old, reverse, identity, false);
            }
            if let Some(target) = target {
                self.mirror(target, reverse, identity, true);
            }
        }
        Ok(())
    }

    /// Add `member` to a to-many relationship, moving it away from its
    /// previous owner when the reverse is a to-one.
    pub fn add_to_many(
        &mut self,
        identity: &ObjectIdentity,
        relationship: &str,
        member: &ObjectIdentity,
    ) -> Result<()> {
        let identity = &self.current_identity(identity)?;
        let member = &self.current_identity(member)?;
        let (index, rel) = self.collection(identity, relationship, member, "add_to_many")?;
        if !self.write_to_many(identity, index, member, true) {
            return Ok(());
        }
        if let Some(reverse) = rel.reverse {
            let previous = self.graph.lookup(member).and_then(|m| {
                let index = m.descriptor().relationship_index(reverse)?;
                let reverse_rel = &m.descriptor().relationships()[index];
                (!reverse_rel.is_to_many()).then(|| m.to_one_target(index)).flatten()
            });
            if let Some(previous) = previous.filter(|p| p != identity) {
                self.mirror(&previous, rel.name, member, false);
            }
            self.mirror(member, reverse, identity, true);
        }
        Ok(())
    }

    pub fn remove_from_many(
        &mut self,
        identity: &ObjectIdentity,
        relationship: &str,
        member: &ObjectIdentity,
    ) -> Result<()> {
        let identity = &self.current_identity(identity)?;
        let member = &self.current_identity(member)?;
        let (index, rel) = self.collection(identity, relationship, member, "remove_from_many")?;
        if !self.write_to_many(identity, index, member, false) {
            return Ok(());
        }
        if let Some(reverse) = rel.reverse {
            self.mirror(member, reverse, identity, false);
        }
        Ok(())
    }

    /// Mark an object for deletion.
    ///
    /// A NEW object is dropped on the spot together with every recorded
    /// trace of it. Deleting an already deleted object does nothing.
    pub fn delete(&mut self, identity: &ObjectIdentity) -> Result<()> {
        let identity = &self.current_identity(identity)?;
        if identity.is_temporary() && !self.graph.contains(identity) {
            return Err(Error::InvalidState {
                identity: identity.clone(),
                state: PersistenceState::Transient,
                operation: "delete",
            });
        }
        self.fault(identity)?;
        let object = self.graph.require(identity)?;
        let state = object.state();
        if state == PersistenceState::Deleted {
            return Ok(());
        }
        self.domain.callbacks().fire(LifecycleEvent::PreRemove, object)?;

        if state == PersistenceState::New {
            self.purge(identity);
            tracing::trace!(%identity, "Discarded new object");
            return Ok(());
        }
        if !state.is_deletable() {
            return Err(Error::InvalidState {
                identity: identity.clone(),
                state,
                operation: "delete",
            });
        }
        self.graph.require_mut(identity)?.set_state(PersistenceState::Deleted);
        self.recorder.record(ChangeEntry::Delete {
            identity: identity.clone(),
            prior_state: state,
        });
        Ok(())
    }

    /// Undo every pending change. Calling it again does nothing more.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        let inverses: Vec<InverseChange> = self
            .recorder
            .entries_for_rollback()
            .map(ChangeEntry::inverse)
            .collect();
        let undone = inverses.len();
        for inverse in inverses {
            self.undo(inverse);
        }
        self.recorder.clear();
        for object in self.graph.iter_mut() {
            if object.state() == PersistenceState::Modified {
                object.set_state(PersistenceState::Committed);
            }
        }
        self.phase = CommitPhase::Idle;
        tracing::debug!(undone, "Rolled back pending changes");
        self.events.fire(ContextEvent::AfterRollback)
    }

    fn undo(&mut self, inverse: InverseChange) {
        match inverse {
            InverseChange::Discard { identity } => {
                self.graph.remove(&identity);
                self.graph.drop_references(&identity);
            }
            InverseChange::SetAttribute {
                identity,
                attribute,
                value,
            } => {
                let Some(object) = self.graph.lookup_mut(&identity) else {
                    return;
                };
                if let Some(index) = object.descriptor().attribute_index(&attribute) {
                    object.set_value(index, value);
                }
            }
            InverseChange::Relationship {
                identity,
                relationship,
                change,
            } => {
                let Some(object) = self.graph.lookup_mut(&identity) else {
                    return;
                };
                let Some(index) = object.descriptor().relationship_index(&relationship) else {
                    return;
                };
                match change {
                    RelationshipChange::ToOne { new, .. } => {
                        object.set_relation(index, Relation::ToOne(Fault::Resolved(new)));
                    }
                    RelationshipChange::ToMany { added, removed } => {
                        if let Relation::ToMany(Fault::Resolved(members)) = object.relation_at(index) {
                            let mut members = members.clone();
                            members.retain(|m| !removed.contains(m));
                            for member in added {
                                if !members.contains(&member) {
                                    members.push(member);
                                }
                            }
                            object.set_relation(index, Relation::ToMany(Fault::Resolved(members)));
                        }
                    }
                }
            }
            InverseChange::Restore { identity, state } => {
                if let Some(object) = self.graph.lookup_mut(&identity) {
                    object.set_state(state);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Write helpers
    // ------------------------------------------------------------------------

    fn writable(&mut self, identity: &ObjectIdentity, operation: &'static str) -> Result<&mut DomainObject> {
        let object = self.graph.require_mut(identity)?;
        if !object.state().is_writable() {
            return Err(Error::InvalidState {
                identity: identity.clone(),
                state: object.state(),
                operation,
            });
        }
        Ok(object)
    }

    fn relationship_of(&self, identity: &ObjectIdentity, relationship: &str) -> Result<(usize, RelationshipInfo)> {
        let object = self.graph.require(identity)?;
        let (index, rel) = object.descriptor().require_relationship(relationship)?;
        Ok((index, *rel))
    }

    fn check_target(&self, rel: &RelationshipInfo, target: &ObjectIdentity) -> Result<()> {
        let object = self.graph.require(target)?;
        if object.descriptor().is_a(rel.target) {
            Ok(())
        } else {
            Err(Error::Type {
                expected: rel.target,
                actual: object.entity().to_string(),
            })
        }
    }

    /// Checks shared by collection edits. Resolves the collection first.
    fn collection(
        &mut self,
        identity: &ObjectIdentity,
        relationship: &str,
        member: &ObjectIdentity,
        operation: &'static str,
    ) -> Result<(usize, RelationshipInfo)> {
        self.fault(identity)?;
        self.fault(member)?;
        self.to_many(identity, relationship)?;
        let (index, rel) = self.relationship_of(identity, relationship)?;
        self.check_target(&rel, member)?;
        self.writable(identity, operation)?;
        Ok((index, rel))
    }

    /// Set a to-one relation and record it. Returns the previous target.
    fn write_to_one(
        &mut self,
        identity: &ObjectIdentity,
        index: usize,
        new: Option<ObjectIdentity>,
    ) -> Option<ObjectIdentity> {
        let object = self.graph.lookup_mut(identity)?;
        let old = object.to_one_target(index);
        if old == new {
            return old;
        }
        object.set_relation(index, Relation::ToOne(Fault::Resolved(new.clone())));
        object.set_state(object.state().after_write());
        let relationship = object.descriptor().relationships()[index].name.to_string();
        self.recorder.record(ChangeEntry::RelationshipEdit {
            identity: identity.clone(),
            relationship,
            change: RelationshipChange::ToOne {
                old: old.clone(),
                new,
            },
        });
        old
    }

    /// Add or remove one collection member and record it. Unresolved
    /// collections are only recorded; resolving them later reconciles with
    /// the members' reverse links. Returns whether anything changed.
    fn write_to_many(&mut self, identity: &ObjectIdentity, index: usize, member: &ObjectIdentity, add: bool) -> bool {
        let Some(object) = self.graph.lookup_mut(identity) else {
            return false;
        };
        if let Relation::ToMany(Fault::Resolved(members)) = object.relation_at(index) {
            if members.contains(member) == add {
                return false;
            }
            let mut members = members.clone();
            if add {
                members.push(member.clone());
            } else {
                members.retain(|m| m != member);
            }
            object.set_relation(index, Relation::ToMany(Fault::Resolved(members)));
        }
        object.set_state(object.state().after_write());
        let relationship = object.descriptor().relationships()[index].name.to_string();
        let (added, removed) = if add {
            (vec![member.clone()], Vec::new())
        } else {
            (Vec::new(), vec![member.clone()])
        };
        self.recorder.record(ChangeEntry::RelationshipEdit {
            identity: identity.clone(),
            relationship,
            change: RelationshipChange::ToMany { added, removed },
        });
        true
    }

    /// Reflect a link change on `other`'s `reverse` relationship, if that
    /// side is loaded and writable.
    fn mirror(&mut self, other: &ObjectIdentity, reverse: &str, source: &ObjectIdentity, linked: bool) {
        let Some(object) = self.graph.lookup(other) else {
            return;
        };
        if !object.state().is_writable() {
            return;
        }
        let Some(index) = object.descriptor().relationship_index(reverse) else {
            return;
        };
        let is_collection = match object.relation_at(index) {
            Relation::ToMany(Fault::Resolved(_)) => true,
            // Join rows are planned from both ends, so an unresolved
            // flattened side still records the link.
            Relation::ToMany(Fault::Unresolved)
                if object.descriptor().relationships()[index].is_flattened() =>
            {
                true
            }
            Relation::ToOne(Fault::Resolved(current)) if linked || current.as_ref() == Some(source) => false,
            _ => return,
        };
        if is_collection {
            self.write_to_many(other, index, source, linked);
        } else {
            self.write_to_one(other, index, linked.then(|| source.clone()));
        }
    }

    /// Drop a NEW object and every recorded trace of it.
    fn purge(&mut self, identity: &ObjectIdentity) {
        self.graph.remove(identity);
        self.graph.drop_references(identity);
        self.recorder.forget(identity);
        self.settle();
    }

    /// MODIFIED objects whose recorded changes all vanished are clean again.
    fn settle(&mut self) {
        let touched: HashSet<ObjectIdentity> = self.recorder.touched().into_iter().collect();
        for object in self.graph.iter_mut() {
            if object.state() == PersistenceState::Modified && !touched.contains(object.identity()) {
                object.set_state(PersistenceState::Committed);
            }
        }
    }

    // ========================================================================
    // Nesting
    // ========================================================================

    /// The identity `identity` is registered under now.
    ///
    /// Temporary identities are replaced by their permanent identity once
    /// this context, or for a child context its parent chain, committed
    /// the object to storage.
    pub fn current_identity(&mut self, identity: &ObjectIdentity) -> Result<ObjectIdentity> {
        if !identity.is_temporary() {
            return Ok(identity.clone());
        }
        self.follow_parent_reindexing()?;
        Ok(self.aliases.get(identity).cloned().unwrap_or_else(|| identity.clone()))
    }

    /// Move objects the parent chain re-indexed since this context last
    /// looked to their permanent identity. Returns how many objects moved.
    pub fn follow_parent_reindexing(&mut self) -> Result<usize> {
        let ContextChannel::Parent(parent) = self.channel.clone() else {
            return Ok(0);
        };
        let temporary: Vec<ObjectIdentity> = self
            .graph
            .identities()
            .filter(|i| i.is_temporary())
            .cloned()
            .collect();
        if temporary.is_empty() {
            return Ok(0);
        }
        let moved: Vec<(ObjectIdentity, ObjectIdentity, Option<DomainObject>)> = {
            let mut parent = lock(&parent);
            parent.follow_parent_reindexing()?;
            temporary
                .into_iter()
                .filter_map(|temporary| {
                    let permanent = parent.aliases.get(&temporary)?.clone();
                    let image = parent.graph.lookup(&permanent).cloned();
                    Some((temporary, permanent, image))
                })
                .collect()
        };
        let count = moved.len();
        for (temporary, permanent, image) in moved {
            // A clean copy fetched under the permanent identity gives way.
            if self.graph.check_reindex(&temporary, &permanent).is_err()
                && !self.graph.require(&permanent)?.state().is_dirty()
            {
                self.graph.remove(&permanent);
            }
            self.graph.reindex(&temporary, &permanent)?;
            self.recorder.rename(&temporary, &permanent);
            if let Some(image) = image {
                self.import(image);
            }
            tracing::trace!(%temporary, %permanent, "Followed parent re-indexing");
            self.aliases.insert(temporary, permanent);
        }
        if count > 0 {
            tracing::debug!(moved = count, "Followed parent re-indexing");
        }
        Ok(count)
    }

    /// Apply a child's diff to this context as local, unflushed edits.
    ///
    /// Everything is loaded and checked before the first edit, so an error
    /// leaves this context's pending changes untouched. Returns the
    /// resulting images of every object the diff names.
    #[tracing::instrument(level = "debug", skip_all, fields(changes = changes.len()))]
    pub(crate) fn merge(&mut self, changes: &ChangeDiff, source: &IdentityGraph) -> Result<Vec<DomainObject>> {
        for change in changes {
            let descriptor = match change.category {
                ChangeCategory::Create => Arc::clone(source.require(&change.identity)?.descriptor()),
                ChangeCategory::Update | ChangeCategory::Delete => {
                    self.fault(&change.identity)?;
                    let object = self.graph.require(&change.identity)?;
                    if object.state() == PersistenceState::Deleted {
                        return Err(Error::InvalidState {
                            identity: change.identity.clone(),
                            state: object.state(),
                            operation: "merge",
                        });
                    }
                    Arc::clone(object.descriptor())
                }
            };
            for delta in &change.attributes {
                descriptor.require_attribute(&delta.attribute)?;
            }
            for delta in &change.relationships {
                descriptor.require_relationship(&delta.relationship)?;
            }
        }

        let mut touched = Vec::with_capacity(changes.len());
        for change in changes {
            let identity = &change.identity;
            match change.category {
                ChangeCategory::Create => {
                    let descriptor = Arc::clone(source.require(identity)?.descriptor());
                    let mut object = DomainObject::new(identity.clone(), descriptor);
                    let mut attributes = Vec::with_capacity(change.attributes.len());
                    for delta in &change.attributes {
                        let index = object.descriptor().require_attribute(&delta.attribute)?;
                        object.set_value(index, delta.new.clone());
                        attributes.push((delta.attribute.clone(), delta.new.clone()));
                    }
                    self.graph.register(object);
                    self.recorder.record(ChangeEntry::Create {
                        identity: identity.clone(),
                        attributes,
                    });
                }
                ChangeCategory::Update => {
                    for delta in &change.attributes {
                        self.write_attribute(identity, &delta.attribute, delta.new.clone())?;
                    }
                }
                ChangeCategory::Delete => {
                    let state = self.graph.require(identity)?.state();
                    if state == PersistenceState::New {
                        self.purge(identity);
                    } else {
                        self.graph.require_mut(identity)?.set_state(PersistenceState::Deleted);
                        self.recorder.record(ChangeEntry::Delete {
                            identity: identity.clone(),
                            prior_state: state,
                        });
                    }
                    touched.push(identity.clone());
                    continue;
                }
            }
            for delta in &change.relationships {
                let (index, _) = self.relationship_of(identity, &delta.relationship)?;
                match &delta.change {
                    RelationshipChange::ToOne { new, .. } => {
                        self.write_to_one(identity, index, new.clone());
                    }
                    RelationshipChange::ToMany { added, removed } => {
                        for member in removed {
                            self.write_to_many(identity, index, member, false);
                        }
                        for member in added {
                            self.write_to_many(identity, index, member, true);
                        }
                    }
                }
            }
            touched.push(identity.clone());
        }
        tracing::debug!(merged = touched.len(), pending = self.recorder.len(), "Merged child changes");
        Ok(touched
            .iter()
            .filter_map(|identity| self.graph.lookup(identity).cloned())
            .collect())
    }

    /// Re-read clean objects from this context's channel. Objects that no
    /// longer exist are removed. Returns how many objects were refreshed.
    pub fn refresh(&mut self, identities: &[ObjectIdentity]) -> Result<usize> {
        self.follow_parent_reindexing()?;
        let mut refreshed = 0;
        let identities: Vec<ObjectIdentity> = identities
            .iter()
            .map(|i| self.aliases.get(i).cloned().unwrap_or_else(|| i.clone()))
            .collect();
        for identity in &identities {
            let clean = self
                .graph
                .lookup(identity)
                .is_some_and(|o| !o.state().is_dirty());
            if !clean {
                continue;
            }
            let found = match self.channel.clone() {
                ContextChannel::Parent(parent) => {
                    let image = match lock(&parent).object(identity) {
                        Ok(object) => Some(object.clone()),
                        Err(Error::ObjectNotFound(_)) => None,
                        Err(error) => return Err(error),
                    };
                    match image.filter(|i| i.state() != PersistenceState::Deleted) {
                        Some(image) => {
                            self.import(image);
                            true
                        }
                        None => false,
                    }
                }
                ContextChannel::Storage { executor, snapshots } => {
                    match fetch_by_key(executor.as_ref(), identity)? {
                        Some(row) => {
                            let descriptor =
                                self.domain.registry().resolve_variant(identity.entity(), &row)?;
                            let object = self.graph.require_mut(identity)?;
                            object.set_descriptor(descriptor);
                            object.load_row(row.clone());
                            object.invalidate_collections();
                            self.publish_rows(&snapshots, vec![(identity.clone(), row)]);
                            true
                        }
                        None => false,
                    }
                }
            };
            if found {
                refreshed += 1;
            } else {
                self.graph.remove(identity);
                self.graph.drop_references(identity);
            }
        }
        tracing::debug!(refreshed, requested = identities.len(), "Refreshed objects");
        Ok(refreshed)
    }

    /// Refresh every clean object.
    pub fn refresh_all(&mut self) -> Result<usize> {
        let clean: Vec<ObjectIdentity> = self
            .graph
            .iter()
            .filter(|o| !o.state().is_dirty())
            .map(|o| o.identity().clone())
            .collect();
        self.refresh(&clean)
    }

    // ========================================================================
    // Sibling Events
    // ========================================================================

    /// Merge queued snapshot events from other contexts into live objects.
    /// Returns how many events were processed.
    pub fn process_snapshot_events(&mut self) -> usize {
        let Some(inbox) = &self.inbox else {
            return 0;
        };
        let events = inbox.drain();
        let count = events.len();
        for event in events {
            self.apply_snapshot_event(&event);
        }
        if count > 0 {
            tracing::debug!(events = count, "Processed snapshot events");
        }
        count
    }

    fn apply_snapshot_event(&mut self, event: &SnapshotEvent) {
        if event.source.is_some() && event.source == self.subscriber {
            return;
        }
        match event.kind {
            SnapshotEventKind::Invalidated => {
                for object in self.graph.iter_mut() {
                    let listed = event.invalidate_all || event.invalidated.contains(object.identity());
                    if listed && object.state() == PersistenceState::Committed {
                        object.unload();
                    }
                }
            }
            SnapshotEventKind::Changed => {
                for (identity, row) in &event.changed {
                    self.merge_external_row(identity, row);
                }
                for identity in &event.deleted {
                    self.merge_external_delete(identity);
                }
            }
        }
        for identity in &event.indirectly_modified {
            if let Some(object) = self.graph.lookup_mut(identity) {
                if !object.state().is_dirty() {
                    object.invalidate_collections();
                }
            }
        }
    }

    fn merge_external_row(&mut self, identity: &ObjectIdentity, row: &RowSnapshot) {
        let Some(object) = self.graph.lookup_mut(identity) else {
            return;
        };
        match object.state() {
            PersistenceState::Committed => {
                if object.snapshot() == Some(row) {
                    return;
                }
                if let Ok(descriptor) = self.domain.registry().resolve_variant(identity.entity(), row) {
                    object.set_descriptor(descriptor);
                }
                object.load_row(row.clone());
            }
            PersistenceState::Modified | PersistenceState::Deleted => {
                let base = object.snapshot().cloned().unwrap_or_default();
                let local = object.to_row().changed_columns(&base);
                let external: Vec<String> = base
                    .changed_columns(row)
                    .into_iter()
                    .filter(|c| !local.contains(c))
                    .collect();
                if !external.is_empty() {
                    object.merge_columns(row, &external);
                }
            }
            _ => {}
        }
    }

    fn merge_external_delete(&mut self, identity: &ObjectIdentity) {
        let Some(object) = self.graph.lookup_mut(identity) else {
            return;
        };
        match object.state() {
            PersistenceState::Committed | PersistenceState::Hollow | PersistenceState::Deleted => {
                self.graph.remove(identity);
                self.graph.drop_references(identity);
                self.recorder.forget(identity);
                self.settle();
            }
            PersistenceState::Modified => {
                // The row is gone but local edits survive: insert it again.
                object.set_state(PersistenceState::New);
                object.set_snapshot(None);
                let attributes = object
                    .descriptor()
                    .attributes()
                    .iter()
                    .zip(object.values())
                    .filter(|(_, value)| !value.is_null())
                    .map(|(attribute, value)| (attribute.name.to_string(), value.clone()))
                    .collect();
                self.recorder.record(ChangeEntry::Create {
                    identity: identity.clone(),
                    attributes,
                });
                tracing::debug!(%identity, "Row deleted externally; modified object will be inserted again");
            }
            _ => {}
        }
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Keep an object from being swept.
    pub fn retain(&mut self, identity: &ObjectIdentity) -> Result<ObjectHandle> {
        self.graph.retain(identity)
    }

    /// Remove clean objects nobody holds a handle to.
    pub fn sweep(&mut self) -> usize {
        self.graph.sweep()
    }
}

fn wrong_cardinality(expected: &'static str, entity: &str, rel: &RelationshipInfo) -> Error {
    Error::Type {
        expected,
        actual: format!("{entity}.{}", rel.name),
    }
}

/// The stored row for a permanent identity.
fn fetch_by_key(executor: &dyn StorageExecutor, identity: &ObjectIdentity) -> Result<Option<RowSnapshot>> {
    let Some(key) = identity.key() else {
        return Ok(None);
    };
    let qualifier = Qualifier::KeysIn {
        columns: key.iter().map(|(c, _)| c.clone()).collect(),
        tuples: vec![key.iter().map(|(_, v)| v.clone()).collect()],
    };
    let query = QueryDescriptor::new(identity.entity()).qualifier(qualifier);
    Ok(executor.fetch(&query)?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::{AttributeInfo, EntityInfo};
    use rowgraph_memory::MemoryStorage;

    static ARTIST: EntityInfo = EntityInfo::new("Artist", &["id"])
        .attributes(&[AttributeInfo::new("name")])
        .relationships(&[RelationshipInfo::to_many("paintings", "Painting", &[("id", "artist_id")])
            .reverse("artist")]);
    static PAINTING: EntityInfo = EntityInfo::new("Painting", &["id"])
        .attributes(&[AttributeInfo::new("title")])
        .relationships(&[
            RelationshipInfo::to_one("artist", "Artist", &[("artist_id", "id")]).reverse("paintings"),
        ]);

    fn row(pairs: &[(&str, Value)]) -> RowSnapshot {
        RowSnapshot::new(pairs.iter().cloned())
    }

    fn setup() -> (Arc<MemoryStorage>, Domain) {
        let storage = Arc::new(MemoryStorage::new());
        storage.define_table("Artist", &["id"], true);
        storage.define_table("Painting", &["id"], true);
        storage
            .seed(
                "Artist",
                [
                    row(&[("id", Value::BigInt(1)), ("name", Value::from("Monet"))]),
                    row(&[("id", Value::BigInt(2)), ("name", Value::from("Dali"))]),
                ],
            )
            .unwrap();
        storage
            .seed(
                "Painting",
                [row(&[
                    ("id", Value::BigInt(10)),
                    ("title", Value::from("Irises")),
                    ("artist_id", Value::BigInt(1)),
                ])],
            )
            .unwrap();
        let domain = Domain::builder(storage.clone())
            .entities(&[&ARTIST, &PAINTING])
            .build()
            .unwrap();
        (storage, domain)
    }

    fn artist(n: i64) -> ObjectIdentity {
        ObjectIdentity::single("Artist", "id", n)
    }

    fn painting(n: i64) -> ObjectIdentity {
        ObjectIdentity::single("Painting", "id", n)
    }

    #[test]
    fn test_fault_uses_snapshot_store_after_first_fetch() {
        let (storage, domain) = setup();
        let mut first = domain.new_context();
        assert_eq!(first.object(&artist(1)).unwrap().get("name").unwrap(), &Value::from("Monet"));
        assert_eq!(storage.fetch_count(), 1);

        let mut second = domain.new_context();
        second.object(&artist(1)).unwrap();
        assert_eq!(storage.fetch_count(), 1);
    }

    #[test]
    fn test_missing_row_is_not_found() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        assert!(matches!(context.object(&artist(99)), Err(Error::ObjectNotFound(_))));
    }

    #[test]
    fn test_set_attribute_records_and_marks_modified() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        context.set_attribute(&artist(1), "name", "Claude").unwrap();
        assert_eq!(context.lookup(&artist(1)).unwrap().state(), PersistenceState::Modified);
        assert_eq!(context.recorder().len(), 1);

        context.set_attribute(&artist(1), "name", "Claude").unwrap();
        assert_eq!(context.recorder().len(), 1);
        assert!(matches!(
            context.set_attribute(&artist(1), "nope", 1_i64),
            Err(Error::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn test_set_to_one_updates_resolved_reverse_collections() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        assert_eq!(context.to_many(&artist(1), "paintings").unwrap(), vec![painting(10)]);
        assert_eq!(context.to_many(&artist(2), "paintings").unwrap(), Vec::<ObjectIdentity>::new());

        context.set_to_one(&painting(10), "artist", Some(&artist(2))).unwrap();
        assert!(context.to_many(&artist(1), "paintings").unwrap().is_empty());
        assert_eq!(context.to_many(&artist(2), "paintings").unwrap(), vec![painting(10)]);

        let diff = context.changes();
        assert_eq!(diff.len(), 3);
        assert_eq!(
            diff.get(&painting(10)).unwrap().relationship("artist"),
            Some(&RelationshipChange::ToOne {
                old: Some(artist(1)),
                new: Some(artist(2)),
            })
        );
    }

    #[test]
    fn test_set_to_one_rejects_wrong_entity() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        let err = context.set_to_one(&painting(10), "artist", Some(&painting(10))).unwrap_err();
        assert!(matches!(err, Error::Type { expected: "Artist", .. }));
    }

    #[test]
    fn test_add_to_many_moves_member_between_owners() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        context.to_many(&artist(1), "paintings").unwrap();
        context.add_to_many(&artist(2), "paintings", &painting(10)).unwrap();

        assert_eq!(context.to_one(&painting(10), "artist").unwrap(), Some(artist(2)));
        assert!(context.to_many(&artist(1), "paintings").unwrap().is_empty());
    }

    #[test]
    fn test_unresolved_collection_sees_unsaved_members() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        let new_painting = context.create("Painting").unwrap();
        context.set_to_one(&new_painting, "artist", Some(&artist(1))).unwrap();

        let members = context.to_many(&artist(1), "paintings").unwrap();
        assert_eq!(members, vec![painting(10), new_painting]);
    }

    #[test]
    fn test_delete_new_object_leaves_no_trace() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        context.to_many(&artist(1), "paintings").unwrap();
        let new_painting = context.create("Painting").unwrap();
        context.add_to_many(&artist(1), "paintings", &new_painting).unwrap();
        assert_eq!(context.lookup(&artist(1)).unwrap().state(), PersistenceState::Modified);

        context.delete(&new_painting).unwrap();
        assert!(context.lookup(&new_painting).is_none());
        assert!(context.changes().is_empty());
        assert_eq!(context.lookup(&artist(1)).unwrap().state(), PersistenceState::Committed);
        assert_eq!(context.to_many(&artist(1), "paintings").unwrap(), vec![painting(10)]);
    }

    #[test]
    fn test_invalid_state_transitions() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        context.delete(&artist(2)).unwrap();
        context.delete(&artist(2)).unwrap();
        assert!(matches!(
            context.set_attribute(&artist(2), "name", "x"),
            Err(Error::InvalidState {
                state: PersistenceState::Deleted,
                ..
            })
        ));
        assert!(matches!(
            context.delete(&ObjectIdentity::temporary("Artist")),
            Err(Error::InvalidState {
                state: PersistenceState::Transient,
                ..
            })
        ));
    }

    #[test]
    fn test_rollback_restores_everything_and_is_idempotent() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        context.to_many(&artist(2), "paintings").unwrap();
        context.set_attribute(&artist(1), "name", "Claude").unwrap();
        context.set_to_one(&painting(10), "artist", Some(&artist(2))).unwrap();
        let created = context.create("Artist").unwrap();
        context.delete(&artist(2)).unwrap();

        context.rollback().unwrap();
        let after_first: Vec<(ObjectIdentity, PersistenceState)> = {
            let mut v: Vec<_> = context.graph().iter().map(|o| (o.identity().clone(), o.state())).collect();
            v.sort_by_key(|(id, _)| id.to_string());
            v
        };
        context.rollback().unwrap();
        let mut after_second: Vec<_> = context.graph().iter().map(|o| (o.identity().clone(), o.state())).collect();
        after_second.sort_by_key(|(id, _)| id.to_string());

        assert_eq!(after_first, after_second);
        assert!(context.lookup(&created).is_none());
        assert_eq!(context.lookup(&artist(1)).unwrap().get("name").unwrap(), &Value::from("Monet"));
        assert_eq!(context.lookup(&artist(2)).unwrap().state(), PersistenceState::Committed);
        assert_eq!(context.to_one(&painting(10), "artist").unwrap(), Some(artist(1)));
        assert!(context.to_many(&artist(2), "paintings").unwrap().is_empty());
        assert!(!context.has_changes());
    }

    #[test]
    fn test_after_rollback_hook_can_fail() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        context.on_after_rollback(|| Err(Error::Callback("rollback observed".into())));
        assert!(matches!(context.rollback(), Err(Error::Callback(_))));
    }

    #[test]
    fn test_faults_are_counted_per_relationship() {
        let (_, domain) = setup();
        let mut context = domain.new_context();
        context.to_many(&artist(1), "paintings").unwrap();
        context.to_many(&artist(2), "paintings").unwrap();
        context.to_many(&artist(1), "paintings").unwrap();
        let stats = context.fault_stats();
        assert_eq!(stats.total_faults, 2);
        assert_eq!(stats.relationships_faulted, 1);
    }

    #[test]
    fn test_child_reads_through_parent() {
        let (storage, domain) = setup();
        let parent = domain.shared_context();
        let mut child = ObjectContext::new_child(&parent);
        assert!(child.is_child());
        assert!(child.subscriber_id().is_none());

        child.select(&SelectQuery::new("Artist")).unwrap();
        assert_eq!(storage.fetch_count(), 1);
        assert_eq!(lock(&parent).graph().len(), 2);
        assert_eq!(child.lookup(&artist(1)).unwrap().state(), PersistenceState::Committed);
    }

    #[test]
    fn test_sibling_change_merges_into_modified_object() {
        let (_, domain) = setup();
        let mut writer = domain.new_context();
        let mut reader = domain.new_context();
        writer.object(&painting(10)).unwrap();
        reader.object(&painting(10)).unwrap();
        reader.process_snapshot_events();
        reader.set_attribute(&painting(10), "title", "Local title").unwrap();

        writer.set_to_one(&painting(10), "artist", Some(&artist(2))).unwrap();
        writer.commit().unwrap();
        // The writer's fetch of the new artist, then its commit.
        assert_eq!(reader.process_snapshot_events(), 2);

        let merged = reader.lookup(&painting(10)).unwrap();
        assert_eq!(merged.state(), PersistenceState::Modified);
        assert_eq!(merged.get("title").unwrap(), &Value::from("Local title"));
        assert_eq!(merged.relation("artist").unwrap().targets(), vec![artist(2)]);
    }
}
