//! Commit coordination for object contexts.
//!
//! # Role In The Architecture
//!
//! A commit moves a context's pending changes one level down: into storage
//! for a top-level context, into the parent's graph for a child context.
//! It always runs the same phases:
//!
//! ```text
//! IDLE → VALIDATING → ORDERING → APPLYING → COMMITTED
//!             │            │          │
//!             └────────────┴──────────┴──→ FAILED
//! ```
//!
//! Failures before APPLYING leave the context exactly as it was. A storage
//! failure during APPLYING is rolled back by the executor and also leaves
//! the context untouched, so the caller can fix the cause and retry or call
//! [`ObjectContext::rollback`].
//!
//! [`ObjectContext::prepare_commit`] stops after ORDERING and hands back a
//! [`PreparedCommit`] to inspect the planned rows before applying them.

use std::collections::HashMap;

use rowgraph_cache::{SnapshotBatch, SnapshotStore};
use rowgraph_core::{
    DiffOp, Error, GeneratedKeys, ObjectIdentity, OrderedDiff, PersistenceState, Result, RowSnapshot,
    StorageError, StorageErrorKind, StorageExecutor,
};

use crate::change_recorder::{ChangeCategory, ChangeDiff};
use crate::context::{ContextChannel, ContextEvent, ObjectContext, SharedContext, lock};
use crate::flush::{CommitPlan, FlushPlanner};
use crate::lifecycle::LifecycleEvent;
use crate::validation::validate_object;

/// Phase of the most recent commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPhase {
    #[default]
    Idle,
    Validating,
    Ordering,
    Applying,
    Committed,
    Failed,
}

/// What a successful commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Identities of inserted objects, permanent where storage assigned keys.
    pub inserted: Vec<ObjectIdentity>,
    pub updated: Vec<ObjectIdentity>,
    pub deleted: Vec<ObjectIdentity>,
    /// `(temporary, permanent)` pairs re-indexed after insert.
    pub reindexed: Vec<(ObjectIdentity, ObjectIdentity)>,
}

impl CommitOutcome {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// The permanent identity a temporary one was re-indexed to.
    pub fn permanent_identity(&self, temporary: &ObjectIdentity) -> Option<&ObjectIdentity> {
        self.reindexed
            .iter()
            .find(|(t, _)| t == temporary)
            .map(|(_, p)| p)
    }
}

/// A commit that passed VALIDATING and ORDERING but has not touched
/// storage or the parent yet. Dropping it abandons the commit; pending
/// changes stay in the context.
pub struct PreparedCommit<'a> {
    context: &'a mut ObjectContext,
    changes: ChangeDiff,
    plan: Option<CommitPlan>,
}

impl std::fmt::Debug for PreparedCommit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedCommit")
            .field("changes", &self.changes.len())
            .field("operations", &self.plan.as_ref().map(|p| p.ordered_diff().len()))
            .finish()
    }
}

impl PreparedCommit<'_> {
    /// Net changes being committed.
    pub fn changes(&self) -> &ChangeDiff {
        &self.changes
    }

    /// Planned row operations. `None` for child contexts, which commit into
    /// their parent instead of storage.
    pub fn plan(&self) -> Option<&CommitPlan> {
        self.plan.as_ref()
    }

    /// Run APPLYING and finish the commit.
    pub fn apply(self) -> Result<CommitOutcome> {
        let PreparedCommit {
            context,
            changes,
            plan,
        } = self;
        context.phase = CommitPhase::Applying;
        let result = match context.channel.clone() {
            ContextChannel::Storage { executor, snapshots } => context.apply_to_storage(
                plan.unwrap_or_default(),
                executor.as_ref(),
                &snapshots,
            ),
            ContextChannel::Parent(parent) => context.apply_to_parent(&changes, &parent),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                context.phase = CommitPhase::Failed;
                tracing::warn!(error = %error, "Commit failed while applying");
                return Err(error);
            }
        };
        context.phase = CommitPhase::Committed;
        tracing::info!(
            inserted = outcome.inserted.len(),
            updated = outcome.updated.len(),
            deleted = outcome.deleted.len(),
            "Commit complete"
        );
        context.events.fire(ContextEvent::AfterCommit)?;
        Ok(outcome)
    }
}

impl ObjectContext {
    /// Commit every pending change.
    pub fn commit(&mut self) -> Result<CommitOutcome> {
        self.prepare_commit()?.apply()
    }

    /// Run VALIDATING and ORDERING without applying anything.
    #[tracing::instrument(level = "debug", skip(self), fields(pending = self.recorder.len()))]
    pub fn prepare_commit(&mut self) -> Result<PreparedCommit<'_>> {
        self.phase = CommitPhase::Idle;
        self.follow_parent_reindexing()?;
        self.events.fire(ContextEvent::BeforeCommit)?;
        let changes = self.recorder.diff();

        self.phase = CommitPhase::Validating;
        if let Err(error) = self.validate_pending(&changes) {
            self.phase = CommitPhase::Failed;
            return Err(error);
        }

        self.phase = CommitPhase::Ordering;
        let planned = match &self.channel {
            ContextChannel::Storage { executor, .. } => Some(
                FlushPlanner::new(&self.graph, self.domain.registry(), executor.as_ref()).plan(&changes),
            ),
            ContextChannel::Parent(_) => None,
        };
        let plan = match planned.transpose() {
            Ok(plan) => plan,
            Err(error) => {
                self.phase = CommitPhase::Failed;
                return Err(error);
            }
        };
        if let Some(plan) = &plan {
            let callbacks = self.domain.callbacks();
            let fired = plan
                .cascaded
                .iter()
                .try_for_each(|object| callbacks.fire(LifecycleEvent::PreRemove, object));
            if let Err(error) = fired {
                self.phase = CommitPhase::Failed;
                return Err(error);
            }
        }
        Ok(PreparedCommit {
            context: self,
            changes,
            plan,
        })
    }

    /// Fire PRE_PERSIST / PRE_UPDATE and run validation hooks.
    fn validate_pending(&self, changes: &ChangeDiff) -> Result<()> {
        let callbacks = self.domain.callbacks();
        let validate = self.domain.config().validate_on_commit;
        for change in changes {
            let event = match change.category {
                ChangeCategory::Create => LifecycleEvent::PrePersist,
                ChangeCategory::Update => LifecycleEvent::PreUpdate,
                ChangeCategory::Delete => continue,
            };
            let object = self.graph.require(&change.identity)?;
            callbacks.fire(event, object)?;
            if validate {
                validate_object(self.domain.validators(), object)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Storage
    // ========================================================================

    fn apply_to_storage(
        &mut self,
        plan: CommitPlan,
        executor: &dyn StorageExecutor,
        snapshots: &SnapshotStore,
    ) -> Result<CommitOutcome> {
        let (inserts, updates, deletes) = plan.diff.counts();
        tracing::debug!(inserts, updates, deletes, "Applying ordered diff");
        let keys = if plan.diff.is_empty() {
            GeneratedKeys::new()
        } else {
            executor
                .execute(&plan.diff)
                .map_err(|e| storage_failure(e, &plan.diff))?
        };

        // Everything below is computed before the graph changes.
        let mut reindexed = Vec::new();
        for identity in plan.inserted.iter().filter(|i| i.is_temporary()) {
            let permanent = keys.permanent_identity(identity).ok_or_else(|| {
                Error::Storage(StorageError::backend(format!("storage returned no key for {identity}")))
            })?;
            self.graph.check_reindex(identity, &permanent)?;
            reindexed.push((identity.clone(), permanent));
        }
        let mut images: Vec<(ObjectIdentity, RowSnapshot)> = Vec::new();
        for op in plan.diff.iter() {
            let Some(object) = self.graph.lookup(op.identity()) else {
                continue;
            };
            let image = match op {
                DiffOp::Insert { identity, .. } => {
                    let key = RowSnapshot::new(keys.get(identity).unwrap_or_default().iter().cloned());
                    object.to_row().merged(&op.resolved_values(&keys)?).merged(&key)
                }
                DiffOp::Update { .. } => object
                    .snapshot()
                    .cloned()
                    .unwrap_or_default()
                    .merged(&object.to_row())
                    .merged(&op.resolved_values(&keys)?),
                DiffOp::Delete { .. } => continue,
            };
            images.push((op.identity().clone(), image));
        }

        let renamed: HashMap<ObjectIdentity, ObjectIdentity> = reindexed.iter().cloned().collect();
        let permanent = |identity: &ObjectIdentity| -> ObjectIdentity {
            renamed.get(identity).cloned().unwrap_or_else(|| identity.clone())
        };

        let mut batch = SnapshotBatch::new();
        for (identity, image) in images {
            let object = self.graph.require_mut(&identity)?;
            object.set_snapshot(Some(image.clone()));
            object.set_state(PersistenceState::Committed);
            batch.push_changed(permanent(&identity), image);
        }
        for (temporary, permanent) in &reindexed {
            self.graph.reindex(temporary, permanent)?;
        }
        self.aliases.extend(reindexed.iter().cloned());
        for object in self.graph.iter_mut() {
            if object.state() == PersistenceState::Modified {
                object.set_state(PersistenceState::Committed);
            }
        }

        let mut removed = Vec::new();
        for identity in plan.deleted.iter().chain(&plan.discarded) {
            if let Some(object) = self.graph.remove(identity) {
                self.graph.drop_references(identity);
                removed.push(object);
            }
            if !identity.is_temporary() {
                batch.push_deleted(identity.clone());
            }
        }
        for (identity, image) in plan.external {
            batch.push_changed(identity, image);
        }
        for identity in &plan.indirectly_modified {
            batch.push_indirectly_modified(permanent(identity));
        }
        snapshots.put_batch(batch, self.subscriber);
        self.recorder.clear();

        let outcome = CommitOutcome {
            inserted: plan.inserted.iter().map(&permanent).collect(),
            updated: plan.updated,
            deleted: plan.deleted,
            reindexed,
        };
        let callbacks = self.domain.callbacks();
        for identity in &outcome.inserted {
            if let Some(object) = self.graph.lookup(identity) {
                callbacks.fire(LifecycleEvent::PostPersist, object)?;
            }
        }
        for identity in &outcome.updated {
            if let Some(object) = self.graph.lookup(identity) {
                callbacks.fire(LifecycleEvent::PostUpdate, object)?;
            }
        }
        for object in &removed {
            callbacks.fire(LifecycleEvent::PostRemove, object)?;
        }
        Ok(outcome)
    }

    // ========================================================================
    // Parent
    // ========================================================================

    fn apply_to_parent(&mut self, changes: &ChangeDiff, parent: &SharedContext) -> Result<CommitOutcome> {
        let images = lock(parent).merge(changes, &self.graph)?;

        for mut image in images {
            if image.state() == PersistenceState::Deleted {
                continue;
            }
            let row = image.to_row();
            image.set_snapshot(Some(row));
            image.set_state(PersistenceState::Committed);
            self.graph.register(image);
        }
        let mut outcome = CommitOutcome::default();
        for change in changes {
            match change.category {
                ChangeCategory::Create => outcome.inserted.push(change.identity.clone()),
                ChangeCategory::Update => outcome.updated.push(change.identity.clone()),
                ChangeCategory::Delete => {
                    self.graph.remove(&change.identity);
                    self.graph.drop_references(&change.identity);
                    outcome.deleted.push(change.identity.clone());
                }
            }
        }
        for object in self.graph.iter_mut() {
            if object.state() == PersistenceState::Modified {
                object.set_state(PersistenceState::Committed);
            }
        }
        self.recorder.clear();
        Ok(outcome)
    }
}

/// A row-count mismatch on a locked operation means another writer got
/// there first.
fn storage_failure(error: StorageError, diff: &OrderedDiff) -> Error {
    if let StorageErrorKind::RowCountMismatch { identity, .. } = &error.kind {
        let locked = diff.iter().any(|op| {
            op.identity() == identity
                && matches!(
                    op,
                    DiffOp::Update { expected: Some(_), .. } | DiffOp::Delete { expected: Some(_), .. }
                )
        });
        if locked {
            tracing::debug!(%identity, "Optimistic lock failed");
            return Error::OptimisticLockFailure {
                identity: identity.clone(),
            };
        }
    }
    Error::Storage(error)
}
