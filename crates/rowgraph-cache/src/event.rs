//! Snapshot change events and listeners.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rowgraph_core::{ObjectIdentity, RowSnapshot};

/// Handle returned by [`SnapshotStore::subscribe`](crate::SnapshotStore::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotEventKind {
    /// Rows changed or were deleted by a commit or a refreshing fetch.
    Changed,
    /// Cached rows were dropped; subscribers should re-fault instead of merging.
    Invalidated,
}

/// Change notification published by the snapshot store.
#[derive(Debug, Clone)]
pub struct SnapshotEvent {
    pub kind: SnapshotEventKind,
    /// Subscriber whose batch produced this event, if any.
    pub source: Option<SubscriberId>,
    pub changed: HashMap<ObjectIdentity, RowSnapshot>,
    pub deleted: HashSet<ObjectIdentity>,
    pub invalidated: HashSet<ObjectIdentity>,
    /// Objects whose to-many collections changed through a related row.
    pub indirectly_modified: HashSet<ObjectIdentity>,
    /// Every cached row was dropped.
    pub invalidate_all: bool,
}

impl SnapshotEvent {
    pub(crate) fn changed(source: Option<SubscriberId>) -> Self {
        Self {
            kind: SnapshotEventKind::Changed,
            source,
            changed: HashMap::new(),
            deleted: HashSet::new(),
            invalidated: HashSet::new(),
            indirectly_modified: HashSet::new(),
            invalidate_all: false,
        }
    }

    pub(crate) fn invalidated(ids: HashSet<ObjectIdentity>, all: bool) -> Self {
        Self {
            kind: SnapshotEventKind::Invalidated,
            invalidated: ids,
            invalidate_all: all,
            ..Self::changed(None)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
            && self.deleted.is_empty()
            && self.invalidated.is_empty()
            && self.indirectly_modified.is_empty()
            && !self.invalidate_all
    }
}

/// Receives snapshot events.
///
/// Listeners run synchronously on the publishing thread, outside the store's
/// data lock. Subscribing or unsubscribing from inside a callback is allowed
/// and takes effect from the next publish.
pub trait SnapshotListener: Send + Sync {
    fn on_snapshot_event(&self, event: &Arc<SnapshotEvent>);
}

impl<F> SnapshotListener for F
where
    F: Fn(&Arc<SnapshotEvent>) + Send + Sync,
{
    fn on_snapshot_event(&self, event: &Arc<SnapshotEvent>) {
        self(event);
    }
}

/// Listener that queues events for a consumer to drain on its own thread.
#[derive(Debug, Default)]
pub struct EventInbox {
    queue: Mutex<VecDeque<Arc<SnapshotEvent>>>,
}

impl EventInbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take all queued events, oldest first.
    pub fn drain(&self) -> Vec<Arc<SnapshotEvent>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotListener for EventInbox {
    fn on_snapshot_event(&self, event: &Arc<SnapshotEvent>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Arc::clone(event));
    }
}

/// Changes to apply in one [`SnapshotStore::put_batch`](crate::SnapshotStore::put_batch) call.
#[derive(Debug, Clone, Default)]
pub struct SnapshotBatch {
    pub(crate) changed: Vec<(ObjectIdentity, RowSnapshot)>,
    pub(crate) deleted: HashSet<ObjectIdentity>,
    pub(crate) indirectly_modified: HashSet<ObjectIdentity>,
}

impl SnapshotBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a snapshot. Later entries for the same identity win.
    pub fn changed(mut self, id: ObjectIdentity, snapshot: RowSnapshot) -> Self {
        self.changed.push((id, snapshot));
        self
    }

    pub fn deleted(mut self, id: ObjectIdentity) -> Self {
        self.deleted.insert(id);
        self
    }

    pub fn indirectly_modified(mut self, id: ObjectIdentity) -> Self {
        self.indirectly_modified.insert(id);
        self
    }

    pub fn push_changed(&mut self, id: ObjectIdentity, snapshot: RowSnapshot) {
        self.changed.push((id, snapshot));
    }

    pub fn push_deleted(&mut self, id: ObjectIdentity) {
        self.deleted.insert(id);
    }

    pub fn push_indirectly_modified(&mut self, id: ObjectIdentity) {
        self.indirectly_modified.insert(id);
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty() && self.indirectly_modified.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changed.len() + self.deleted.len()
    }
}

impl FromIterator<(ObjectIdentity, RowSnapshot)> for SnapshotBatch {
    fn from_iter<T: IntoIterator<Item = (ObjectIdentity, RowSnapshot)>>(iter: T) -> Self {
        Self {
            changed: iter.into_iter().collect(),
            ..Self::default()
        }
    }
}
