//! The shared snapshot store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rowgraph_core::{ObjectIdentity, Result, RowSnapshot};

use crate::config::SnapshotStoreConfig;
use crate::event::{SnapshotBatch, SnapshotEvent, SnapshotListener, SubscriberId};
use crate::lru::LruIndex;

struct Subscriber {
    id: SubscriberId,
    listener: Arc<dyn SnapshotListener>,
}

/// Counters exposed by [`SnapshotStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStoreStats {
    pub size: usize,
    pub capacity: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub events_published: u64,
    pub subscribers: usize,
}

/// Process-wide cache of row snapshots keyed by object identity.
///
/// All data access goes through one mutex, so every [`put_batch`] is atomic
/// with respect to [`get`] and [`get_many`]. Events are published after the
/// mutex is released, to a copy-on-write snapshot of the subscriber list.
///
/// [`put_batch`]: SnapshotStore::put_batch
/// [`get`]: SnapshotStore::get
/// [`get_many`]: SnapshotStore::get_many
pub struct SnapshotStore {
    name: String,
    capacity: Option<usize>,
    data: Mutex<LruIndex>,
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    next_subscriber: AtomicU64,
    next_version: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    events_published: AtomicU64,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("size", &self.len())
            .finish_non_exhaustive()
    }
}

impl SnapshotStore {
    pub fn new(config: SnapshotStoreConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(name = %config.name, capacity = ?config.capacity, "Creating snapshot store");
        Ok(Self::from_valid(config))
    }

    /// Unbounded store with default settings.
    pub fn unbounded() -> Self {
        Self::from_valid(SnapshotStoreConfig::default())
    }

    /// Store holding at most `capacity` snapshots (at least one).
    pub fn bounded(capacity: usize) -> Self {
        Self::from_valid(SnapshotStoreConfig::bounded(capacity.max(1)))
    }

    fn from_valid(config: SnapshotStoreConfig) -> Self {
        Self {
            name: config.name,
            capacity: config.capacity,
            data: Mutex::new(LruIndex::default()),
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_subscriber: AtomicU64::new(1),
            next_version: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn data(&self) -> MutexGuard<'_, LruIndex> {
        // Every mutation of the index completes before the guard drops.
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Cached snapshot for `id`. Counts as an access for LRU ordering.
    pub fn get(&self, id: &ObjectIdentity) -> Option<RowSnapshot> {
        let found = self.data().get(id).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Several snapshots read under one lock acquisition.
    pub fn get_many(&self, ids: &[ObjectIdentity]) -> Vec<Option<RowSnapshot>> {
        let mut data = self.data();
        ids.iter().map(|id| data.get(id).cloned()).collect()
    }

    /// Cached snapshot without touching LRU order or counters.
    pub fn peek(&self, id: &ObjectIdentity) -> Option<RowSnapshot> {
        self.data().peek(id).cloned()
    }

    pub fn contains(&self, id: &ObjectIdentity) -> bool {
        self.data().contains(id)
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SnapshotStoreStats {
        SnapshotStoreStats {
            size: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            subscribers: self.subscriber_list().len(),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Atomically apply a batch and publish one event to every subscriber
    /// except `source`.
    ///
    /// Deletions are applied first, then changed snapshots (each stamped with
    /// a fresh version), then eviction down to capacity. Snapshots equal to
    /// the cached ones keep their version, count as an access and are left
    /// out of the event. Returns the published event, or `None` when nothing
    /// changed.
    #[tracing::instrument(level = "debug", skip(self, batch), fields(store = %self.name))]
    pub fn put_batch(
        &self,
        batch: SnapshotBatch,
        source: Option<SubscriberId>,
    ) -> Option<Arc<SnapshotEvent>> {
        if batch.is_empty() {
            tracing::debug!("Empty snapshot batch ignored");
            return None;
        }

        let SnapshotBatch {
            changed,
            deleted,
            indirectly_modified,
        } = batch;
        let mut event = SnapshotEvent::changed(source);
        let mut evicted = 0_u64;
        {
            let mut data = self.data();
            for id in &deleted {
                data.remove(id);
            }
            for (id, snapshot) in changed {
                if deleted.contains(&id) {
                    continue;
                }
                let unchanged = data.peek(&id).is_some_and(|cached| *cached == snapshot);
                if unchanged {
                    data.get(&id);
                    continue;
                }
                let stamped =
                    snapshot.with_version(self.next_version.fetch_add(1, Ordering::Relaxed));
                data.insert(id.clone(), stamped.clone());
                event.changed.insert(id, stamped);
            }
            if let Some(capacity) = self.capacity {
                while data.len() > capacity {
                    let Some((id, _)) = data.pop_lru() else {
                        break;
                    };
                    tracing::trace!(%id, "Evicted snapshot");
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }

        event.deleted = deleted;
        event.indirectly_modified = indirectly_modified;
        if event.is_empty() {
            tracing::debug!("Snapshot batch changed nothing; no event published");
            return None;
        }
        tracing::debug!(
            changed = event.changed.len(),
            deleted = event.deleted.len(),
            indirect = event.indirectly_modified.len(),
            evicted,
            "Snapshot batch applied"
        );
        Some(self.publish(event))
    }

    /// Drop cached snapshots and broadcast an invalidation event.
    ///
    /// Identities not in the cache are still announced, since subscribers
    /// may hold live objects for them.
    pub fn invalidate<I>(&self, ids: I) -> Option<Arc<SnapshotEvent>>
    where
        I: IntoIterator<Item = ObjectIdentity>,
    {
        let ids: HashSet<ObjectIdentity> = ids.into_iter().collect();
        if ids.is_empty() {
            return None;
        }
        {
            let mut data = self.data();
            for id in &ids {
                data.remove(id);
            }
        }
        tracing::debug!(store = %self.name, count = ids.len(), "Invalidated snapshots");
        Some(self.publish(SnapshotEvent::invalidated(ids, false)))
    }

    /// Drop every cached snapshot and broadcast an invalidate-all event.
    pub fn invalidate_all(&self) -> Arc<SnapshotEvent> {
        let ids: HashSet<ObjectIdentity> = {
            let mut data = self.data();
            let ids = data.keys().cloned().collect();
            data.clear();
            ids
        };
        tracing::debug!(store = %self.name, count = ids.len(), "Invalidated all snapshots");
        self.publish(SnapshotEvent::invalidated(ids, true))
    }

    /// Drop one snapshot without publishing anything.
    pub fn forget(&self, id: &ObjectIdentity) -> Option<RowSnapshot> {
        self.data().remove(id)
    }

    /// Drop every snapshot without publishing anything.
    pub fn clear(&self) {
        self.data().clear();
    }

    /// Drop all subscribers and all snapshots.
    pub fn shutdown(&self) {
        let dropped = {
            let mut subscribers = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *subscribers, Arc::new(Vec::new())).len()
        };
        self.clear();
        tracing::debug!(store = %self.name, subscribers = dropped, "Snapshot store shut down");
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(&self, listener: Arc<dyn SnapshotListener>) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<Subscriber> = subscribers
            .iter()
            .map(|s| Subscriber {
                id: s.id,
                listener: Arc::clone(&s.listener),
            })
            .collect();
        next.push(Subscriber { id, listener });
        *subscribers = Arc::new(next);
        tracing::trace!(store = %self.name, subscriber = %id, "Subscribed");
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !subscribers.iter().any(|s| s.id == id) {
            return false;
        }
        let next: Vec<Subscriber> = subscribers
            .iter()
            .filter(|s| s.id != id)
            .map(|s| Subscriber {
                id: s.id,
                listener: Arc::clone(&s.listener),
            })
            .collect();
        *subscribers = Arc::new(next);
        tracing::trace!(store = %self.name, subscriber = %id, "Unsubscribed");
        true
    }

    fn subscriber_list(&self) -> Arc<Vec<Subscriber>> {
        Arc::clone(&self.subscribers.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn publish(&self, event: SnapshotEvent) -> Arc<SnapshotEvent> {
        let event = Arc::new(event);
        let subscribers = self.subscriber_list();
        for subscriber in subscribers.iter() {
            if Some(subscriber.id) == event.source {
                continue;
            }
            subscriber.listener.on_snapshot_event(&event);
        }
        self.events_published.fetch_add(1, Ordering::Relaxed);
        event
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventInbox, SnapshotEventKind};
    use proptest::prelude::*;
    use rowgraph_core::Value;
    use std::thread;

    fn id(n: i64) -> ObjectIdentity {
        ObjectIdentity::single("Artist", "id", n)
    }

    fn named(n: i64, name: &str) -> RowSnapshot {
        RowSnapshot::new([("id", Value::BigInt(n)), ("name", Value::from(name))])
    }

    #[test]
    fn test_put_and_get() {
        let store = SnapshotStore::unbounded();
        assert!(store.get(&id(1)).is_none());

        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);
        assert_eq!(store.get(&id(1)), Some(named(1, "a")));

        let stats = store.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_event_skips_source_subscriber() {
        let store = SnapshotStore::unbounded();
        let mine = EventInbox::new();
        let theirs = EventInbox::new();
        let my_id = store.subscribe(mine.clone());
        store.subscribe(theirs.clone());

        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), Some(my_id));
        assert!(mine.is_empty());
        let events = theirs.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, Some(my_id));
        assert_eq!(events[0].changed.get(&id(1)), Some(&named(1, "a")));
    }

    #[test]
    fn test_unchanged_snapshot_is_not_republished() {
        let store = SnapshotStore::unbounded();
        let inbox = EventInbox::new();
        store.subscribe(inbox.clone());

        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);
        let version = store.peek(&id(1)).unwrap().version();
        let again = store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);

        assert!(again.is_none());
        assert_eq!(inbox.drain().len(), 1);
        assert_eq!(store.peek(&id(1)).unwrap().version(), version);
    }

    #[test]
    fn test_versions_increase() {
        let store = SnapshotStore::unbounded();
        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);
        let first = store.peek(&id(1)).unwrap().version();
        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "b")), None);
        assert!(store.peek(&id(1)).unwrap().version() > first);
    }

    #[test]
    fn test_deleted_entries_are_removed_and_announced() {
        let store = SnapshotStore::unbounded();
        let inbox = EventInbox::new();
        store.subscribe(inbox.clone());
        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);
        inbox.drain();

        store.put_batch(SnapshotBatch::new().deleted(id(1)), None);
        assert!(!store.contains(&id(1)));
        let events = inbox.drain();
        assert!(events[0].deleted.contains(&id(1)));
    }

    #[test]
    fn test_empty_batch_publishes_nothing() {
        let store = SnapshotStore::unbounded();
        let inbox = EventInbox::new();
        store.subscribe(inbox.clone());
        assert!(store.put_batch(SnapshotBatch::new(), None).is_none());
        assert!(inbox.is_empty());
        assert_eq!(store.stats().events_published, 0);
    }

    #[test]
    fn test_lru_eviction_uses_last_access() {
        let store = SnapshotStore::bounded(2);
        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);
        store.put_batch(SnapshotBatch::new().changed(id(2), named(2, "b")), None);
        store.get(&id(1));
        store.put_batch(SnapshotBatch::new().changed(id(3), named(3, "c")), None);

        assert!(store.contains(&id(1)));
        assert!(!store.contains(&id(2)));
        assert!(store.contains(&id(3)));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_batch_larger_than_capacity_keeps_latest_entries() {
        let store = SnapshotStore::bounded(2);
        let batch: SnapshotBatch = (1..=4).map(|n| (id(n), named(n, "x"))).collect();
        store.put_batch(batch, None);
        assert_eq!(store.len(), 2);
        assert!(store.contains(&id(3)));
        assert!(store.contains(&id(4)));
    }

    #[test]
    fn test_invalidate_is_a_distinct_event_kind() {
        let store = SnapshotStore::unbounded();
        let inbox = EventInbox::new();
        store.subscribe(inbox.clone());
        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);
        inbox.drain();

        store.invalidate([id(1), id(99)]);
        assert!(!store.contains(&id(1)));
        let events = inbox.drain();
        assert_eq!(events[0].kind, SnapshotEventKind::Invalidated);
        assert!(events[0].invalidated.contains(&id(99)));

        store.put_batch(SnapshotBatch::new().changed(id(2), named(2, "b")), None);
        inbox.drain();
        store.invalidate_all();
        assert!(store.is_empty());
        let events = inbox.drain();
        assert!(events[0].invalidate_all);
        assert!(events[0].invalidated.contains(&id(2)));
    }

    #[test]
    fn test_forget_and_clear_are_silent() {
        let store = SnapshotStore::unbounded();
        let inbox = EventInbox::new();
        store.subscribe(inbox.clone());
        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);
        inbox.drain();

        assert!(store.forget(&id(1)).is_some());
        store.clear();
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_subscribe_from_callback_takes_effect_next_publish() {
        let store = Arc::new(SnapshotStore::unbounded());
        let late = EventInbox::new();
        let store_in_cb = Arc::clone(&store);
        let late_in_cb = Arc::clone(&late);
        let registered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let registered_in_cb = Arc::clone(&registered);
        store.subscribe(Arc::new(move |_: &Arc<SnapshotEvent>| {
            if !registered_in_cb.swap(true, Ordering::SeqCst) {
                store_in_cb.subscribe(late_in_cb.clone());
            }
        }));

        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);
        assert!(late.is_empty());
        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "b")), None);
        assert_eq!(late.drain().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let store = SnapshotStore::unbounded();
        let inbox = EventInbox::new();
        let sub = store.subscribe(inbox.clone());
        assert!(store.unsubscribe(sub));
        assert!(!store.unsubscribe(sub));
        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_shutdown_drops_subscribers_and_entries() {
        let store = SnapshotStore::unbounded();
        let inbox = EventInbox::new();
        store.subscribe(inbox.clone());
        store.put_batch(SnapshotBatch::new().changed(id(1), named(1, "a")), None);
        inbox.drain();

        store.shutdown();
        assert!(store.is_empty());
        assert_eq!(store.stats().subscribers, 0);
        store.put_batch(SnapshotBatch::new().changed(id(2), named(2, "b")), None);
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_batch() {
        let store = Arc::new(SnapshotStore::unbounded());
        let pair = [id(1), id(2)];
        store.put_batch(
            SnapshotBatch::new()
                .changed(pair[0].clone(), named(1, "0"))
                .changed(pair[1].clone(), named(2, "0")),
            None,
        );

        let writer = {
            let store = Arc::clone(&store);
            let pair = pair.clone();
            thread::spawn(move || {
                for round in 1..500 {
                    let tag = round.to_string();
                    store.put_batch(
                        SnapshotBatch::new()
                            .changed(pair[0].clone(), named(1, &tag))
                            .changed(pair[1].clone(), named(2, &tag)),
                        None,
                    );
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let pair = pair.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let seen = store.get_many(&pair);
                        let a = seen[0].as_ref().and_then(|s| s.get("name").cloned());
                        let b = seen[1].as_ref().and_then(|s| s.get("name").cloned());
                        assert_eq!(a, b, "torn batch observed");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(i64),
        Get(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_i64..12).prop_map(Op::Put),
            (0_i64..12).prop_map(Op::Get),
        ]
    }

    proptest! {
        /// After any sequence of puts and gets the store holds at most N
        /// entries, and they are exactly the N most recently accessed.
        #[test]
        fn prop_lru_capacity_bound(capacity in 1_usize..6, ops in prop::collection::vec(op_strategy(), 0..60)) {
            let store = SnapshotStore::bounded(capacity);
            // Most recently used last.
            let mut model: Vec<i64> = Vec::new();
            for op in &ops {
                match op {
                    Op::Put(k) => {
                        store.put_batch(SnapshotBatch::new().changed(id(*k), named(*k, "v")), None);
                        model.retain(|m| m != k);
                        model.push(*k);
                        if model.len() > capacity {
                            model.remove(0);
                        }
                    }
                    Op::Get(k) => {
                        let hit = store.get(&id(*k)).is_some();
                        prop_assert_eq!(hit, model.contains(k));
                        if hit {
                            model.retain(|m| m != k);
                            model.push(*k);
                        }
                    }
                }
                prop_assert!(store.len() <= capacity);
            }
            let mut expected = model.clone();
            expected.sort_unstable();
            let mut actual: Vec<i64> = (0..12).filter(|k| store.contains(&id(*k))).collect();
            actual.sort_unstable();
            prop_assert_eq!(actual, expected);
        }
    }
}
