//! Recency index backing the snapshot store.

use std::collections::{BTreeMap, HashMap};

use rowgraph_core::{ObjectIdentity, RowSnapshot};

#[derive(Debug)]
struct LruEntry {
    snapshot: RowSnapshot,
    last_used: u64,
}

/// Map with strict least-recently-used ordering.
///
/// Every access stamps the entry with a monotonically increasing tick; the
/// `order` index maps ticks back to keys so the oldest entry is found in
/// logarithmic time.
#[derive(Debug, Default)]
pub(crate) struct LruIndex {
    entries: HashMap<ObjectIdentity, LruEntry>,
    order: BTreeMap<u64, ObjectIdentity>,
    tick: u64,
}

impl LruIndex {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Get and mark as most recently used.
    pub(crate) fn get(&mut self, id: &ObjectIdentity) -> Option<&RowSnapshot> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(id)?;
        self.order.remove(&entry.last_used);
        self.order.insert(tick, id.clone());
        entry.last_used = tick;
        Some(&entry.snapshot)
    }

    /// Get without touching recency.
    pub(crate) fn peek(&self, id: &ObjectIdentity) -> Option<&RowSnapshot> {
        self.entries.get(id).map(|e| &e.snapshot)
    }

    pub(crate) fn contains(&self, id: &ObjectIdentity) -> bool {
        self.entries.contains_key(id)
    }

    /// Insert or replace, marking the entry most recently used.
    pub(crate) fn insert(&mut self, id: ObjectIdentity, snapshot: RowSnapshot) -> Option<RowSnapshot> {
        let tick = self.next_tick();
        self.order.insert(tick, id.clone());
        let previous = self.entries.insert(
            id,
            LruEntry {
                snapshot,
                last_used: tick,
            },
        );
        previous.map(|old| {
            self.order.remove(&old.last_used);
            old.snapshot
        })
    }

    pub(crate) fn remove(&mut self, id: &ObjectIdentity) -> Option<RowSnapshot> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.last_used);
        Some(entry.snapshot)
    }

    /// Remove the least recently used entry.
    pub(crate) fn pop_lru(&mut self) -> Option<(ObjectIdentity, RowSnapshot)> {
        let (_, id) = self.order.pop_first()?;
        let entry = self.entries.remove(&id)?;
        Some((id, entry.snapshot))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &ObjectIdentity> {
        self.entries.keys()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
