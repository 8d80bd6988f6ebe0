//! Per-context identity graph.
//!
//! The identity graph guarantees that each identity maps to exactly one live
//! [`DomainObject`] within a context. This provides:
//!
//! - **Uniqueness**: fetching the same row twice yields the same object
//! - **Re-indexing**: new objects move from their temporary identity to the
//!   permanent one after commit, and every reference follows them
//! - **Collection**: clean objects nobody holds a handle to can be swept
//!
//! # Handles
//!
//! Application code keeps an object alive across sweeps by holding an
//! [`ObjectHandle`]. Handles are explicit reference counts: an entry is
//! collectable only when the graph holds the last clone of its anchor.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rowgraph_core::{Error, ObjectIdentity, PersistenceState, RelationshipInfo, Result};

use crate::object::DomainObject;

type Anchor = Arc<RwLock<ObjectIdentity>>;

/// Strong reference to an object in an [`IdentityGraph`].
///
/// The handle follows its object through re-indexing.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    anchor: Anchor,
}

impl ObjectHandle {
    /// Current identity of the referenced object.
    pub fn identity(&self) -> ObjectIdentity {
        self.anchor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.anchor, &other.anchor)
    }
}

impl Eq for ObjectHandle {}

#[derive(Debug)]
struct Entry {
    object: DomainObject,
    anchor: Option<Anchor>,
}

impl Entry {
    fn is_retained(&self) -> bool {
        self.anchor
            .as_ref()
            .is_some_and(|anchor| Arc::strong_count(anchor) > 1)
    }
}

/// Identity → live object map owned by one object context.
#[derive(Debug, Default)]
pub struct IdentityGraph {
    entries: HashMap<ObjectIdentity, Entry>,
    gc_threshold: Option<usize>,
}

impl IdentityGraph {
    /// Create a graph that never sweeps on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep automatically whenever registration pushes the graph past
    /// `threshold` entries.
    pub fn with_gc_threshold(threshold: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            gc_threshold: threshold,
        }
    }

    pub fn gc_threshold(&self) -> Option<usize> {
        self.gc_threshold
    }

    /// Insert or overwrite by identity. Handles to a replaced entry stay valid.
    pub fn register(&mut self, object: DomainObject) -> Option<DomainObject> {
        let identity = object.identity().clone();
        let previous = match self.entries.get_mut(&identity) {
            Some(entry) => Some(std::mem::replace(&mut entry.object, object)),
            None => {
                self.entries.insert(
                    identity.clone(),
                    Entry {
                        object,
                        anchor: None,
                    },
                );
                None
            }
        };
        if let Some(threshold) = self.gc_threshold {
            if self.entries.len() > threshold {
                self.sweep_except(Some(&identity));
            }
        }
        previous
    }

    /// Move an entry from its temporary identity to its permanent one and
    /// rewrite every reference in the graph.
    ///
    /// A HOLLOW placeholder under the permanent identity is replaced; any
    /// other live object there is a conflict.
    pub fn reindex(&mut self, temporary: &ObjectIdentity, permanent: &ObjectIdentity) -> Result<()> {
        self.check_reindex(temporary, permanent)?;
        let Some(mut entry) = self.entries.remove(temporary) else {
            return Err(Error::ObjectNotFound(temporary.clone()));
        };
        if let Some(placeholder) = self.entries.remove(permanent) {
            if entry.anchor.is_none() {
                entry.anchor = placeholder.anchor;
            }
        }
        entry.object.set_identity(permanent.clone());
        if let Some(anchor) = &entry.anchor {
            *anchor.write().unwrap_or_else(PoisonError::into_inner) = permanent.clone();
        }
        self.entries.insert(permanent.clone(), entry);
        for other in self.entries.values_mut() {
            other.object.rewrite_reference(temporary, permanent);
        }
        tracing::trace!(%temporary, %permanent, "Re-indexed object");
        Ok(())
    }

    /// Apply unsaved reverse edits to a member list of `owner`'s to-many
    /// `rel` read from storage.
    pub(crate) fn reconcile_members(
        &self,
        owner: &ObjectIdentity,
        rel: &RelationshipInfo,
        members: &mut Vec<ObjectIdentity>,
    ) {
        let reverse = rel.reverse;
        members.retain(|m| {
            self.lookup(m)
                .and_then(|o| o.points_at(reverse, owner))
                .unwrap_or(true)
        });
        for local in self.iter() {
            if local.descriptor().is_a(rel.target)
                && local.points_at(reverse, owner) == Some(true)
                && !members.contains(local.identity())
            {
                members.push(local.identity().clone());
            }
        }
    }

    /// Fail with `IdentityConflict` if [`reindex`](Self::reindex) would.
    pub fn check_reindex(&self, temporary: &ObjectIdentity, permanent: &ObjectIdentity) -> Result<()> {
        match self.entries.get(permanent) {
            Some(existing) if existing.object.state() != PersistenceState::Hollow => {
                Err(Error::IdentityConflict {
                    temporary: temporary.clone(),
                    permanent: permanent.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn lookup(&self, identity: &ObjectIdentity) -> Option<&DomainObject> {
        self.entries.get(identity).map(|e| &e.object)
    }

    pub(crate) fn lookup_mut(&mut self, identity: &ObjectIdentity) -> Option<&mut DomainObject> {
        self.entries.get_mut(identity).map(|e| &mut e.object)
    }

    pub(crate) fn require_mut(&mut self, identity: &ObjectIdentity) -> Result<&mut DomainObject> {
        self.lookup_mut(identity)
            .ok_or_else(|| Error::ObjectNotFound(identity.clone()))
    }

    pub fn require(&self, identity: &ObjectIdentity) -> Result<&DomainObject> {
        self.lookup(identity)
            .ok_or_else(|| Error::ObjectNotFound(identity.clone()))
    }

    pub fn contains(&self, identity: &ObjectIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Local instance for an identity known to `source`.
    ///
    /// An identity missing locally gets a HOLLOW instance carrying the
    /// source object's entity but none of its values.
    pub fn local_copy_of(
        &mut self,
        identity: &ObjectIdentity,
        source: &IdentityGraph,
    ) -> Result<&DomainObject> {
        if !self.entries.contains_key(identity) {
            let foreign = source.require(identity)?;
            let hollow = DomainObject::hollow(identity.clone(), Arc::clone(foreign.descriptor()));
            self.register(hollow);
        }
        self.require(identity)
    }

    /// Hand out a strong reference that keeps the object from being swept.
    pub fn retain(&mut self, identity: &ObjectIdentity) -> Result<ObjectHandle> {
        let entry = self
            .entries
            .get_mut(identity)
            .ok_or_else(|| Error::ObjectNotFound(identity.clone()))?;
        let anchor = entry
            .anchor
            .get_or_insert_with(|| Arc::new(RwLock::new(identity.clone())));
        Ok(ObjectHandle {
            anchor: Arc::clone(anchor),
        })
    }

    pub fn is_retained(&self, identity: &ObjectIdentity) -> bool {
        self.entries.get(identity).is_some_and(Entry::is_retained)
    }

    /// Remove every clean, unreferenced entry. Returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        self.sweep_except(None)
    }

    fn sweep_except(&mut self, keep: Option<&ObjectIdentity>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|identity, entry| {
            Some(identity) == keep
                || !entry.object.state().is_collectable()
                || entry.is_retained()
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "Swept identity graph");
        }
        removed
    }

    pub fn remove(&mut self, identity: &ObjectIdentity) -> Option<DomainObject> {
        self.entries.remove(identity).map(|e| e.object)
    }

    /// Drop every reference to `identity` held by other objects.
    pub(crate) fn drop_references(&mut self, identity: &ObjectIdentity) {
        for entry in self.entries.values_mut() {
            entry.object.drop_reference(identity);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainObject> {
        self.entries.values().map(|e| &e.object)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut DomainObject> {
        self.entries.values_mut().map(|e| &mut e.object)
    }

    pub fn identities(&self) -> impl Iterator<Item = &ObjectIdentity> {
        self.entries.keys()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
