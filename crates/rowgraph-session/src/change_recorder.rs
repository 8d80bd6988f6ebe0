//! Change recording for object contexts.
//!
//! Every mutation made through an [`ObjectContext`](crate::ObjectContext) is
//! appended to the context's [`ChangeRecorder`]. At commit time the log is
//! folded into a [`ChangeDiff`]: one net change per touched object.
//!
//! # Coalescing
//!
//! - Repeated edits of one attribute keep the earliest old value and the
//!   newest new value; edits that net out disappear from the diff.
//! - To-many adds and removes of the same target cancel.
//! - An object created and deleted before commit leaves no trace.

use std::collections::HashMap;

use rowgraph_core::{ObjectIdentity, PersistenceState, Value};

/// Change of one relationship on one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipChange {
    ToOne {
        old: Option<ObjectIdentity>,
        new: Option<ObjectIdentity>,
    },
    ToMany {
        added: Vec<ObjectIdentity>,
        removed: Vec<ObjectIdentity>,
    },
}

impl RelationshipChange {
    fn inverse(&self) -> Self {
        match self {
            RelationshipChange::ToOne { old, new } => RelationshipChange::ToOne {
                old: new.clone(),
                new: old.clone(),
            },
            RelationshipChange::ToMany { added, removed } => RelationshipChange::ToMany {
                added: removed.clone(),
                removed: added.clone(),
            },
        }
    }

    fn is_noop(&self) -> bool {
        match self {
            RelationshipChange::ToOne { old, new } => old == new,
            RelationshipChange::ToMany { added, removed } => added.is_empty() && removed.is_empty(),
        }
    }

    fn forget(&mut self, identity: &ObjectIdentity) {
        match self {
            RelationshipChange::ToOne { old, new } => {
                if old.as_ref() == Some(identity) {
                    *old = None;
                }
                if new.as_ref() == Some(identity) {
                    *new = None;
                }
            }
            RelationshipChange::ToMany { added, removed } => {
                added.retain(|t| t != identity);
                removed.retain(|t| t != identity);
            }
        }
    }
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEntry {
    Create {
        identity: ObjectIdentity,
        attributes: Vec<(String, Value)>,
    },
    AttributeEdit {
        identity: ObjectIdentity,
        attribute: String,
        old: Value,
        new: Value,
    },
    RelationshipEdit {
        identity: ObjectIdentity,
        relationship: String,
        change: RelationshipChange,
    },
    Delete {
        identity: ObjectIdentity,
        prior_state: PersistenceState,
    },
}

/// What undoing a [`ChangeEntry`] means.
#[derive(Debug, Clone, PartialEq)]
pub enum InverseChange {
    /// Drop the object from the context; it becomes TRANSIENT.
    Discard { identity: ObjectIdentity },
    SetAttribute {
        identity: ObjectIdentity,
        attribute: String,
        value: Value,
    },
    Relationship {
        identity: ObjectIdentity,
        relationship: String,
        change: RelationshipChange,
    },
    /// Return a deleted object to the state it had before deletion.
    Restore {
        identity: ObjectIdentity,
        state: PersistenceState,
    },
}

impl ChangeEntry {
    pub fn identity(&self) -> &ObjectIdentity {
        match self {
            ChangeEntry::Create { identity, .. }
            | ChangeEntry::AttributeEdit { identity, .. }
            | ChangeEntry::RelationshipEdit { identity, .. }
            | ChangeEntry::Delete { identity, .. } => identity,
        }
    }

    pub fn inverse(&self) -> InverseChange {
        match self {
            ChangeEntry::Create { identity, .. } => InverseChange::Discard {
                identity: identity.clone(),
            },
            ChangeEntry::AttributeEdit {
                identity,
                attribute,
                old,
                ..
            } => InverseChange::SetAttribute {
                identity: identity.clone(),
                attribute: attribute.clone(),
                value: old.clone(),
            },
            ChangeEntry::RelationshipEdit {
                identity,
                relationship,
                change,
            } => InverseChange::Relationship {
                identity: identity.clone(),
                relationship: relationship.clone(),
                change: change.inverse(),
            },
            ChangeEntry::Delete {
                identity,
                prior_state,
            } => InverseChange::Restore {
                identity: identity.clone(),
                state: *prior_state,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCategory {
    Create,
    Update,
    Delete,
}

/// Net change of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDelta {
    pub attribute: String,
    pub old: Value,
    pub new: Value,
}

/// Net change of one relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDelta {
    pub relationship: String,
    pub change: RelationshipChange,
}

/// Net change of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectChange {
    pub identity: ObjectIdentity,
    pub category: ChangeCategory,
    pub attributes: Vec<AttributeDelta>,
    pub relationships: Vec<RelationshipDelta>,
}

impl ObjectChange {
    pub fn attribute(&self, name: &str) -> Option<&AttributeDelta> {
        self.attributes.iter().find(|a| a.attribute == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipChange> {
        self.relationships
            .iter()
            .find(|r| r.relationship == name)
            .map(|r| &r.change)
    }
}

/// Normalized diff of a change log, in order of first appearance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeDiff {
    changes: Vec<ObjectChange>,
}

impl ChangeDiff {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectChange> {
        self.changes.iter()
    }

    pub fn get(&self, identity: &ObjectIdentity) -> Option<&ObjectChange> {
        self.changes.iter().find(|c| &c.identity == identity)
    }

    pub fn of_category(&self, category: ChangeCategory) -> impl Iterator<Item = &ObjectChange> {
        self.changes.iter().filter(move |c| c.category == category)
    }
}

impl<'a> IntoIterator for &'a ChangeDiff {
    type Item = &'a ObjectChange;
    type IntoIter = std::slice::Iter<'a, ObjectChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

#[derive(Default)]
struct Accumulator {
    created: bool,
    deleted: bool,
    attributes: Vec<AttributeDelta>,
    relationships: Vec<RelationshipDelta>,
}

impl Accumulator {
    fn attribute(&mut self, attribute: &str, old: &Value, new: &Value) {
        match self.attributes.iter_mut().find(|a| a.attribute == attribute) {
            Some(delta) => delta.new = new.clone(),
            None => self.attributes.push(AttributeDelta {
                attribute: attribute.to_string(),
                old: old.clone(),
                new: new.clone(),
            }),
        }
    }

    fn relationship(&mut self, relationship: &str, change: &RelationshipChange) {
        let existing = self
            .relationships
            .iter_mut()
            .find(|r| r.relationship == relationship);
        let Some(delta) = existing else {
            self.relationships.push(RelationshipDelta {
                relationship: relationship.to_string(),
                change: change.clone(),
            });
            return;
        };
        match (&mut delta.change, change) {
            (RelationshipChange::ToOne { new, .. }, RelationshipChange::ToOne { new: latest, .. }) => {
                new.clone_from(latest);
            }
            (
                RelationshipChange::ToMany { added, removed },
                RelationshipChange::ToMany {
                    added: more_added,
                    removed: more_removed,
                },
            ) => {
                for target in more_added {
                    if let Some(i) = removed.iter().position(|t| t == target) {
                        removed.remove(i);
                    } else if !added.contains(target) {
                        added.push(target.clone());
                    }
                }
                for target in more_removed {
                    if let Some(i) = added.iter().position(|t| t == target) {
                        added.remove(i);
                    } else if !removed.contains(target) {
                        removed.push(target.clone());
                    }
                }
            }
            // Cardinality never changes for a relationship name.
            (slot, other) => *slot = other.clone(),
        }
    }
}

/// Ordered log of pending mutations for one context.
#[derive(Debug, Default)]
pub struct ChangeRecorder {
    entries: Vec<ChangeEntry>,
    /// (identity, attribute) → position of its coalesced edit.
    attribute_edits: HashMap<(ObjectIdentity, String), usize>,
}

impl ChangeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, coalescing repeated edits of one attribute.
    pub fn record(&mut self, entry: ChangeEntry) {
        if let ChangeEntry::AttributeEdit {
            identity,
            attribute,
            new,
            ..
        } = &entry
        {
            let key = (identity.clone(), attribute.clone());
            if let Some(&position) = self.attribute_edits.get(&key) {
                if let ChangeEntry::AttributeEdit { new: latest, .. } = &mut self.entries[position] {
                    *latest = new.clone();
                }
                return;
            }
            self.attribute_edits.insert(key, self.entries.len());
        }
        tracing::trace!(identity = %entry.identity(), "Recorded change");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identities with at least one entry, in order of first appearance.
    pub fn touched(&self) -> Vec<ObjectIdentity> {
        let mut seen = Vec::new();
        for entry in &self.entries {
            if !seen.contains(entry.identity()) {
                seen.push(entry.identity().clone());
            }
        }
        seen
    }

    /// Fold the log into one net change per object.
    pub fn diff(&self) -> ChangeDiff {
        let mut order: Vec<ObjectIdentity> = Vec::new();
        let mut folded: HashMap<&ObjectIdentity, Accumulator> = HashMap::new();
        for entry in &self.entries {
            let identity = entry.identity();
            let acc = folded.entry(identity).or_insert_with(|| {
                order.push(identity.clone());
                Accumulator::default()
            });
            match entry {
                ChangeEntry::Create { attributes, .. } => {
                    acc.created = true;
                    for (attribute, value) in attributes {
                        acc.attribute(attribute, &Value::Null, value);
                    }
                }
                ChangeEntry::AttributeEdit {
                    attribute, old, new, ..
                } => acc.attribute(attribute, old, new),
                ChangeEntry::RelationshipEdit {
                    relationship,
                    change,
                    ..
                } => acc.relationship(relationship, change),
                ChangeEntry::Delete { .. } => acc.deleted = true,
            }
        }

        let mut changes = Vec::with_capacity(order.len());
        for identity in order {
            let Some(acc) = folded.remove(&identity) else {
                continue;
            };
            let category = match (acc.created, acc.deleted) {
                (true, true) => continue,
                (true, false) => ChangeCategory::Create,
                (false, true) => ChangeCategory::Delete,
                (false, false) => ChangeCategory::Update,
            };
            let attributes: Vec<AttributeDelta> = acc
                .attributes
                .into_iter()
                .filter(|a| a.old != a.new)
                .collect();
            let relationships: Vec<RelationshipDelta> = acc
                .relationships
                .into_iter()
                .filter(|r| !r.change.is_noop())
                .collect();
            if category == ChangeCategory::Update && attributes.is_empty() && relationships.is_empty() {
                continue;
            }
            changes.push(ObjectChange {
                identity,
                category,
                attributes,
                relationships,
            });
        }
        ChangeDiff { changes }
    }

    /// Drop every entry about `identity`, including references to it in
    /// other objects' relationship edits.
    pub fn forget(&mut self, identity: &ObjectIdentity) {
        self.entries.retain(|e| e.identity() != identity);
        for entry in &mut self.entries {
            if let ChangeEntry::RelationshipEdit { change, .. } = entry {
                change.forget(identity);
            }
        }
        self.entries.retain(|e| match e {
            ChangeEntry::RelationshipEdit { change, .. } => !change.is_noop(),
            _ => true,
        });
        self.reindex_attribute_edits();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.attribute_edits.clear();
    }

    /// Entries newest first, the order in which to undo them.
    pub fn entries_for_rollback(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter().rev()
    }

    /// Rewrite `from` to `to` in every entry.
    pub(crate) fn rename(&mut self, from: &ObjectIdentity, to: &ObjectIdentity) {
        let swap = |id: &mut ObjectIdentity| {
            if id == from {
                *id = to.clone();
            }
        };
        for entry in &mut self.entries {
            match entry {
                ChangeEntry::Create { identity, .. }
                | ChangeEntry::AttributeEdit { identity, .. }
                | ChangeEntry::Delete { identity, .. } => swap(identity),
                ChangeEntry::RelationshipEdit {
                    identity, change, ..
                } => {
                    swap(identity);
                    match change {
                        RelationshipChange::ToOne { old, new } => {
                            old.iter_mut().chain(new.iter_mut()).for_each(swap);
                        }
                        RelationshipChange::ToMany { added, removed } => {
                            added.iter_mut().chain(removed.iter_mut()).for_each(swap);
                        }
                    }
                }
            }
        }
        self.reindex_attribute_edits();
    }

    fn reindex_attribute_edits(&mut self) {
        self.attribute_edits.clear();
        for (position, entry) in self.entries.iter().enumerate() {
            if let ChangeEntry::AttributeEdit {
                identity,
                attribute,
                ..
            } = entry
            {
                self.attribute_edits
                    .insert((identity.clone(), attribute.clone()), position);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn artist(n: i64) -> ObjectIdentity {
        ObjectIdentity::single("Artist", "id", n)
    }

    fn edit(id: &ObjectIdentity, attribute: &str, old: &str, new: &str) -> ChangeEntry {
        ChangeEntry::AttributeEdit {
            identity: id.clone(),
            attribute: attribute.to_string(),
            old: Value::from(old),
            new: Value::from(new),
        }
    }

    #[test]
    fn test_repeated_edits_coalesce() {
        let mut recorder = ChangeRecorder::new();
        let a = artist(1);
        recorder.record(edit(&a, "name", "a", "b"));
        recorder.record(edit(&a, "name", "b", "c"));
        assert_eq!(recorder.len(), 1);

        let diff = recorder.diff();
        let change = diff.get(&a).unwrap();
        assert_eq!(change.category, ChangeCategory::Update);
        let delta = change.attribute("name").unwrap();
        assert_eq!((&delta.old, &delta.new), (&Value::from("a"), &Value::from("c")));
    }

    #[test]
    fn test_edit_back_to_original_drops_out() {
        let mut recorder = ChangeRecorder::new();
        let a = artist(1);
        recorder.record(edit(&a, "name", "a", "b"));
        recorder.record(edit(&a, "name", "b", "a"));
        assert!(recorder.diff().is_empty());
        assert!(!recorder.is_empty());
    }

    #[test]
    fn test_create_then_delete_cancels() {
        let mut recorder = ChangeRecorder::new();
        let temp = ObjectIdentity::temporary("Artist");
        recorder.record(ChangeEntry::Create {
            identity: temp.clone(),
            attributes: vec![("name".into(), Value::from("x"))],
        });
        recorder.record(ChangeEntry::Delete {
            identity: temp.clone(),
            prior_state: PersistenceState::New,
        });
        assert!(recorder.diff().is_empty());

        recorder.forget(&temp);
        assert!(recorder.is_empty());
        assert!(recorder.touched().is_empty());
    }

    #[test]
    fn test_forget_strips_references_from_other_entries() {
        let mut recorder = ChangeRecorder::new();
        let a = artist(1);
        let temp = ObjectIdentity::temporary("Painting");
        recorder.record(ChangeEntry::RelationshipEdit {
            identity: a.clone(),
            relationship: "paintings".into(),
            change: RelationshipChange::ToMany {
                added: vec![temp.clone()],
                removed: vec![],
            },
        });
        recorder.forget(&temp);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_to_many_add_then_remove_nets_out() {
        let mut recorder = ChangeRecorder::new();
        let a = artist(1);
        let p = ObjectIdentity::single("Painting", "id", 5_i64);
        for (added, removed) in [(vec![p.clone()], vec![]), (vec![], vec![p.clone()])] {
            recorder.record(ChangeEntry::RelationshipEdit {
                identity: a.clone(),
                relationship: "paintings".into(),
                change: RelationshipChange::ToMany { added, removed },
            });
        }
        assert!(recorder.diff().is_empty());
    }

    #[test]
    fn test_to_one_keeps_earliest_old_and_latest_new() {
        let mut recorder = ChangeRecorder::new();
        let p = ObjectIdentity::single("Painting", "id", 5_i64);
        for (old, new) in [(Some(artist(1)), Some(artist(2))), (Some(artist(2)), Some(artist(3)))] {
            recorder.record(ChangeEntry::RelationshipEdit {
                identity: p.clone(),
                relationship: "artist".into(),
                change: RelationshipChange::ToOne { old, new },
            });
        }
        let diff = recorder.diff();
        assert_eq!(
            diff.get(&p).unwrap().relationship("artist"),
            Some(&RelationshipChange::ToOne {
                old: Some(artist(1)),
                new: Some(artist(3)),
            })
        );
    }

    #[test]
    fn test_inverse_and_rollback_order() {
        let mut recorder = ChangeRecorder::new();
        let a = artist(1);
        recorder.record(edit(&a, "name", "a", "b"));
        recorder.record(ChangeEntry::Delete {
            identity: a.clone(),
            prior_state: PersistenceState::Modified,
        });
        let undo: Vec<InverseChange> = recorder.entries_for_rollback().map(ChangeEntry::inverse).collect();
        assert_eq!(
            undo,
            vec![
                InverseChange::Restore {
                    identity: a.clone(),
                    state: PersistenceState::Modified,
                },
                InverseChange::SetAttribute {
                    identity: a,
                    attribute: "name".into(),
                    value: Value::from("a"),
                },
            ]
        );
    }

    #[test]
    fn test_rename_follows_reindexing() {
        let mut recorder = ChangeRecorder::new();
        let temp = ObjectIdentity::temporary("Artist");
        let p = ObjectIdentity::single("Painting", "id", 5_i64);
        recorder.record(ChangeEntry::RelationshipEdit {
            identity: p.clone(),
            relationship: "artist".into(),
            change: RelationshipChange::ToOne {
                old: None,
                new: Some(temp.clone()),
            },
        });
        recorder.rename(&temp, &artist(9));
        assert_eq!(
            recorder.diff().get(&p).unwrap().relationship("artist"),
            Some(&RelationshipChange::ToOne {
                old: None,
                new: Some(artist(9)),
            })
        );
    }

    proptest! {
        /// Whatever the edit sequence, the diff reports exactly the
        /// attributes whose final value differs from the initial one.
        #[test]
        fn prop_coalescing_matches_net_effect(
            edits in prop::collection::vec((0_i64..3, 0_usize..3, 0_i32..4), 0..40)
        ) {
            let attributes = ["a", "b", "c"];
            let mut recorder = ChangeRecorder::new();
            let mut current: HashMap<(i64, usize), i32> = HashMap::new();
            for (object, attribute, value) in &edits {
                let old = *current.get(&(*object, *attribute)).unwrap_or(&0);
                recorder.record(ChangeEntry::AttributeEdit {
                    identity: artist(*object),
                    attribute: attributes[*attribute].to_string(),
                    old: Value::Int(old),
                    new: Value::Int(*value),
                });
                current.insert((*object, *attribute), *value);
            }

            let diff = recorder.diff();
            for object in 0..3 {
                for (index, name) in attributes.iter().enumerate() {
                    let last = *current.get(&(object, index)).unwrap_or(&0);
                    let delta = diff.get(&artist(object)).and_then(|c| c.attribute(name));
                    if last == 0 {
                        prop_assert!(delta.is_none());
                    } else {
                        let delta = delta.unwrap();
                        prop_assert_eq!(&delta.old, &Value::Int(0));
                        prop_assert_eq!(&delta.new, &Value::Int(last));
                    }
                }
            }
        }
    }
}
