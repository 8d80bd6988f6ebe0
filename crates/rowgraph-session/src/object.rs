//! Domain objects: positional attribute storage plus relationship faults.

use std::sync::Arc;

use rowgraph_core::{
    EntityDescriptor, EntityInfo, Error, ObjectIdentity, PersistenceState, RelationshipInfo,
    RelationshipKind, Result, RowSnapshot, Value,
};

/// A relationship value that may not have been loaded yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Fault<T> {
    /// Not loaded; reading it requires a fetch.
    #[default]
    Unresolved,
    Resolved(T),
}

impl<T> Fault<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Fault::Resolved(_))
    }

    pub fn resolved(&self) -> Option<&T> {
        match self {
            Fault::Resolved(value) => Some(value),
            Fault::Unresolved => None,
        }
    }
}

/// Current value of one relationship on one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    ToOne(Fault<Option<ObjectIdentity>>),
    ToMany(Fault<Vec<ObjectIdentity>>),
}

impl Relation {
    fn unresolved(kind: RelationshipKind) -> Self {
        match kind {
            RelationshipKind::ToOne => Relation::ToOne(Fault::Unresolved),
            RelationshipKind::ToMany => Relation::ToMany(Fault::Unresolved),
        }
    }

    fn empty(kind: RelationshipKind) -> Self {
        match kind {
            RelationshipKind::ToOne => Relation::ToOne(Fault::Resolved(None)),
            RelationshipKind::ToMany => Relation::ToMany(Fault::Resolved(Vec::new())),
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self {
            Relation::ToOne(fault) => fault.is_resolved(),
            Relation::ToMany(fault) => fault.is_resolved(),
        }
    }

    /// Every identity this relation currently points at.
    pub fn targets(&self) -> Vec<ObjectIdentity> {
        match self {
            Relation::ToOne(Fault::Resolved(Some(target))) => vec![target.clone()],
            Relation::ToMany(Fault::Resolved(targets)) => targets.clone(),
            _ => Vec::new(),
        }
    }

    fn replace_target(&mut self, from: &ObjectIdentity, to: &ObjectIdentity) {
        match self {
            Relation::ToOne(Fault::Resolved(Some(target))) if target == from => {
                *target = to.clone();
            }
            Relation::ToMany(Fault::Resolved(targets)) => {
                for target in targets.iter_mut().filter(|t| *t == from) {
                    *target = to.clone();
                }
            }
            _ => {}
        }
    }

    fn drop_target(&mut self, gone: &ObjectIdentity) {
        match self {
            Relation::ToOne(Fault::Resolved(target)) if target.as_ref() == Some(gone) => {
                *target = None;
            }
            Relation::ToMany(Fault::Resolved(targets)) => targets.retain(|t| t != gone),
            _ => {}
        }
    }
}

/// Identity of a fetched row, or `None` when a key column is NULL.
pub fn identity_for_row(descriptor: &EntityDescriptor, row: &RowSnapshot) -> Option<ObjectIdentity> {
    let mut key = Vec::with_capacity(descriptor.primary_key().len());
    for column in descriptor.primary_key() {
        match row.get(column) {
            Some(value) if !value.is_null() => key.push((*column, value.clone())),
            _ => return None,
        }
    }
    Some(ObjectIdentity::permanent(descriptor.root(), key))
}

/// Target of a to-one relationship as encoded by the foreign key in `row`.
fn to_one_target(
    descriptor: &EntityDescriptor,
    index: usize,
    rel: &RelationshipInfo,
    row: &RowSnapshot,
) -> Option<ObjectIdentity> {
    let mut key = Vec::with_capacity(rel.joins.len());
    for (local, target) in rel.joins {
        match row.get(local) {
            Some(value) if !value.is_null() => key.push((*target, value.clone())),
            _ => return None,
        }
    }
    Some(ObjectIdentity::permanent(descriptor.target_root(index), key))
}

/// One live object in an object context.
///
/// Attributes are stored positionally in the order of the entity's accessor
/// table; relationships likewise. Mutation goes through the owning
/// [`ObjectContext`](crate::ObjectContext) so that every change is recorded.
#[derive(Debug, Clone)]
pub struct DomainObject {
    identity: ObjectIdentity,
    state: PersistenceState,
    descriptor: Arc<EntityDescriptor>,
    values: Vec<Value>,
    relations: Vec<Relation>,
    snapshot: Option<RowSnapshot>,
}

impl DomainObject {
    /// A NEW object with every attribute NULL and every relationship empty.
    pub(crate) fn new(identity: ObjectIdentity, descriptor: Arc<EntityDescriptor>) -> Self {
        let mut values = vec![Value::Null; descriptor.attributes().len()];
        if let Some(d) = descriptor.discriminator() {
            if let Some(i) = descriptor
                .attributes()
                .iter()
                .position(|a| a.column == d.column)
            {
                values[i] = Value::from(d.value);
            }
        }
        let relations = descriptor
            .relationships()
            .iter()
            .map(|r| Relation::empty(r.kind))
            .collect();
        Self {
            identity,
            state: PersistenceState::New,
            descriptor,
            values,
            relations,
            snapshot: None,
        }
    }

    /// A HOLLOW placeholder: identity known, nothing loaded.
    pub(crate) fn hollow(identity: ObjectIdentity, descriptor: Arc<EntityDescriptor>) -> Self {
        let values = vec![Value::Null; descriptor.attributes().len()];
        let relations = descriptor
            .relationships()
            .iter()
            .map(|r| Relation::unresolved(r.kind))
            .collect();
        Self {
            identity,
            state: PersistenceState::Hollow,
            descriptor,
            values,
            relations,
            snapshot: None,
        }
    }

    /// A COMMITTED object built from a stored row.
    pub(crate) fn from_row(
        identity: ObjectIdentity,
        descriptor: Arc<EntityDescriptor>,
        row: RowSnapshot,
    ) -> Self {
        let mut object = Self::hollow(identity, descriptor);
        object.load_row(row);
        object
    }

    /// Replace attribute values and to-one links with the row's, mark the
    /// object COMMITTED and keep the row as its snapshot.
    ///
    /// Resolved to-many collections are kept; callers invalidate them when
    /// the row change may affect them.
    pub(crate) fn load_row(&mut self, row: RowSnapshot) {
        for (i, attribute) in self.descriptor.attributes().iter().enumerate() {
            self.values[i] = row.get_or_null(attribute.column).clone();
        }
        for (i, rel) in self.descriptor.relationships().iter().enumerate() {
            if rel.kind == RelationshipKind::ToOne {
                let target = to_one_target(&self.descriptor, i, rel, &row);
                self.relations[i] = Relation::ToOne(Fault::Resolved(target));
            }
        }
        self.state = PersistenceState::Committed;
        self.snapshot = Some(row);
    }

    /// Overwrite only the columns listed, leaving local edits elsewhere alone.
    pub(crate) fn merge_columns(&mut self, row: &RowSnapshot, columns: &[String]) {
        for (i, attribute) in self.descriptor.attributes().iter().enumerate() {
            if columns.iter().any(|c| c == attribute.column) {
                self.values[i] = row.get_or_null(attribute.column).clone();
            }
        }
        for (i, rel) in self.descriptor.relationships().iter().enumerate() {
            if rel.kind != RelationshipKind::ToOne {
                continue;
            }
            let touched = rel
                .joins
                .iter()
                .any(|(local, _)| columns.iter().any(|c| c == local));
            if touched {
                let target = to_one_target(&self.descriptor, i, rel, row);
                self.relations[i] = Relation::ToOne(Fault::Resolved(target));
            }
        }
        let base = self.snapshot.clone().unwrap_or_default();
        let refreshed = RowSnapshot::new(
            columns
                .iter()
                .map(|c| (c.clone(), row.get_or_null(c).clone())),
        );
        self.snapshot = Some(base.merged(&refreshed));
    }

    pub fn identity(&self) -> &ObjectIdentity {
        &self.identity
    }

    pub fn state(&self) -> PersistenceState {
        self.state
    }

    /// Most specific entity of this object.
    pub fn entity(&self) -> &'static str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    /// Last row image known to match storage (or the parent context).
    pub fn snapshot(&self) -> Option<&RowSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn get(&self, attribute: &str) -> Result<&Value> {
        let index = self.descriptor.require_attribute(attribute)?;
        Ok(&self.values[index])
    }

    /// Attribute values in accessor-table order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn relation(&self, name: &str) -> Result<&Relation> {
        let (index, _) = self.descriptor.require_relationship(name)?;
        Ok(&self.relations[index])
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub(crate) fn set_state(&mut self, state: PersistenceState) {
        self.state = state;
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: Option<RowSnapshot>) {
        self.snapshot = snapshot;
    }

    pub(crate) fn set_value(&mut self, index: usize, value: Value) -> Value {
        std::mem::replace(&mut self.values[index], value)
    }

    pub(crate) fn relation_at(&self, index: usize) -> &Relation {
        &self.relations[index]
    }

    pub(crate) fn set_relation(&mut self, index: usize, relation: Relation) {
        self.relations[index] = relation;
    }

    pub(crate) fn set_identity(&mut self, identity: ObjectIdentity) {
        self.identity = identity;
    }

    pub(crate) fn set_descriptor(&mut self, descriptor: Arc<EntityDescriptor>) {
        if Arc::ptr_eq(&self.descriptor, &descriptor) {
            return;
        }
        let mut values = vec![Value::Null; descriptor.attributes().len()];
        for (i, attribute) in descriptor.attributes().iter().enumerate() {
            if let Some(old) = self.descriptor.attribute_index(attribute.name) {
                values[i] = self.values[old].clone();
            }
        }
        let relations = descriptor
            .relationships()
            .iter()
            .map(|rel| {
                self.descriptor
                    .relationship_index(rel.name)
                    .map_or_else(|| Relation::unresolved(rel.kind), |old| self.relations[old].clone())
            })
            .collect();
        self.values = values;
        self.relations = relations;
        self.descriptor = descriptor;
    }

    /// Point references at `from` to `to` instead.
    pub(crate) fn rewrite_reference(&mut self, from: &ObjectIdentity, to: &ObjectIdentity) {
        for relation in &mut self.relations {
            relation.replace_target(from, to);
        }
    }

    /// Drop every reference to `gone`.
    pub(crate) fn drop_reference(&mut self, gone: &ObjectIdentity) {
        for relation in &mut self.relations {
            relation.drop_target(gone);
        }
    }

    /// Current target of a to-one relationship, read from the snapshot when
    /// the relation itself is unresolved.
    pub(crate) fn to_one_target(&self, index: usize) -> Option<ObjectIdentity> {
        match &self.relations[index] {
            Relation::ToOne(Fault::Resolved(target)) => target.clone(),
            _ => {
                let rel = &self.descriptor.relationships()[index];
                let row = self.snapshot.as_ref()?;
                to_one_target(&self.descriptor, index, rel, row)
            }
        }
    }

    /// Whether `relationship` currently points at `owner`: the to-one
    /// target, or membership of a resolved collection. `None` when that
    /// cannot be told from memory.
    pub(crate) fn points_at(&self, relationship: Option<&str>, owner: &ObjectIdentity) -> Option<bool> {
        match self.relation(relationship?).ok()? {
            Relation::ToOne(Fault::Resolved(target)) => Some(target.as_ref() == Some(owner)),
            Relation::ToMany(Fault::Resolved(members)) => Some(members.contains(owner)),
            _ => None,
        }
    }

    /// Turn the object back into a HOLLOW placeholder.
    pub(crate) fn unload(&mut self) {
        self.values.fill(Value::Null);
        for (relation, rel) in self.relations.iter_mut().zip(self.descriptor.relationships()) {
            *relation = Relation::unresolved(rel.kind);
        }
        self.snapshot = None;
        self.state = PersistenceState::Hollow;
    }

    /// Mark resolved to-many collections as needing a fetch.
    pub(crate) fn invalidate_collections(&mut self) {
        for (relation, rel) in self.relations.iter_mut().zip(self.descriptor.relationships()) {
            if rel.is_to_many() {
                *relation = Relation::ToMany(Fault::Unresolved);
            }
        }
    }

    /// Foreign-key column values for a to-one relationship.
    ///
    /// Returns `None` when the target is temporary (its key is not known
    /// yet) or the relationship is unresolved.
    pub(crate) fn foreign_key_values(&self, index: usize) -> Option<Vec<(String, Value)>> {
        let rel = &self.descriptor.relationships()[index];
        match &self.relations[index] {
            Relation::ToOne(Fault::Resolved(None)) => Some(
                rel.joins
                    .iter()
                    .map(|(local, _)| ((*local).to_string(), Value::Null))
                    .collect(),
            ),
            Relation::ToOne(Fault::Resolved(Some(target))) if !target.is_temporary() => rel
                .joins
                .iter()
                .map(|(local, remote)| {
                    target
                        .key_value(remote)
                        .map(|v| ((*local).to_string(), v.clone()))
                })
                .collect(),
            _ => None,
        }
    }

    /// Full row image: key, attributes, resolved foreign keys and the
    /// discriminator.
    pub fn to_row(&self) -> RowSnapshot {
        let mut row: Vec<(String, Value)> = Vec::new();
        if let Some(key) = self.identity.key() {
            row.extend(key.iter().cloned());
        }
        for (attribute, value) in self.descriptor.attributes().iter().zip(&self.values) {
            row.push((attribute.column.to_string(), value.clone()));
        }
        for index in 0..self.relations.len() {
            if let Some(columns) = self.foreign_key_values(index) {
                row.extend(columns);
            }
        }
        let mut snapshot = RowSnapshot::new(row);
        if let Some(d) = self.descriptor.discriminator() {
            if snapshot.get_or_null(d.column).is_null() {
                snapshot = snapshot.with(d.column, Value::from(d.value));
            }
        }
        // Unresolved to-one links keep whatever the last snapshot said.
        if let Some(base) = &self.snapshot {
            let owned: Vec<&str> = self
                .descriptor
                .relationships()
                .iter()
                .zip(&self.relations)
                .filter(|(rel, relation)| !rel.is_to_many() && relation.is_resolved())
                .flat_map(|(rel, _)| rel.source_columns())
                .collect();
            let missing: Vec<(String, Value)> = base
                .iter()
                .filter(|(c, _)| !snapshot.contains(c) && !owned.contains(c))
                .map(|(c, v)| (c.to_string(), v.clone()))
                .collect();
            if !missing.is_empty() {
                snapshot = RowSnapshot::new(missing).merged(&snapshot);
            }
        }
        snapshot
    }
}

/// Typed view of an entity.
///
/// Implemented by application structs that want to move data in and out of
/// [`DomainObject`]s without going through attribute names at every call.
pub trait Model: Sized {
    fn entity() -> &'static EntityInfo;

    /// Attribute values to store, by attribute name.
    fn to_attributes(&self) -> Vec<(&'static str, Value)>;

    fn from_object(object: &DomainObject) -> Result<Self>;
}

/// Read one attribute and convert it.
pub fn attribute<T>(object: &DomainObject, name: &str) -> Result<T>
where
    T: TryFrom<Value, Error = Error>,
{
    T::try_from(object.get(name)?.clone())
}
