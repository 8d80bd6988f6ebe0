//! Commit planning: turning a [`ChangeDiff`] into an [`OrderedDiff`].
//!
//! Planning is read-only with respect to the context. It:
//! - INSERTs new objects parent-first (a row referencing another new row
//!   goes after it)
//! - UPDATEs changed columns, including foreign keys implied by to-many
//!   edits and NULLIFY rules
//! - DELETEs dependents first, after expanding CASCADE rules and checking
//!   DENY rules
//! - INSERTs and DELETEs join rows for relationships flattened over a join
//!   table

use std::collections::{HashMap, HashSet};

use rowgraph_core::{
    DeleteRule, DiffOp, EntityRegistry, Error, JoinTable, KeyReference, LockingStrategy, ObjectIdentity,
    OrderedDiff, Qualifier, QueryDescriptor, RelationshipInfo, RelationshipKind, Result,
    RowSnapshot, StorageExecutor, Value,
};

use crate::change_recorder::{ChangeCategory, ChangeDiff, RelationshipChange};
use crate::identity_graph::IdentityGraph;
use crate::object::{DomainObject, Fault, Relation, identity_for_row};
use crate::prefetch::fetch_links;

// ============================================================================
// Plan
// ============================================================================

/// Everything a commit writes, plus the bookkeeping needed once storage
/// has accepted it.
#[derive(Debug, Clone, Default)]
pub struct CommitPlan {
    pub(crate) diff: OrderedDiff,
    /// New objects, in insert order.
    pub(crate) inserted: Vec<ObjectIdentity>,
    /// Graph objects receiving an UPDATE.
    pub(crate) updated: Vec<ObjectIdentity>,
    /// Every deleted identity, cascaded ones included, in delete order.
    pub(crate) deleted: Vec<ObjectIdentity>,
    /// New objects removed by a CASCADE before they ever reached storage.
    pub(crate) discarded: Vec<ObjectIdentity>,
    /// Objects removed by delete rules rather than by an explicit delete,
    /// discarded new objects included.
    pub(crate) cascaded: Vec<DomainObject>,
    /// Post-images of rows outside the graph changed by NULLIFY rules.
    pub(crate) external: Vec<(ObjectIdentity, RowSnapshot)>,
    /// Owners of to-many collections affected by the commit.
    pub(crate) indirectly_modified: Vec<ObjectIdentity>,
}

impl CommitPlan {
    /// Operations in apply order.
    pub fn ordered_diff(&self) -> &OrderedDiff {
        &self.diff
    }

    pub fn is_empty(&self) -> bool {
        self.diff.is_empty() && self.discarded.is_empty()
    }

    pub fn deleted(&self) -> &[ObjectIdentity] {
        &self.deleted
    }

    pub fn indirectly_modified(&self) -> &[ObjectIdentity] {
        &self.indirectly_modified
    }
}

// ============================================================================
// Pending rows
// ============================================================================

/// Column values and key references collected for one row.
#[derive(Debug, Default)]
struct PendingRow {
    values: Vec<(String, Value)>,
    references: Vec<KeyReference>,
}

impl PendingRow {
    fn from_snapshot(row: &RowSnapshot) -> Self {
        Self {
            values: row
                .iter()
                .map(|(c, v)| (c.to_string(), v.clone()))
                .collect(),
            references: Vec::new(),
        }
    }

    fn clear_column(&mut self, column: &str) {
        self.values.retain(|(c, _)| c != column);
        for reference in &mut self.references {
            reference.columns.retain(|(local, _)| local != column);
        }
        self.references.retain(|r| !r.columns.is_empty());
    }

    fn set(&mut self, column: &str, value: Value) {
        self.clear_column(column);
        self.values.push((column.to_string(), value));
    }

    fn refer(&mut self, target: &ObjectIdentity, columns: Vec<(String, String)>) {
        for (local, _) in &columns {
            self.clear_column(local);
        }
        self.references.push(KeyReference {
            target: target.clone(),
            columns,
        });
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty() && self.references.is_empty()
    }

    fn into_parts(self) -> (RowSnapshot, Vec<KeyReference>) {
        (RowSnapshot::new(self.values), self.references)
    }
}

/// One row of a join table, as the endpoints it links.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JoinLink {
    table: &'static str,
    /// `(join column, endpoint key column, endpoint)`, sorted by join
    /// column so both ends of a relationship agree.
    ends: Vec<(&'static str, &'static str, ObjectIdentity)>,
}

impl JoinLink {
    fn new(join: &JoinTable, source: &ObjectIdentity, target: &ObjectIdentity) -> Self {
        let mut ends: Vec<_> = join
            .source
            .iter()
            .map(|(column, key)| (*column, *key, source.clone()))
            .chain(join.target.iter().map(|(column, key)| (*column, *key, target.clone())))
            .collect();
        ends.sort_by(|a, b| a.0.cmp(b.0));
        Self {
            table: join.table,
            ends,
        }
    }

    /// Identity of the stored row; `None` while an endpoint is temporary.
    fn stored_identity(&self) -> Option<ObjectIdentity> {
        let key = self
            .ends
            .iter()
            .map(|(column, key, end)| end.key_value(key).map(|v| (*column, v.clone())))
            .collect::<Option<Vec<_>>>()?;
        Some(ObjectIdentity::permanent(self.table, key))
    }
}

fn push_link(links: &mut Vec<JoinLink>, link: JoinLink) {
    if !links.contains(&link) {
        links.push(link);
    }
}

// ============================================================================
// Ordering
// ============================================================================

/// Order `nodes` so that every node comes after the nodes it depends on.
///
/// Dependencies outside `nodes` are ignored. On a cycle, returns the
/// identities along it.
pub(crate) fn topological_order(
    nodes: &[ObjectIdentity],
    depends_on: &HashMap<ObjectIdentity, Vec<ObjectIdentity>>,
) -> std::result::Result<Vec<ObjectIdentity>, Vec<ObjectIdentity>> {
    let members: HashSet<&ObjectIdentity> = nodes.iter().collect();
    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    let mut path = Vec::new();
    let mut order = Vec::with_capacity(nodes.len());

    for node in nodes {
        if !visited.contains(node) {
            visit(
                node,
                depends_on,
                &members,
                &mut visited,
                &mut stack,
                &mut path,
                &mut order,
            )?;
        }
    }
    Ok(order)
}

fn visit(
    node: &ObjectIdentity,
    depends_on: &HashMap<ObjectIdentity, Vec<ObjectIdentity>>,
    members: &HashSet<&ObjectIdentity>,
    visited: &mut HashSet<ObjectIdentity>,
    stack: &mut HashSet<ObjectIdentity>,
    path: &mut Vec<ObjectIdentity>,
    order: &mut Vec<ObjectIdentity>,
) -> std::result::Result<(), Vec<ObjectIdentity>> {
    visited.insert(node.clone());
    stack.insert(node.clone());
    path.push(node.clone());

    for dep in depends_on.get(node).into_iter().flatten() {
        if !members.contains(dep) {
            continue;
        }
        if stack.contains(dep) {
            // Report the cycle from its first occurrence, closed.
            let start = path.iter().position(|p| p == dep).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(dep.clone());
            return Err(cycle);
        }
        if !visited.contains(dep) {
            visit(dep, depends_on, members, visited, stack, path, order)?;
        }
    }

    stack.remove(node);
    path.pop();
    order.push(node.clone());
    Ok(())
}

// ============================================================================
// Planner
// ============================================================================

/// Builds a [`CommitPlan`] for a storage-bound commit.
pub(crate) struct FlushPlanner<'a> {
    graph: &'a IdentityGraph,
    registry: &'a EntityRegistry,
    executor: &'a dyn StorageExecutor,
}

/// Deletion candidates collected while expanding delete rules.
#[derive(Default)]
struct Deletion {
    doomed: Vec<DomainObject>,
    doomed_ids: HashSet<ObjectIdentity>,
    discarded: Vec<ObjectIdentity>,
    /// Reached through a CASCADE rule only.
    cascaded: Vec<DomainObject>,
    /// (dependent, foreign-key columns on the dependent)
    nullify: Vec<(DomainObject, Vec<&'static str>)>,
    /// (owner, relationship, dependents)
    deny: Vec<(ObjectIdentity, &'static str, Vec<ObjectIdentity>)>,
}

impl Deletion {
    fn doom(&mut self, object: DomainObject) {
        if object.identity().is_temporary() {
            if !self.discarded.contains(object.identity()) {
                self.discarded.push(object.identity().clone());
            }
        } else if self.doomed_ids.insert(object.identity().clone()) {
            self.doomed.push(object);
        }
    }

    fn is_gone(&self, identity: &ObjectIdentity) -> bool {
        self.doomed_ids.contains(identity) || self.discarded.contains(identity)
    }
}

impl<'a> FlushPlanner<'a> {
    pub(crate) fn new(
        graph: &'a IdentityGraph,
        registry: &'a EntityRegistry,
        executor: &'a dyn StorageExecutor,
    ) -> Self {
        Self {
            graph,
            registry,
            executor,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(changes = changes.len()))]
    pub(crate) fn plan(&self, changes: &ChangeDiff) -> Result<CommitPlan> {
        let deletion = self.expand_deletes(changes)?;

        let mut rows: HashMap<ObjectIdentity, PendingRow> = HashMap::new();
        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut indirect: Vec<ObjectIdentity> = Vec::new();
        let mut linked: Vec<JoinLink> = Vec::new();
        let mut unlinked: Vec<JoinLink> = Vec::new();

        for change in changes.of_category(ChangeCategory::Create) {
            if deletion.is_gone(&change.identity) {
                continue;
            }
            let object = self.graph.require(&change.identity)?;
            let mut row = PendingRow::from_snapshot(&object.to_row());
            for (index, rel) in object.descriptor().relationships().iter().enumerate() {
                if let Relation::ToOne(Fault::Resolved(target)) = object.relation_at(index) {
                    self.link(&mut row, rel.joins.iter().copied(), target.as_ref());
                    if rel.reverse.is_some() {
                        indirect.extend(target.iter().cloned());
                    }
                }
            }
            rows.insert(change.identity.clone(), row);
            creates.push(change.identity.clone());
        }

        for change in changes.of_category(ChangeCategory::Update) {
            if deletion.is_gone(&change.identity) {
                continue;
            }
            let object = self.graph.require(&change.identity)?;
            let descriptor = object.descriptor();
            let mut row = PendingRow::default();
            for delta in &change.attributes {
                let index = descriptor.require_attribute(&delta.attribute)?;
                let column = descriptor.attributes()[index].column;
                row.set(column, object.values()[index].clone());
            }
            for delta in &change.relationships {
                let (index, rel) = descriptor.require_relationship(&delta.relationship)?;
                if let RelationshipChange::ToOne { old, new } = &delta.change {
                    if let Relation::ToOne(Fault::Resolved(target)) = object.relation_at(index) {
                        self.link(&mut row, rel.joins.iter().copied(), target.as_ref());
                    }
                    if rel.reverse.is_some() {
                        indirect.extend(old.iter().chain(new.iter()).cloned());
                    }
                }
            }
            rows.insert(change.identity.clone(), row);
            updates.push(change.identity.clone());
        }

        // Foreign keys implied by to-many edits live on the member rows.
        for change in changes.iter() {
            if change.category == ChangeCategory::Delete || deletion.is_gone(&change.identity) {
                continue;
            }
            let owner = self.graph.require(&change.identity)?;
            for delta in &change.relationships {
                let RelationshipChange::ToMany { added, removed } = &delta.change else {
                    continue;
                };
                let (_, rel) = owner.descriptor().require_relationship(&delta.relationship)?;
                indirect.push(change.identity.clone());
                let moves = removed
                    .iter()
                    .map(|t| (t, false))
                    .chain(added.iter().map(|t| (t, true)));
                if let Some(join) = &rel.through {
                    for (member, is_added) in moves {
                        if deletion.is_gone(member) {
                            continue;
                        }
                        indirect.push(member.clone());
                        let link = JoinLink::new(join, &change.identity, member);
                        push_link(if is_added { &mut linked } else { &mut unlinked }, link);
                    }
                    continue;
                }
                for (member, is_added) in moves {
                    if deletion.is_gone(member) {
                        continue;
                    }
                    let Some(member_object) = self.graph.lookup(member) else {
                        tracing::warn!(%member, owner = %change.identity, "Collection member is not registered; skipping");
                        continue;
                    };
                    let row = rows.entry(member.clone()).or_insert_with(|| {
                        updates.push(member.clone());
                        PendingRow::default()
                    });
                    let reverse = rel
                        .reverse
                        .and_then(|name| member_object.descriptor().require_relationship(name).ok())
                        .filter(|(_, r)| r.kind == RelationshipKind::ToOne);
                    match reverse {
                        Some((index, reverse_rel)) => {
                            if let Relation::ToOne(Fault::Resolved(target)) = member_object.relation_at(index) {
                                self.link(row, reverse_rel.joins.iter().copied(), target.as_ref());
                            }
                        }
                        None => {
                            let joins = rel.joins.iter().map(|(owner_col, member_col)| (*member_col, *owner_col));
                            let target = is_added.then_some(&change.identity);
                            self.link(row, joins, target);
                        }
                    }
                }
            }
        }

        let mut external = Vec::new();
        let mut external_ops = Vec::new();
        for (dependent, columns) in &deletion.nullify {
            let identity = dependent.identity();
            if deletion.is_gone(identity) {
                continue;
            }
            if self.graph.contains(identity) {
                let row = rows.entry(identity.clone()).or_insert_with(|| {
                    updates.push(identity.clone());
                    PendingRow::default()
                });
                for column in columns {
                    row.set(column, Value::Null);
                }
            } else {
                let nulls = RowSnapshot::new(columns.iter().map(|c| (*c, Value::Null)));
                let base = dependent.snapshot().cloned().unwrap_or_default();
                external_ops.push(DiffOp::Update {
                    identity: identity.clone(),
                    values: nulls.clone(),
                    references: Vec::new(),
                    expected: expected_values(dependent),
                });
                external.push((identity.clone(), base.merged(&nulls)));
            }
        }

        // Inserts: parents first.
        let mut insert_deps: HashMap<ObjectIdentity, Vec<ObjectIdentity>> = HashMap::new();
        for identity in &creates {
            if let Some(row) = rows.get(identity) {
                let targets = row
                    .references
                    .iter()
                    .filter(|r| r.target.is_temporary())
                    .map(|r| r.target.clone())
                    .collect();
                insert_deps.insert(identity.clone(), targets);
            }
        }
        let insert_order = topological_order(&creates, &insert_deps)
            .map_err(|identities| Error::DependencyCycle { identities })?;

        let mut diff = OrderedDiff::new();
        for identity in &insert_order {
            let Some(row) = rows.remove(identity) else {
                continue;
            };
            let (values, references) = row.into_parts();
            diff.push(DiffOp::Insert {
                identity: identity.clone(),
                values,
                references,
            });
        }
        // Join rows after both of their endpoints.
        for link in &linked {
            if unlinked.contains(link) {
                tracing::warn!(table = link.table, "Join row both added and removed; skipping");
                continue;
            }
            diff.push(self.join_insert(link));
        }

        let mut updated = Vec::new();
        for identity in updates {
            let Some(row) = rows.remove(&identity) else {
                continue;
            };
            if row.is_empty() {
                continue;
            }
            let object = self.graph.require(&identity)?;
            let (values, references) = row.into_parts();
            diff.push(DiffOp::Update {
                identity: identity.clone(),
                values,
                references,
                expected: expected_values(object),
            });
            updated.push(identity);
        }
        for op in external_ops {
            diff.push(op);
        }

        // Join rows before the rows they link.
        for link in &unlinked {
            if linked.contains(link) || link.ends.iter().any(|(_, _, end)| deletion.is_gone(end)) {
                continue;
            }
            if let Some(identity) = link.stored_identity() {
                diff.push(DiffOp::Delete {
                    identity,
                    expected: None,
                });
            }
        }
        for link in self.stored_links(&deletion.doomed)? {
            indirect.extend(link.ends.iter().map(|(_, _, end)| end.clone()));
            if let Some(identity) = link.stored_identity() {
                diff.push(DiffOp::Delete {
                    identity,
                    expected: None,
                });
            }
        }

        let delete_order = delete_order(&deletion.doomed);
        for identity in &delete_order {
            let expected = deletion
                .doomed
                .iter()
                .find(|o| o.identity() == identity)
                .and_then(expected_values);
            diff.push(DiffOp::Delete {
                identity: identity.clone(),
                expected,
            });
        }
        for object in &deletion.doomed {
            for (index, rel) in object.descriptor().relationships().iter().enumerate() {
                if rel.kind == RelationshipKind::ToOne && rel.reverse.is_some() {
                    indirect.extend(object.relation_at(index).targets());
                }
            }
        }

        let mut indirectly_modified = Vec::new();
        for identity in indirect {
            if !deletion.is_gone(&identity) && !indirectly_modified.contains(&identity) {
                indirectly_modified.push(identity);
            }
        }

        let (inserts, update_count, deletes) = diff.counts();
        tracing::debug!(
            inserts,
            updates = update_count,
            deletes,
            discarded = deletion.discarded.len(),
            "Commit plan ready"
        );

        Ok(CommitPlan {
            diff,
            inserted: insert_order,
            updated,
            deleted: delete_order,
            discarded: deletion.discarded,
            cascaded: deletion.cascaded,
            external,
            indirectly_modified,
        })
    }

    fn join_insert(&self, link: &JoinLink) -> DiffOp {
        let mut row = PendingRow::default();
        let mut endpoints: Vec<&ObjectIdentity> = Vec::new();
        for (_, _, end) in &link.ends {
            if !endpoints.contains(&end) {
                endpoints.push(end);
            }
        }
        for end in endpoints {
            let joins = link
                .ends
                .iter()
                .filter(|(_, _, e)| e == end)
                .map(|(column, key, _)| (*column, *key));
            self.link(&mut row, joins, Some(end));
        }
        let (values, references) = row.into_parts();
        DiffOp::Insert {
            identity: ObjectIdentity::temporary(link.table),
            values,
            references,
        }
    }

    /// Stored join rows touching any of `doomed`, each once.
    fn stored_links(&self, doomed: &[DomainObject]) -> Result<Vec<JoinLink>> {
        let mut links: Vec<JoinLink> = Vec::new();
        for object in doomed {
            for rel in object.descriptor().relationships() {
                let Some(join) = &rel.through else {
                    continue;
                };
                let Some(key) = object.identity().key_tuple(&rel.source_columns()) else {
                    continue;
                };
                let target_root = self.registry.descriptor(rel.target)?.root();
                let target_columns = rel.target_columns();
                for (_, target_key) in fetch_links(self.executor, join, vec![key])? {
                    let target = ObjectIdentity::permanent(
                        target_root,
                        target_columns.iter().copied().zip(target_key),
                    );
                    push_link(&mut links, JoinLink::new(join, object.identity(), &target));
                }
            }
        }
        Ok(links)
    }

    /// Collect explicit deletes and everything their delete rules reach.
    fn expand_deletes(&self, changes: &ChangeDiff) -> Result<Deletion> {
        let mut deletion = Deletion::default();
        for change in changes.of_category(ChangeCategory::Delete) {
            let object = self.graph.require(&change.identity)?;
            deletion.doom(object.clone());
        }

        let mut cursor = 0;
        while cursor < deletion.doomed.len() {
            let owner = deletion.doomed[cursor].clone();
            cursor += 1;
            for (index, rel) in owner.descriptor().relationships().iter().enumerate() {
                if rel.delete_rule == DeleteRule::NoAction {
                    continue;
                }
                let dependents = self.dependents(&owner, index, rel)?;
                match rel.delete_rule {
                    DeleteRule::Cascade => {
                        for dependent in dependents {
                            if !deletion.is_gone(dependent.identity()) {
                                deletion.cascaded.push(dependent.clone());
                            }
                            deletion.doom(dependent);
                        }
                    }
                    // Join rows go with their endpoints; no column to clear.
                    DeleteRule::Nullify if rel.is_flattened() => {}
                    DeleteRule::Nullify if rel.is_to_many() => {
                        let columns = rel.target_columns();
                        for dependent in dependents {
                            deletion.nullify.push((dependent, columns.clone()));
                        }
                    }
                    DeleteRule::Deny => {
                        let ids = dependents.iter().map(|d| d.identity().clone()).collect();
                        deletion.deny.push((owner.identity().clone(), rel.name, ids));
                    }
                    _ => {}
                }
            }
        }

        for (identity, relationship, dependents) in &deletion.deny {
            let blocking = dependents.iter().filter(|d| !deletion.is_gone(d)).count();
            if blocking > 0 {
                return Err(Error::DeleteRuleViolation {
                    identity: identity.clone(),
                    relationship: (*relationship).to_string(),
                    dependents: blocking,
                });
            }
        }
        Ok(deletion)
    }

    /// Objects on the far side of `rel`, from memory when resolved and from
    /// storage otherwise.
    fn dependents(
        &self,
        owner: &DomainObject,
        index: usize,
        rel: &RelationshipInfo,
    ) -> Result<Vec<DomainObject>> {
        let mut found: Vec<DomainObject> = Vec::new();
        if let Some(targets) = resolved_targets(owner.relation_at(index)) {
            for target in targets {
                match self.graph.lookup(&target) {
                    Some(object) => found.push(object.clone()),
                    None => found.extend(self.fetch_by_key(rel.target, &target)?),
                }
            }
            return Ok(found);
        }

        // Unresolved to-many: ask storage, then reconcile with local edits.
        let Some(key) = owner.identity().key_tuple(&rel.source_columns()) else {
            return Ok(found);
        };
        let tuples = match &rel.through {
            Some(join) => fetch_links(self.executor, join, vec![key])?
                .into_iter()
                .map(|(_, target)| target)
                .collect(),
            None => vec![key],
        };
        if tuples.is_empty() {
            return Ok(self.local_members(owner, rel, found));
        }
        let target = self.registry.descriptor(rel.target)?;
        let mut qualifier = Qualifier::KeysIn {
            columns: rel.target_columns().iter().map(ToString::to_string).collect(),
            tuples,
        };
        if let Some((column, values)) = target.variant_filter() {
            qualifier = qualifier.and(Qualifier::In(column.to_string(), values));
        }
        let query = QueryDescriptor::new(target.root()).qualifier(qualifier);
        let reverse = rel.reverse;
        for row in self.executor.fetch(&query)? {
            let descriptor = self.registry.resolve_variant(rel.target, &row)?;
            let Some(identity) = identity_for_row(&descriptor, &row) else {
                continue;
            };
            match self.graph.lookup(&identity) {
                Some(local) if !local.points_at(reverse, owner.identity()).unwrap_or(true) => {}
                Some(local) => found.push(local.clone()),
                None => found.push(DomainObject::from_row(identity, descriptor, row)),
            }
        }
        Ok(self.local_members(owner, rel, found))
    }

    /// Add new local members that storage does not know about yet.
    fn local_members(
        &self,
        owner: &DomainObject,
        rel: &RelationshipInfo,
        mut found: Vec<DomainObject>,
    ) -> Vec<DomainObject> {
        for local in self.graph.iter() {
            if local.descriptor().is_a(rel.target)
                && local.points_at(rel.reverse, owner.identity()) == Some(true)
                && !found.iter().any(|f| f.identity() == local.identity())
            {
                found.push(local.clone());
            }
        }
        found
    }

    fn fetch_by_key(&self, entity: &str, identity: &ObjectIdentity) -> Result<Vec<DomainObject>> {
        let descriptor = self.registry.descriptor(entity)?;
        let Some(key) = identity.key() else {
            return Ok(Vec::new());
        };
        let qualifier = Qualifier::KeysIn {
            columns: key.iter().map(|(c, _)| c.clone()).collect(),
            tuples: vec![key.iter().map(|(_, v)| v.clone()).collect()],
        };
        let query = QueryDescriptor::new(descriptor.root()).qualifier(qualifier);
        let mut objects = Vec::new();
        for row in self.executor.fetch(&query)? {
            let variant = self.registry.resolve_variant(entity, &row)?;
            if let Some(id) = identity_for_row(&variant, &row) {
                objects.push(DomainObject::from_row(id, variant, row));
            }
        }
        Ok(objects)
    }

    /// Bind `joins` (local column, target column) to `target`'s key.
    fn link<'j>(
        &self,
        row: &mut PendingRow,
        joins: impl Iterator<Item = (&'j str, &'j str)>,
        target: Option<&ObjectIdentity>,
    ) {
        let joins: Vec<(&str, &str)> = joins.collect();
        match target {
            None => {
                for (local, _) in joins {
                    row.set(local, Value::Null);
                }
            }
            Some(target) if target.is_temporary() => {
                let columns = joins
                    .iter()
                    .map(|(l, r)| ((*l).to_string(), (*r).to_string()))
                    .collect();
                row.refer(target, columns);
            }
            Some(target) => {
                for (local, remote) in joins {
                    let value = match target.key_value(remote) {
                        Some(value) => value.clone(),
                        None => self
                            .graph
                            .lookup(target)
                            .map(|o| o.to_row().get_or_null(remote).clone())
                            .unwrap_or(Value::Null),
                    };
                    row.set(local, value);
                }
            }
        }
    }
}

fn resolved_targets(relation: &Relation) -> Option<Vec<ObjectIdentity>> {
    match relation {
        Relation::ToOne(Fault::Resolved(target)) => Some(target.iter().cloned().collect()),
        Relation::ToMany(Fault::Resolved(targets)) => Some(targets.clone()),
        _ => None,
    }
}

/// Last known values of the locking columns, for optimistic entities.
fn expected_values(object: &DomainObject) -> Option<RowSnapshot> {
    let descriptor = object.descriptor();
    if descriptor.locking() != LockingStrategy::Optimistic {
        return None;
    }
    let snapshot = object.snapshot()?;
    Some(RowSnapshot::new(
        descriptor
            .locking_columns()
            .into_iter()
            .map(|c| (c, snapshot.get_or_null(c).clone())),
    ))
}

/// Dependents before the rows they reference.
fn delete_order(doomed: &[DomainObject]) -> Vec<ObjectIdentity> {
    let ids: Vec<ObjectIdentity> = doomed.iter().map(|o| o.identity().clone()).collect();
    let mut after: HashMap<ObjectIdentity, Vec<ObjectIdentity>> = HashMap::new();
    for object in doomed {
        for (index, rel) in object.descriptor().relationships().iter().enumerate() {
            if rel.kind != RelationshipKind::ToOne {
                continue;
            }
            for target in object.relation_at(index).targets() {
                if &target != object.identity() {
                    after.entry(target).or_default().push(object.identity().clone());
                }
            }
        }
    }
    match topological_order(&ids, &after) {
        Ok(order) => order,
        Err(cycle) => {
            tracing::warn!(?cycle, "Reference cycle among deleted rows; deleting in discovery order");
            ids
        }
    }
}
