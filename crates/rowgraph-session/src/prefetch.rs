//! Selects with prefetched relationship subgraphs.
//!
//! A [`SelectQuery`] names a root entity, a qualifier, an optional fetch
//! limit and a tree of [`PrefetchNode`]s. Each node resolves one
//! relationship of its parent level:
//!
//! - **JOINT**: satellite columns ride in the root fetch as namespaced
//!   columns of wide rows; no extra fetch.
//! - **DISJOINT_BY_ID**: one extra fetch per node, keyed by the batched
//!   source key tuples of the parent level.
//! - **PHANTOM** / **NONE**: the node is only a stepping stone to deeper
//!   prefetches; the relationship itself stays unresolved.
//!
//! JOINT and DISJOINT_BY_ID build the same graph for the same logical query
//! and differ only in how many fetches reach storage.
//!
//! A relationship flattened over a join table costs one more fetch for the
//! join rows. JOINT falls back to DISJOINT_BY_ID for such relationships.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use rowgraph_core::{
    EntityDescriptor, EntityRegistry, JoinTable, JointPath, NAMESPACE_SEPARATOR, ObjectIdentity,
    PrefetchResolutionError, Qualifier, QueryDescriptor, RelationshipInfo, Result, RowSnapshot,
    StorageExecutor, Value,
};

use crate::identity_graph::IdentityGraph;
use crate::object::{DomainObject, Fault, Relation, identity_for_row};

// ============================================================================
// Query
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefetchSemantics {
    Joint,
    DisjointById,
    #[default]
    Phantom,
    None,
}

/// One relationship in a prefetch tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchNode {
    semantics: PrefetchSemantics,
    children: BTreeMap<String, PrefetchNode>,
}

impl PrefetchNode {
    pub fn new(semantics: PrefetchSemantics) -> Self {
        Self {
            semantics,
            children: BTreeMap::new(),
        }
    }

    /// Add a dotted relationship path. Missing intermediate nodes are
    /// created as PHANTOM; the last segment gets `semantics`.
    pub fn add_path(&mut self, path: &str, semantics: PrefetchSemantics) {
        let mut node = self;
        let mut segments = path.split(NAMESPACE_SEPARATOR).filter(|s| !s.is_empty()).peekable();
        while let Some(segment) = segments.next() {
            node = node
                .children
                .entry(segment.to_string())
                .or_insert_with(|| PrefetchNode::new(PrefetchSemantics::Phantom));
            if segments.peek().is_none() {
                node.semantics = semantics;
            }
        }
    }

    pub fn semantics(&self) -> PrefetchSemantics {
        self.semantics
    }

    pub fn child(&self, name: &str) -> Option<&PrefetchNode> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &PrefetchNode)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Root query plus prefetch tree.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    entity: String,
    qualifier: Qualifier,
    fetch_limit: Option<usize>,
    prefetch: PrefetchNode,
}

impl SelectQuery {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: Qualifier::All,
            fetch_limit: None,
            prefetch: PrefetchNode::default(),
        }
    }

    /// Narrow the root rows; repeated calls combine with AND.
    pub fn filter(mut self, qualifier: Qualifier) -> Self {
        self.qualifier = std::mem::replace(&mut self.qualifier, Qualifier::All).and(qualifier);
        self
    }

    /// Maximum number of root objects. Never limits prefetched satellites.
    pub fn limit(mut self, limit: usize) -> Self {
        self.fetch_limit = Some(limit);
        self
    }

    pub fn prefetch(mut self, path: &str, semantics: PrefetchSemantics) -> Self {
        self.prefetch.add_path(path, semantics);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn qualifier(&self) -> &Qualifier {
        &self.qualifier
    }

    pub fn fetch_limit(&self) -> Option<usize> {
        self.fetch_limit
    }

    pub fn prefetch_tree(&self) -> &PrefetchNode {
        &self.prefetch
    }
}

/// Outcome of a select.
#[derive(Debug, Clone, Default)]
pub struct SelectResult {
    /// Root objects in fetch order.
    pub objects: Vec<ObjectIdentity>,
    /// Satellite rows that could not be attached; the rest of the graph is
    /// resolved regardless.
    pub prefetch_errors: Vec<PrefetchResolutionError>,
}

impl SelectResult {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// What a resolver run produced.
#[derive(Debug, Default)]
pub(crate) struct Resolution {
    pub(crate) roots: Vec<ObjectIdentity>,
    /// Every object (re)loaded from a row, roots and satellites.
    pub(crate) loaded: Vec<ObjectIdentity>,
    /// Rows read, for the snapshot store.
    pub(crate) rows: Vec<(ObjectIdentity, RowSnapshot)>,
    pub(crate) errors: Vec<PrefetchResolutionError>,
}

/// Fetches a root query and wires its prefetch tree into an identity graph.
pub(crate) struct PrefetchResolver<'a> {
    registry: &'a EntityRegistry,
    graph: &'a mut IdentityGraph,
    executor: &'a dyn StorageExecutor,
    seen: HashSet<ObjectIdentity>,
    out: Resolution,
}

impl<'a> PrefetchResolver<'a> {
    pub(crate) fn new(
        registry: &'a EntityRegistry,
        graph: &'a mut IdentityGraph,
        executor: &'a dyn StorageExecutor,
    ) -> Self {
        Self {
            registry,
            graph,
            executor,
            seen: HashSet::new(),
            out: Resolution::default(),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(entity = query.entity()))]
    pub(crate) fn select(mut self, query: &SelectQuery) -> Result<Resolution> {
        let descriptor = self.registry.descriptor(query.entity())?;
        let mut qualifier = query.qualifier().clone();
        if let Some((column, values)) = descriptor.variant_filter() {
            qualifier = qualifier.and(Qualifier::In(column.to_string(), values));
        }
        let joint = self.joint_paths(&descriptor, "", query.prefetch_tree())?;
        let fetch = QueryDescriptor {
            entity: descriptor.root().to_string(),
            qualifier,
            fetch_limit: query.fetch_limit(),
            joint,
        };
        let rows = self.executor.fetch(&fetch)?;
        tracing::debug!(rows = rows.len(), "Root rows fetched");

        let roots = self.resolve_level(&descriptor, "", &rows, query.prefetch_tree())?;
        self.out.roots = roots;
        Ok(self.out)
    }

    /// JOINT descendants of `node`, namespaced under `prefix`.
    fn joint_paths(
        &self,
        descriptor: &EntityDescriptor,
        prefix: &str,
        node: &PrefetchNode,
    ) -> Result<Vec<JointPath>> {
        let mut paths = Vec::new();
        for (name, child) in node.children() {
            if child.semantics() != PrefetchSemantics::Joint {
                continue;
            }
            let (_, rel) = descriptor.require_relationship(name)?;
            // Resolved disjointly in resolve_level.
            if rel.is_flattened() {
                continue;
            }
            let target = self.registry.descriptor(rel.target)?;
            let path = join_path(prefix, name);
            paths.push(JointPath {
                path: path.clone(),
                parent: prefix.to_string(),
                target: target.root().to_string(),
                joins: rel
                    .joins
                    .iter()
                    .map(|(s, t)| ((*s).to_string(), (*t).to_string()))
                    .collect(),
                to_many: rel.is_to_many(),
                target_filter: variant_qualifier(&target),
            });
            paths.extend(self.joint_paths(&target, &path, child)?);
        }
        Ok(paths)
    }

    /// Materialize one level of (possibly wide) rows and resolve its
    /// prefetch children. Returns the distinct objects of this level.
    fn resolve_level(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        path: &str,
        rows: &[RowSnapshot],
        node: &PrefetchNode,
    ) -> Result<Vec<ObjectIdentity>> {
        let mut ordered: Vec<ObjectIdentity> = Vec::new();
        let mut wide: HashMap<ObjectIdentity, Vec<&RowSnapshot>> = HashMap::new();
        let mut level_rows: HashMap<ObjectIdentity, RowSnapshot> = HashMap::new();

        for row in rows {
            let root = row.root_columns();
            let Some((variant, identity)) = self.row_identity(descriptor.name(), &root)? else {
                continue;
            };
            if !wide.contains_key(&identity) {
                ordered.push(identity.clone());
                self.materialize(&identity, variant, root.clone());
                level_rows.insert(identity.clone(), root);
            }
            wide.entry(identity).or_default().push(row);
        }

        if ordered.is_empty() {
            return Ok(ordered);
        }

        for (name, child) in node.children() {
            let (_, rel) = descriptor.require_relationship(name)?;
            let child_path = join_path(path, name);
            match child.semantics() {
                PrefetchSemantics::Joint if rel.is_flattened() => {
                    tracing::trace!(path = %child_path, "Joint prefetch over a join table runs disjointly");
                    self.resolve_disjoint(&ordered, &level_rows, &child_path, rel, child, true)?;
                }
                PrefetchSemantics::Joint => {
                    let target = self.registry.descriptor(rel.target)?;
                    let mut satellites: Vec<RowSnapshot> = Vec::new();
                    let mut per_root: Vec<(ObjectIdentity, Vec<ObjectIdentity>)> = Vec::new();
                    for owner in &ordered {
                        let mut members = Vec::new();
                        for row in wide.get(owner).into_iter().flatten() {
                            let satellite = row.namespace(name);
                            if let Some((_, id)) = self.row_identity(rel.target, &satellite.root_columns())? {
                                if !members.contains(&id) {
                                    members.push(id);
                                }
                            }
                            satellites.push(satellite);
                        }
                        per_root.push((owner.clone(), members));
                    }
                    self.resolve_level(&target, &child_path, &satellites, child)?;
                    for (owner, members) in per_root {
                        self.attach(&owner, name, rel, members);
                    }
                }
                PrefetchSemantics::DisjointById => {
                    self.resolve_disjoint(&ordered, &level_rows, &child_path, rel, child, true)?;
                }
                PrefetchSemantics::Phantom | PrefetchSemantics::None => {
                    if !child.is_leaf() {
                        self.resolve_disjoint(&ordered, &level_rows, &child_path, rel, child, false)?;
                    }
                }
            }
        }
        Ok(ordered)
    }

    /// One batched fetch of the satellites of `owners` through `rel`, after
    /// one fetch of join rows when `rel` is flattened.
    fn resolve_disjoint(
        &mut self,
        owners: &[ObjectIdentity],
        owner_rows: &HashMap<ObjectIdentity, RowSnapshot>,
        path: &str,
        rel: &RelationshipInfo,
        node: &PrefetchNode,
        wire: bool,
    ) -> Result<()> {
        let source_columns = rel.source_columns();
        let target_columns = rel.target_columns();
        let mut owner_keys: Vec<(ObjectIdentity, Option<Vec<Value>>)> = Vec::with_capacity(owners.len());
        let mut tuples: Vec<Vec<Value>> = Vec::new();
        for owner in owners {
            let key = owner_rows
                .get(owner)
                .and_then(|row| row.tuple(&source_columns))
                .filter(|t| t.iter().all(|v| !v.is_null()));
            if let Some(tuple) = &key {
                if !tuples.contains(tuple) {
                    tuples.push(tuple.clone());
                }
            }
            owner_keys.push((owner.clone(), key));
        }

        let links = match &rel.through {
            Some(join) if !tuples.is_empty() => Some(fetch_links(self.executor, join, tuples.clone())?),
            _ => None,
        };
        let lookup = match &links {
            Some(links) => {
                let mut targets: Vec<Vec<Value>> = Vec::new();
                for (_, target) in links {
                    if !targets.contains(target) {
                        targets.push(target.clone());
                    }
                }
                targets
            }
            None => tuples.clone(),
        };

        let mut grouped: HashMap<Vec<Value>, Vec<ObjectIdentity>> = HashMap::new();
        if !lookup.is_empty() {
            let target = self.registry.descriptor(rel.target)?;
            let mut qualifier = Qualifier::KeysIn {
                columns: target_columns.iter().map(ToString::to_string).collect(),
                tuples: lookup,
            };
            if let Some((column, values)) = target.variant_filter() {
                qualifier = qualifier.and(Qualifier::In(column.to_string(), values));
            }
            let fetch = QueryDescriptor {
                entity: target.root().to_string(),
                qualifier,
                fetch_limit: None,
                joint: self.joint_paths(&target, "", node)?,
            };
            let rows = self.executor.fetch(&fetch)?;
            tracing::debug!(path, rows = rows.len(), "Satellite rows fetched");
            self.resolve_level(&target, path, &rows, node)?;

            for row in &rows {
                let root = row.root_columns();
                let Some((_, id)) = self.row_identity(rel.target, &root)? else {
                    continue;
                };
                let Some(tuple) = root.tuple(&target_columns) else {
                    continue;
                };
                if let Some(links) = &links {
                    for (source, _) in links.iter().filter(|(_, t)| *t == tuple) {
                        let members = grouped.entry(source.clone()).or_default();
                        if !members.contains(&id) {
                            members.push(id.clone());
                        }
                    }
                    continue;
                }
                if !tuples.contains(&tuple) {
                    let message = format!("satellite {id} matches no fetched root");
                    tracing::warn!(path, %id, "Orphan satellite row during prefetch");
                    self.out.errors.push(PrefetchResolutionError {
                        path: path.to_string(),
                        root: None,
                        message,
                    });
                    continue;
                }
                let members = grouped.entry(tuple).or_default();
                if !members.contains(&id) {
                    members.push(id);
                }
            }
        }

        if wire {
            let name = path.rsplit(NAMESPACE_SEPARATOR).next().unwrap_or(path);
            for (owner, key) in owner_keys {
                let members = key.and_then(|k| grouped.get(&k).cloned()).unwrap_or_default();
                self.attach(&owner, name, rel, members);
            }
        }
        Ok(())
    }

    fn row_identity(
        &self,
        entity: &str,
        row: &RowSnapshot,
    ) -> Result<Option<(Arc<EntityDescriptor>, ObjectIdentity)>> {
        let variant = self.registry.resolve_variant(entity, row)?;
        Ok(identity_for_row(&variant, row).map(|id| (variant, id)))
    }

    /// Register or refresh one object. Objects with local changes keep them.
    fn materialize(&mut self, identity: &ObjectIdentity, variant: Arc<EntityDescriptor>, row: RowSnapshot) {
        self.out.rows.push((identity.clone(), row.clone()));
        match self.graph.lookup_mut(identity) {
            Some(object) if object.state().is_dirty() => return,
            Some(object) => {
                object.set_descriptor(variant);
                object.load_row(row);
            }
            None => {
                self.graph.register(DomainObject::from_row(identity.clone(), variant, row));
            }
        }
        if self.seen.insert(identity.clone()) {
            self.out.loaded.push(identity.clone());
        }
    }

    /// Mark `name` resolved on `owner`, unless local edits already own it.
    /// To-many members follow unsaved reverse edits in the graph.
    fn attach(
        &mut self,
        owner: &ObjectIdentity,
        name: &str,
        rel: &RelationshipInfo,
        mut members: Vec<ObjectIdentity>,
    ) {
        if rel.is_to_many() {
            self.graph.reconcile_members(owner, rel, &mut members);
        }
        let Some(object) = self.graph.lookup_mut(owner) else {
            return;
        };
        let Some(index) = object.descriptor().relationship_index(name) else {
            return;
        };
        if object.state().is_dirty() && object.relation_at(index).is_resolved() {
            return;
        }
        let relation = if rel.is_to_many() {
            Relation::ToMany(Fault::Resolved(members))
        } else {
            Relation::ToOne(Fault::Resolved(members.into_iter().next()))
        };
        object.set_relation(index, relation);
    }
}

/// Join rows linking any of the `sources` key tuples, as `(source key,
/// target key)` pairs in storage order.
pub(crate) fn fetch_links(
    executor: &dyn StorageExecutor,
    join: &JoinTable,
    sources: Vec<Vec<Value>>,
) -> Result<Vec<(Vec<Value>, Vec<Value>)>> {
    let source_columns: Vec<&str> = join.source.iter().map(|(c, _)| *c).collect();
    let target_columns: Vec<&str> = join.target.iter().map(|(c, _)| *c).collect();
    let query = QueryDescriptor::new(join.table).qualifier(Qualifier::KeysIn {
        columns: source_columns.iter().map(ToString::to_string).collect(),
        tuples: sources,
    });
    let rows = executor.fetch(&query)?;
    tracing::trace!(table = join.table, rows = rows.len(), "Join rows fetched");
    Ok(rows
        .iter()
        .filter_map(|row| Some((row.tuple(&source_columns)?, row.tuple(&target_columns)?)))
        .collect())
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}{NAMESPACE_SEPARATOR}{name}")
    }
}

fn variant_qualifier(descriptor: &EntityDescriptor) -> Qualifier {
    match descriptor.variant_filter() {
        Some((column, values)) => Qualifier::In(column.to_string(), values),
        None => Qualifier::All,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::{AttributeInfo, EntityInfo, PersistenceState, RelationshipInfo};
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

    fn fixture() -> (EntityRegistry, MemoryStorage) {
        let registry = EntityRegistry::new(&[&ARTIST, &PAINTING]).unwrap();
        let storage = MemoryStorage::new();
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
                [
                    row(&[("id", Value::BigInt(10)), ("title", Value::from("Irises")), ("artist_id", Value::BigInt(1))]),
                    row(&[("id", Value::BigInt(11)), ("title", Value::from("Poppies")), ("artist_id", Value::BigInt(1))]),
                ],
            )
            .unwrap();
        (registry, storage)
    }

    fn artist(n: i64) -> ObjectIdentity {
        ObjectIdentity::single("Artist", "id", n)
    }

    #[test]
    fn test_add_path_creates_phantom_intermediates() {
        let mut root = PrefetchNode::default();
        root.add_path("paintings.gallery", PrefetchSemantics::Joint);
        let paintings = root.child("paintings").unwrap();
        assert_eq!(paintings.semantics(), PrefetchSemantics::Phantom);
        assert_eq!(paintings.child("gallery").unwrap().semantics(), PrefetchSemantics::Joint);

        root.add_path("paintings", PrefetchSemantics::DisjointById);
        assert_eq!(root.child("paintings").unwrap().semantics(), PrefetchSemantics::DisjointById);
        assert!(root.child("paintings").unwrap().child("gallery").is_some());
    }

    #[test]
    fn test_disjoint_groups_satellites_by_key() {
        let (registry, storage) = fixture();
        let mut graph = IdentityGraph::new();
        let query = SelectQuery::new("Artist").prefetch("paintings", PrefetchSemantics::DisjointById);
        let resolution = PrefetchResolver::new(&registry, &mut graph, &storage).select(&query).unwrap();

        assert_eq!(resolution.roots, vec![artist(1), artist(2)]);
        assert_eq!(storage.fetch_count(), 2);
        assert_eq!(graph.require(&artist(1)).unwrap().relation("paintings").unwrap().targets().len(), 2);
        assert_eq!(
            graph.require(&artist(2)).unwrap().relation("paintings").unwrap(),
            &Relation::ToMany(Fault::Resolved(Vec::new()))
        );
        assert_eq!(resolution.loaded.len(), 4);
    }

    #[test]
    fn test_joint_uses_one_fetch() {
        let (registry, storage) = fixture();
        let mut graph = IdentityGraph::new();
        let query = SelectQuery::new("Artist").prefetch("paintings", PrefetchSemantics::Joint);
        let resolution = PrefetchResolver::new(&registry, &mut graph, &storage).select(&query).unwrap();

        assert_eq!(storage.fetch_count(), 1);
        assert_eq!(resolution.roots.len(), 2);
        assert_eq!(graph.require(&artist(1)).unwrap().relation("paintings").unwrap().targets().len(), 2);
        assert!(graph.require(&artist(2)).unwrap().relation("paintings").unwrap().is_resolved());
    }

    #[test]
    fn test_phantom_leaf_fetches_nothing() {
        let (registry, storage) = fixture();
        let mut graph = IdentityGraph::new();
        let query = SelectQuery::new("Artist").prefetch("paintings", PrefetchSemantics::Phantom);
        PrefetchResolver::new(&registry, &mut graph, &storage).select(&query).unwrap();
        assert_eq!(storage.fetch_count(), 1);
        assert!(!graph.require(&artist(1)).unwrap().relation("paintings").unwrap().is_resolved());
    }

    #[test]
    fn test_phantom_intermediate_reaches_deeper_nodes() {
        let (registry, storage) = fixture();
        let mut graph = IdentityGraph::new();
        let query = SelectQuery::new("Artist")
            .filter(Qualifier::Eq("id".into(), Value::BigInt(1)))
            .prefetch("paintings.artist", PrefetchSemantics::DisjointById);
        PrefetchResolver::new(&registry, &mut graph, &storage).select(&query).unwrap();

        let monet = graph.require(&artist(1)).unwrap();
        assert!(!monet.relation("paintings").unwrap().is_resolved());
        let irises = graph.require(&ObjectIdentity::single("Painting", "id", 10_i64)).unwrap();
        assert_eq!(irises.relation("artist").unwrap().targets(), vec![artist(1)]);
    }

    #[test]
    fn test_empty_root_set_skips_satellite_fetch() {
        let (registry, storage) = fixture();
        let mut graph = IdentityGraph::new();
        let query = SelectQuery::new("Artist")
            .filter(Qualifier::Eq("name".into(), Value::from("Nobody")))
            .prefetch("paintings", PrefetchSemantics::DisjointById);
        let resolution = PrefetchResolver::new(&registry, &mut graph, &storage).select(&query).unwrap();
        assert!(resolution.roots.is_empty());
        assert_eq!(storage.fetch_count(), 1);
    }

    #[test]
    fn test_dirty_objects_keep_local_values() {
        let (registry, storage) = fixture();
        let mut graph = IdentityGraph::new();
        let descriptor = registry.descriptor("Artist").unwrap();
        let mut local = DomainObject::from_row(
            artist(1),
            descriptor,
            row(&[("id", Value::BigInt(1)), ("name", Value::from("Monet"))]),
        );
        local.set_value(0, Value::from("Claude"));
        local.set_state(PersistenceState::Modified);
        graph.register(local);

        PrefetchResolver::new(&registry, &mut graph, &storage)
            .select(&SelectQuery::new("Artist"))
            .unwrap();
        assert_eq!(graph.require(&artist(1)).unwrap().get("name").unwrap(), &Value::from("Claude"));
    }
}
