//! Entity metadata and per-entity accessor tables.
//!
//! Entities are declared as `static` metadata built with `const` builders:
//!
//! ```
//! use rowgraph_core::entity::{AttributeInfo, DeleteRule, EntityInfo, RelationshipInfo};
//!
//! static ARTIST: EntityInfo = EntityInfo::new("Artist", &["id"])
//!     .attributes(&[AttributeInfo::new("name").nullable(false)])
//!     .relationships(&[RelationshipInfo::to_many("paintings", "Painting", &[("id", "artist_id")])
//!         .reverse("artist")
//!         .delete_rule(DeleteRule::Cascade)]);
//! ```
//!
//! An [`EntityRegistry`] validates a set of declarations once and builds an
//! [`EntityDescriptor`] per entity. The descriptor holds the accessor table
//! (attribute and relationship name → position) that domain objects use for
//! positional storage, plus the flattened inheritance view of the entity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::snapshot::RowSnapshot;
use crate::value::Value;

/// Cardinality of a relationship, seen from its source entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// The source row holds the foreign key: `Painting.artist`.
    ToOne,
    /// The target rows hold the foreign key: `Artist.paintings`.
    ToMany,
}

/// What happens to related objects when the source object is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteRule {
    /// Leave related objects alone.
    #[default]
    NoAction,
    /// Clear the foreign key (or collection entry) on related objects.
    Nullify,
    /// Delete related objects too.
    Cascade,
    /// Refuse to delete while related objects exist.
    Deny,
}

/// Concurrency control applied when flushing updates and deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockingStrategy {
    #[default]
    None,
    /// Updates and deletes carry the last known values of the locking
    /// columns; a mismatch fails the commit.
    Optimistic,
}

/// A mapped scalar attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeInfo {
    pub name: &'static str,
    pub column: &'static str,
    pub nullable: bool,
    pub used_for_locking: bool,
}

impl AttributeInfo {
    /// Attribute stored in a column of the same name, nullable by default.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            column: name,
            nullable: true,
            used_for_locking: false,
        }
    }

    pub const fn column(mut self, column: &'static str) -> Self {
        self.column = column;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Include this attribute in optimistic lock checks.
    pub const fn locking(mut self, value: bool) -> Self {
        self.used_for_locking = value;
        self
    }
}

/// Join table linking both ends of a many-to-many relationship.
///
/// Each row of `table` is one link. `source` pairs join columns with the
/// source entity's key columns, `target` with the target's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTable {
    pub table: &'static str,
    pub source: &'static [(&'static str, &'static str)],
    pub target: &'static [(&'static str, &'static str)],
}

impl JoinTable {
    pub const fn new(
        table: &'static str,
        source: &'static [(&'static str, &'static str)],
        target: &'static [(&'static str, &'static str)],
    ) -> Self {
        Self { table, source, target }
    }

    /// The same table seen from the other end.
    pub const fn swapped(self) -> Self {
        Self {
            table: self.table,
            source: self.target,
            target: self.source,
        }
    }

    /// Every join column, source side first.
    pub fn columns(&self) -> Vec<&'static str> {
        self.source.iter().chain(self.target).map(|(c, _)| *c).collect()
    }
}

/// A relationship between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    pub name: &'static str,
    pub target: &'static str,
    pub kind: RelationshipKind,
    /// `(source column, target column)` pairs; several pairs form a
    /// composite join. Empty for relationships flattened over a join table.
    pub joins: &'static [(&'static str, &'static str)],
    /// Join table of a many-to-many relationship.
    pub through: Option<JoinTable>,
    pub reverse: Option<&'static str>,
    pub delete_rule: DeleteRule,
}

impl RelationshipInfo {
    /// To-one relationship: `joins` pairs a local foreign-key column with the
    /// target's key column.
    pub const fn to_one(
        name: &'static str,
        target: &'static str,
        joins: &'static [(&'static str, &'static str)],
    ) -> Self {
        Self {
            name,
            target,
            kind: RelationshipKind::ToOne,
            joins,
            through: None,
            reverse: None,
            delete_rule: DeleteRule::NoAction,
        }
    }

    /// To-many relationship: `joins` pairs a local key column with the
    /// target's foreign-key column.
    pub const fn to_many(
        name: &'static str,
        target: &'static str,
        joins: &'static [(&'static str, &'static str)],
    ) -> Self {
        Self {
            name,
            target,
            kind: RelationshipKind::ToMany,
            joins,
            through: None,
            reverse: None,
            delete_rule: DeleteRule::NoAction,
        }
    }

    /// Many-to-many relationship flattened over a join table. Its reverse,
    /// if any, must be flattened over the same table.
    pub const fn many_to_many(
        name: &'static str,
        target: &'static str,
        through: JoinTable,
    ) -> Self {
        Self {
            name,
            target,
            kind: RelationshipKind::ToMany,
            joins: &[],
            through: Some(through),
            reverse: None,
            delete_rule: DeleteRule::NoAction,
        }
    }

    /// Name of the inverse relationship on the target entity.
    pub const fn reverse(mut self, name: &'static str) -> Self {
        self.reverse = Some(name);
        self
    }

    pub const fn delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    pub const fn is_to_many(&self) -> bool {
        matches!(self.kind, RelationshipKind::ToMany)
    }

    pub const fn is_flattened(&self) -> bool {
        self.through.is_some()
    }

    /// Source-side join columns. For a flattened relationship these are the
    /// source key columns referenced by the join table.
    pub fn source_columns(&self) -> Vec<&'static str> {
        match &self.through {
            Some(join) => join.source.iter().map(|(_, k)| *k).collect(),
            None => self.joins.iter().map(|(s, _)| *s).collect(),
        }
    }

    pub fn target_columns(&self) -> Vec<&'static str> {
        match &self.through {
            Some(join) => join.target.iter().map(|(_, k)| *k).collect(),
            None => self.joins.iter().map(|(_, t)| *t).collect(),
        }
    }

    /// Foreign-key columns, on whichever side holds them. Empty when the
    /// keys live in a join table.
    pub fn foreign_key_columns(&self) -> Vec<&'static str> {
        if self.is_flattened() {
            return Vec::new();
        }
        match self.kind {
            RelationshipKind::ToOne => self.source_columns(),
            RelationshipKind::ToMany => self.target_columns(),
        }
    }
}

/// Discriminator of an entity within an inheritance hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discriminator {
    pub column: &'static str,
    pub value: &'static str,
}

/// Static declaration of one entity.
#[derive(Debug, Clone, Copy)]
pub struct EntityInfo {
    pub name: &'static str,
    /// Primary key columns. Sub-entities inherit the root's key and leave
    /// this empty.
    pub primary_key: &'static [&'static str],
    /// Attributes declared on this entity (inherited ones excluded).
    pub attributes: &'static [AttributeInfo],
    /// Relationships declared on this entity (inherited ones excluded).
    pub relationships: &'static [RelationshipInfo],
    pub super_entity: Option<&'static str>,
    pub discriminator: Option<Discriminator>,
    pub locking: LockingStrategy,
}

impl EntityInfo {
    pub const fn new(name: &'static str, primary_key: &'static [&'static str]) -> Self {
        Self {
            name,
            primary_key,
            attributes: &[],
            relationships: &[],
            super_entity: None,
            discriminator: None,
            locking: LockingStrategy::None,
        }
    }

    pub const fn attributes(mut self, attributes: &'static [AttributeInfo]) -> Self {
        self.attributes = attributes;
        self
    }

    pub const fn relationships(mut self, relationships: &'static [RelationshipInfo]) -> Self {
        self.relationships = relationships;
        self
    }

    /// Declare this entity a sub-entity of `super_entity`.
    pub const fn inherits(mut self, super_entity: &'static str) -> Self {
        self.super_entity = Some(super_entity);
        self
    }

    /// Rows whose `column` equals `value` resolve to this entity.
    pub const fn discriminator(mut self, column: &'static str, value: &'static str) -> Self {
        self.discriminator = Some(Discriminator { column, value });
        self
    }

    pub const fn locking(mut self, strategy: LockingStrategy) -> Self {
        self.locking = strategy;
        self
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Validated, flattened view of one entity.
#[derive(Debug)]
pub struct EntityDescriptor {
    info: &'static EntityInfo,
    root: &'static str,
    /// Self first, then ancestors up to the root.
    lineage: Vec<&'static str>,
    primary_key: &'static [&'static str],
    attributes: Vec<AttributeInfo>,
    attribute_index: HashMap<&'static str, usize>,
    relationships: Vec<RelationshipInfo>,
    relationship_index: HashMap<&'static str, usize>,
    /// Root entity of each relationship's target, by relationship position.
    target_roots: Vec<&'static str>,
    discriminator_column: Option<&'static str>,
    /// Discriminator values of this entity and all of its descendants.
    variant_values: Vec<&'static str>,
    locking: LockingStrategy,
}

impl EntityDescriptor {
    pub fn name(&self) -> &'static str {
        self.info.name
    }

    pub fn info(&self) -> &'static EntityInfo {
        self.info
    }

    /// Root of the inheritance hierarchy; the identity tag of every object
    /// of this entity.
    pub fn root(&self) -> &'static str {
        self.root
    }

    pub fn primary_key(&self) -> &'static [&'static str] {
        self.primary_key
    }

    /// All attributes, inherited ones first.
    pub fn attributes(&self) -> &[AttributeInfo] {
        &self.attributes
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attribute_index.get(name).copied()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeInfo> {
        self.attribute_index(name).map(|i| &self.attributes[i])
    }

    /// Like [`attribute_index`](Self::attribute_index) but reports an
    /// unknown attribute as an error.
    pub fn require_attribute(&self, name: &str) -> Result<usize> {
        self.attribute_index(name)
            .ok_or_else(|| Error::UnknownAttribute {
                entity: self.name().to_string(),
                attribute: name.to_string(),
            })
    }

    /// All relationships, inherited ones first.
    pub fn relationships(&self) -> &[RelationshipInfo] {
        &self.relationships
    }

    pub fn relationship_index(&self, name: &str) -> Option<usize> {
        self.relationship_index.get(name).copied()
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationship_index(name).map(|i| &self.relationships[i])
    }

    pub fn require_relationship(&self, name: &str) -> Result<(usize, &RelationshipInfo)> {
        self.relationship_index(name)
            .map(|i| (i, &self.relationships[i]))
            .ok_or_else(|| Error::UnknownRelationship {
                entity: self.name().to_string(),
                relationship: name.to_string(),
            })
    }

    /// Identity tag of the objects a relationship points at.
    pub fn target_root(&self, index: usize) -> &'static str {
        self.target_roots[index]
    }

    /// Whether this entity is `entity` or one of its descendants.
    pub fn is_a(&self, entity: &str) -> bool {
        self.lineage.contains(&entity)
    }

    pub fn discriminator(&self) -> Option<Discriminator> {
        self.info.discriminator
    }

    /// Discriminator column shared by the hierarchy, if any.
    pub fn discriminator_column(&self) -> Option<&'static str> {
        self.discriminator_column
    }

    /// Discriminator values a fetch of this entity must match, or `None`
    /// when every row of the root table qualifies.
    pub fn variant_filter(&self) -> Option<(&'static str, Vec<Value>)> {
        if self.info.super_entity.is_none() {
            return None;
        }
        let column = self.discriminator_column?;
        Some((
            column,
            self.variant_values.iter().map(|v| Value::from(*v)).collect(),
        ))
    }

    pub fn locking(&self) -> LockingStrategy {
        self.locking
    }

    /// Columns whose last known values guard updates under optimistic locking.
    ///
    /// Attributes flagged with [`AttributeInfo::locking`] when any are
    /// flagged, otherwise every attribute column plus every to-one foreign key.
    pub fn locking_columns(&self) -> Vec<&'static str> {
        let flagged: Vec<&'static str> = self
            .attributes
            .iter()
            .filter(|a| a.used_for_locking)
            .map(|a| a.column)
            .collect();
        if !flagged.is_empty() {
            return flagged;
        }
        let mut columns: Vec<&'static str> = self.attributes.iter().map(|a| a.column).collect();
        for rel in self.relationships.iter().filter(|r| !r.is_to_many()) {
            columns.extend(rel.source_columns());
        }
        columns.sort_unstable();
        columns.dedup();
        columns
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Validated set of entity descriptors.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: HashMap<&'static str, Arc<EntityDescriptor>>,
    /// Direct sub-entities per entity.
    children: HashMap<&'static str, Vec<&'static str>>,
}

impl EntityRegistry {
    /// Validate `entities` and build their descriptors.
    pub fn new(entities: &[&'static EntityInfo]) -> Result<Self> {
        let mut infos: HashMap<&'static str, &'static EntityInfo> = HashMap::new();
        for info in entities {
            if infos.insert(info.name, info).is_some() {
                return Err(Error::Config(format!("entity '{}' declared twice", info.name)));
            }
        }

        let mut children: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
        for info in entities {
            if let Some(parent) = info.super_entity {
                if !infos.contains_key(parent) {
                    return Err(Error::UnknownEntity(parent.to_string()));
                }
                children.entry(parent).or_default().push(info.name);
            }
        }

        let mut built = HashMap::with_capacity(infos.len());
        for info in entities {
            let descriptor = build_descriptor(info, &infos, &children)?;
            built.insert(info.name, Arc::new(descriptor));
        }

        let registry = Self {
            entities: built,
            children,
        };
        registry.validate_relationships()?;
        tracing::debug!(entities = registry.entities.len(), "Entity registry built");
        Ok(registry)
    }

    pub fn descriptor(&self, name: &str) -> Result<Arc<EntityDescriptor>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.values()
    }

    /// Most specific entity for `row` among `entity` and its descendants.
    ///
    /// Falls back to `entity` itself when the row carries no discriminator
    /// or the value matches no declared variant.
    pub fn resolve_variant(&self, entity: &str, row: &RowSnapshot) -> Result<Arc<EntityDescriptor>> {
        let base = self.descriptor(entity)?;
        let Some(column) = base.discriminator_column() else {
            return Ok(base);
        };
        let Some(Value::Text(tag)) = row.get(column) else {
            return Ok(base);
        };

        let mut stack = vec![base.name()];
        while let Some(name) = stack.pop() {
            let candidate = self.descriptor(name)?;
            if candidate.discriminator().is_some_and(|d| d.value == tag.as_str()) {
                return Ok(candidate);
            }
            if let Some(subs) = self.children.get(name) {
                stack.extend(subs.iter().copied());
            }
        }
        Ok(base)
    }

    fn validate_relationships(&self) -> Result<()> {
        for descriptor in self.entities.values() {
            for rel in descriptor.info.relationships {
                let target = self.descriptor(rel.target)?;
                if let Some(join) = &rel.through {
                    self.validate_join_table(descriptor, &target, rel, join)?;
                } else if rel.joins.is_empty() {
                    return Err(Error::Config(format!(
                        "relationship {}.{} has no join columns",
                        descriptor.name(),
                        rel.name
                    )));
                }
                if let Some(reverse) = rel.reverse {
                    let Some(inverse) = target.relationship(reverse) else {
                        return Err(Error::UnknownRelationship {
                            entity: target.name().to_string(),
                            relationship: reverse.to_string(),
                        });
                    };
                    if rel.is_flattened() || inverse.is_flattened() {
                        if inverse.through != rel.through.map(JoinTable::swapped) {
                            return Err(Error::Config(format!(
                                "relationship {}.{} and its reverse must share one join table",
                                descriptor.name(),
                                rel.name
                            )));
                        }
                    } else if inverse.kind == rel.kind && rel.kind == RelationshipKind::ToMany {
                        return Err(Error::Config(format!(
                            "relationship {}.{} and its reverse are both to-many; use a join table",
                            descriptor.name(),
                            rel.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_join_table(
        &self,
        source: &EntityDescriptor,
        target: &EntityDescriptor,
        rel: &RelationshipInfo,
        join: &JoinTable,
    ) -> Result<()> {
        for (side, pairs) in [(source, join.source), (target, join.target)] {
            if pairs.is_empty() {
                return Err(Error::Config(format!(
                    "relationship {}.{} has no join columns toward {}",
                    source.name(),
                    rel.name,
                    side.name()
                )));
            }
            if let Some((_, key)) = pairs.iter().find(|(_, k)| !side.primary_key().contains(k)) {
                return Err(Error::Config(format!(
                    "join table {} references {}.{}, which is not a key column",
                    join.table,
                    side.name(),
                    key
                )));
            }
        }
        Ok(())
    }
}

fn build_descriptor(
    info: &'static EntityInfo,
    infos: &HashMap<&'static str, &'static EntityInfo>,
    children: &HashMap<&'static str, Vec<&'static str>>,
) -> Result<EntityDescriptor> {
    // Lineage: self, parent, ..., root.
    let mut lineage = vec![info.name];
    let mut seen: HashSet<&'static str> = HashSet::from([info.name]);
    let mut current = info;
    while let Some(parent) = current.super_entity {
        if !seen.insert(parent) {
            return Err(Error::Config(format!(
                "inheritance cycle through entity '{parent}'"
            )));
        }
        lineage.push(parent);
        current = infos
            .get(parent)
            .ok_or_else(|| Error::UnknownEntity(parent.to_string()))?;
    }
    let root_info = current;
    if root_info.primary_key.is_empty() {
        return Err(Error::Config(format!(
            "entity '{}' has no primary key",
            root_info.name
        )));
    }
    if !info.primary_key.is_empty() && info.primary_key != root_info.primary_key {
        return Err(Error::Config(format!(
            "sub-entity '{}' must not redeclare the primary key of '{}'",
            info.name, root_info.name
        )));
    }

    let mut attributes = Vec::new();
    let mut relationships = Vec::new();
    for name in lineage.iter().rev() {
        attributes.extend_from_slice(infos[*name].attributes);
        relationships.extend_from_slice(infos[*name].relationships);
    }

    // Discriminators of ancestors and descendants must agree on one column.
    let mut discriminator_column: Option<&'static str> = None;
    let mut variant_values = Vec::new();
    let mut stack = vec![info.name];
    let mut related: Vec<&'static str> = lineage[1..].to_vec();
    while let Some(name) = stack.pop() {
        if let Some(d) = infos[name].discriminator {
            variant_values.push(d.value);
        }
        related.push(name);
        if let Some(subs) = children.get(name) {
            stack.extend(subs.iter().copied());
        }
    }
    for name in related {
        let Some(d) = infos[name].discriminator else {
            continue;
        };
        match discriminator_column {
            None => discriminator_column = Some(d.column),
            Some(column) if column != d.column => {
                return Err(Error::Config(format!(
                    "entity '{name}' uses discriminator column '{}' but its hierarchy uses '{column}'",
                    d.column
                )));
            }
            Some(_) => {}
        }
    }

    let mut attribute_index = HashMap::with_capacity(attributes.len());
    for (i, attr) in attributes.iter().enumerate() {
        if attribute_index.insert(attr.name, i).is_some() {
            return Err(Error::Config(format!(
                "entity '{}' declares attribute '{}' twice",
                info.name, attr.name
            )));
        }
    }
    let mut relationship_index = HashMap::with_capacity(relationships.len());
    let mut target_roots = Vec::with_capacity(relationships.len());
    for (i, rel) in relationships.iter().enumerate() {
        if relationship_index.insert(rel.name, i).is_some() {
            return Err(Error::Config(format!(
                "entity '{}' declares relationship '{}' twice",
                info.name, rel.name
            )));
        }
        target_roots.push(root_of(rel.target, infos)?);
    }

    Ok(EntityDescriptor {
        info,
        root: root_info.name,
        lineage,
        primary_key: root_info.primary_key,
        attributes,
        attribute_index,
        relationships,
        relationship_index,
        target_roots,
        discriminator_column,
        variant_values,
        locking: if info.locking == LockingStrategy::None {
            root_info.locking
        } else {
            info.locking
        },
    })
}

fn root_of(
    name: &'static str,
    infos: &HashMap<&'static str, &'static EntityInfo>,
) -> Result<&'static str> {
    let mut current = *infos
        .get(name)
        .ok_or_else(|| Error::UnknownEntity(name.to_string()))?;
    // Bounded walk; cycles are reported by the descriptor of the entity itself.
    for _ in 0..=infos.len() {
        let Some(parent) = current.super_entity else {
            return Ok(current.name);
        };
        current = *infos
            .get(parent)
            .ok_or_else(|| Error::UnknownEntity(parent.to_string()))?;
    }
    Err(Error::Config(format!("inheritance cycle through entity '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    static ARTIST: EntityInfo = EntityInfo::new("Artist", &["id"])
        .attributes(&[AttributeInfo::new("name").nullable(false)])
        .relationships(&[RelationshipInfo::to_many(
            "paintings",
            "Painting",
            &[("id", "artist_id")],
        )
        .reverse("artist")
        .delete_rule(DeleteRule::Cascade)]);

    static PAINTING: EntityInfo = EntityInfo::new("Painting", &["id"])
        .attributes(&[AttributeInfo::new("title"), AttributeInfo::new("price")])
        .relationships(&[
            RelationshipInfo::to_one("artist", "Artist", &[("artist_id", "id")]).reverse("paintings"),
        ]);

    static EMPLOYEE: EntityInfo = EntityInfo::new("Employee", &["id"])
        .attributes(&[AttributeInfo::new("name"), AttributeInfo::new("kind")])
        .discriminator("kind", "E");
    static MANAGER: EntityInfo = EntityInfo::new("Manager", &[])
        .inherits("Employee")
        .attributes(&[AttributeInfo::new("budget")])
        .discriminator("kind", "M");
    static DIRECTOR: EntityInfo = EntityInfo::new("Director", &[])
        .inherits("Manager")
        .attributes(&[AttributeInfo::new("board_seat")])
        .discriminator("kind", "D");

    fn registry() -> EntityRegistry {
        EntityRegistry::new(&[&ARTIST, &PAINTING, &EMPLOYEE, &MANAGER, &DIRECTOR]).unwrap()
    }

    #[test]
    fn test_accessor_table() {
        let registry = registry();
        let painting = registry.descriptor("Painting").unwrap();
        assert_eq!(painting.attribute_index("title"), Some(0));
        assert_eq!(painting.attribute_index("price"), Some(1));
        assert!(painting.attribute_index("missing").is_none());
        assert!(matches!(
            painting.require_attribute("missing"),
            Err(Error::UnknownAttribute { .. })
        ));
        let (index, rel) = painting.require_relationship("artist").unwrap();
        assert_eq!(index, 0);
        assert_eq!(rel.foreign_key_columns(), vec!["artist_id"]);
    }

    #[test]
    fn test_inherited_attributes_come_first() {
        let registry = registry();
        let director = registry.descriptor("Director").unwrap();
        let names: Vec<_> = director.attributes().iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["name", "kind", "budget", "board_seat"]);
        assert_eq!(director.root(), "Employee");
        assert_eq!(director.primary_key(), &["id"]);
        assert!(director.is_a("Manager"));
        assert!(!registry.descriptor("Manager").unwrap().is_a("Director"));
    }

    #[test]
    fn test_resolve_most_specific_variant() {
        let registry = registry();
        let row = RowSnapshot::new([("id", Value::BigInt(1)), ("kind", Value::from("D"))]);
        assert_eq!(registry.resolve_variant("Employee", &row).unwrap().name(), "Director");

        let row = RowSnapshot::new([("id", Value::BigInt(2)), ("kind", Value::from("M"))]);
        assert_eq!(registry.resolve_variant("Employee", &row).unwrap().name(), "Manager");

        let row = RowSnapshot::new([("id", Value::BigInt(3)), ("kind", Value::from("?"))]);
        assert_eq!(registry.resolve_variant("Employee", &row).unwrap().name(), "Employee");

        // A sub-entity query never resolves to a sibling or ancestor.
        let row = RowSnapshot::new([("id", Value::BigInt(4)), ("kind", Value::from("E"))]);
        assert_eq!(registry.resolve_variant("Manager", &row).unwrap().name(), "Manager");
    }

    #[test]
    fn test_variant_filter_covers_descendants() {
        let registry = registry();
        assert!(registry.descriptor("Employee").unwrap().variant_filter().is_none());
        let (column, mut values) = registry.descriptor("Manager").unwrap().variant_filter().unwrap();
        values.sort_by_key(ToString::to_string);
        assert_eq!(column, "kind");
        assert_eq!(values, vec![Value::from("D"), Value::from("M")]);
    }

    #[test]
    fn test_locking_columns_default_to_all_attributes() {
        let registry = registry();
        let painting = registry.descriptor("Painting").unwrap();
        assert_eq!(painting.locking_columns(), vec!["artist_id", "price", "title"]);
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        static ORPHAN: EntityInfo = EntityInfo::new("Orphan", &["id"]).relationships(&[
            RelationshipInfo::to_one("parent", "Nowhere", &[("parent_id", "id")]),
        ]);
        let err = EntityRegistry::new(&[&ORPHAN]).unwrap_err();
        assert!(matches!(err, Error::UnknownEntity(name) if name == "Nowhere"));
    }

    #[test]
    fn test_duplicate_entity_is_rejected() {
        let err = EntityRegistry::new(&[&ARTIST, &ARTIST]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_primary_key_is_rejected() {
        static KEYLESS: EntityInfo = EntityInfo::new("Keyless", &[]);
        assert!(matches!(
            EntityRegistry::new(&[&KEYLESS]),
            Err(Error::Config(_))
        ));
    }

    const TAGGING: JoinTable =
        JoinTable::new("PaintingTag", &[("painting_id", "id")], &[("tag_id", "id")]);

    static CANVAS: EntityInfo = EntityInfo::new("Canvas", &["id"]).relationships(&[
        RelationshipInfo::many_to_many("tags", "Tag", TAGGING).reverse("canvases"),
    ]);
    static TAG: EntityInfo = EntityInfo::new("Tag", &["id"]).relationships(&[
        RelationshipInfo::many_to_many("canvases", "Canvas", TAGGING.swapped()).reverse("tags"),
    ]);

    #[test]
    fn test_many_to_many_columns_come_from_the_join_table() {
        let registry = EntityRegistry::new(&[&CANVAS, &TAG]).unwrap();
        let canvas = registry.descriptor("Canvas").unwrap();
        let (_, rel) = canvas.require_relationship("tags").unwrap();
        assert!(rel.is_flattened() && rel.is_to_many());
        assert_eq!(rel.source_columns(), vec!["id"]);
        assert_eq!(rel.target_columns(), vec!["id"]);
        assert!(rel.foreign_key_columns().is_empty());
        assert_eq!(rel.through.unwrap().columns(), vec!["painting_id", "tag_id"]);
        let tag = registry.descriptor("Tag").unwrap();
        let (_, inverse) = tag.require_relationship("canvases").unwrap();
        assert_eq!(inverse.through.unwrap().columns(), vec!["tag_id", "painting_id"]);
    }

    #[test]
    fn test_many_to_many_reverse_must_share_the_join_table() {
        static OTHER: EntityInfo = EntityInfo::new("Tag", &["id"]).relationships(&[
            RelationshipInfo::many_to_many(
                "canvases",
                "Canvas",
                JoinTable::new("Labels", &[("tag_id", "id")], &[("painting_id", "id")]),
            )
            .reverse("tags"),
        ]);
        let err = EntityRegistry::new(&[&CANVAS, &OTHER]).unwrap_err();
        assert!(matches!(err, Error::Config(message) if message.contains("join table")));
    }

    #[test]
    fn test_join_table_must_reference_key_columns() {
        static LOOSE: EntityInfo = EntityInfo::new("Loose", &["id"]).relationships(&[
            RelationshipInfo::many_to_many(
                "tags",
                "Tag",
                JoinTable::new("LooseTag", &[("loose_name", "name")], &[("tag_id", "id")]),
            ),
        ]);
        static PLAIN_TAG: EntityInfo = EntityInfo::new("Tag", &["id"]);
        let err = EntityRegistry::new(&[&LOOSE, &PLAIN_TAG]).unwrap_err();
        assert!(matches!(err, Error::Config(message) if message.contains("not a key column")));
    }

    #[test]
    fn test_to_many_pair_without_join_table_is_rejected() {
        static LEFT: EntityInfo = EntityInfo::new("Left", &["id"]).relationships(&[
            RelationshipInfo::to_many("rights", "Right", &[("id", "left_id")]).reverse("lefts"),
        ]);
        static RIGHT: EntityInfo = EntityInfo::new("Right", &["id"]).relationships(&[
            RelationshipInfo::to_many("lefts", "Left", &[("id", "right_id")]).reverse("rights"),
        ]);
        let err = EntityRegistry::new(&[&LEFT, &RIGHT]).unwrap_err();
        assert!(matches!(err, Error::Config(message) if message.contains("use a join table")));
    }
}
