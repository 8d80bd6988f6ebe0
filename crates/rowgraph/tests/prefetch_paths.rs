//! Prefetch trees resolved through a select.

mod common;

use std::collections::BTreeMap;

use common::*;
use rowgraph::prelude::*;

static ORDER: EntityInfo = EntityInfo::new("Order", &["region", "num"])
    .attributes(&[AttributeInfo::new("customer")])
    .relationships(&[
        RelationshipInfo::to_many("lines", "Line", &[("region", "o_region"), ("num", "o_num")]).reverse("order"),
    ]);

static LINE: EntityInfo = EntityInfo::new("Line", &["id"])
    .attributes(&[AttributeInfo::new("sku")])
    .relationships(&[
        RelationshipInfo::to_one("order", "Order", &[("o_region", "region"), ("o_num", "num")]).reverse("lines"),
    ]);

fn seed_catalog(fx: &Fixture) {
    seed_artists(&fx.storage, &[(1, "Monet"), (2, "Dali"), (3, "Klee")]);
    fx.storage
        .seed("Gallery", [row(&[("id", Value::BigInt(100)), ("name", Value::from("Orsay"))])])
        .unwrap();
    seed_paintings(
        &fx.storage,
        &[
            (10, "Irises", 1, Some(100)),
            (11, "Poppies", 1, None),
            (12, "Haystacks", 1, Some(100)),
            (13, "Lilies", 1, None),
            (14, "Bridge", 1, None),
            (20, "Clocks", 2, None),
            (21, "Elephants", 2, Some(100)),
            (30, "Fish", 3, None),
        ],
    );
}

#[test]
fn limited_roots_with_disjoint_children_need_no_later_fetches() {
    let fx = fixture();
    seed_catalog(&fx);
    let mut ctx = fx.domain.new_context();

    let query = SelectQuery::new("Artist")
        .limit(2)
        .prefetch("paintings", PrefetchSemantics::DisjointById);
    let result = ctx.select(&query).unwrap();
    assert_eq!(result.objects, vec![artist(1), artist(2)]);
    assert!(result.prefetch_errors.is_empty());
    assert_eq!(fx.storage.fetch_count(), 2);

    fx.storage.reset_counts();
    fx.storage.block_fetches(true);
    let first = ctx.to_many(&artist(1), "paintings").unwrap();
    let second = ctx.to_many(&artist(2), "paintings").unwrap();
    assert_eq!(first.len(), 5);
    assert_eq!(second.len(), 2);
    for member in first.iter().chain(&second) {
        let owner = ctx.to_one(member, "artist").unwrap().unwrap();
        assert!(owner == artist(1) || owner == artist(2));
        assert!(!ctx.object(member).unwrap().get("title").unwrap().is_null());
    }
    assert_eq!(fx.storage.fetch_count(), 0);
    assert_eq!(ctx.fault_stats().total_faults, 0);
    assert!(ctx.lookup(&painting(30)).is_none());
}

/// Every artist's paintings, and every painting's gallery.
fn graph_shape(ctx: &mut ObjectContext, roots: &[ObjectIdentity]) -> BTreeMap<String, Vec<String>> {
    let mut shape = BTreeMap::new();
    for root in roots {
        let mut members: Vec<String> = ctx
            .to_many(root, "paintings")
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        members.sort();
        shape.insert(root.to_string(), members);
    }
    let paintings: Vec<ObjectIdentity> = ctx
        .graph()
        .iter()
        .filter(|o| o.entity() == "Painting")
        .map(|o| o.identity().clone())
        .collect();
    for member in paintings {
        let gallery = ctx.to_one(&member, "gallery").unwrap();
        shape.insert(member.to_string(), gallery.iter().map(ToString::to_string).collect());
    }
    shape
}

#[test]
fn joint_and_disjoint_build_the_same_graph() {
    let fx = fixture();
    seed_catalog(&fx);

    let mut joint = fx.domain.new_context();
    let joint_result = joint
        .select(
            &SelectQuery::new("Artist")
                .prefetch("paintings", PrefetchSemantics::Joint)
                .prefetch("paintings.gallery", PrefetchSemantics::Joint),
        )
        .unwrap();
    let joint_fetches = fx.storage.fetch_count();

    fx.storage.reset_counts();
    let mut disjoint = fx.domain.new_context();
    let disjoint_result = disjoint
        .select(
            &SelectQuery::new("Artist")
                .prefetch("paintings", PrefetchSemantics::DisjointById)
                .prefetch("paintings.gallery", PrefetchSemantics::DisjointById),
        )
        .unwrap();
    let disjoint_fetches = fx.storage.fetch_count();

    assert_eq!(joint_result.objects, disjoint_result.objects);
    assert_eq!(joint_fetches, 1);
    assert_eq!(disjoint_fetches, 3);

    fx.storage.block_fetches(true);
    let joint_shape = graph_shape(&mut joint, &joint_result.objects);
    let disjoint_shape = graph_shape(&mut disjoint, &disjoint_result.objects);
    assert_eq!(joint_shape, disjoint_shape);
    assert_eq!(joint_shape[&artist(1).to_string()].len(), 5);
}

#[test]
fn phantom_path_loads_objects_without_wiring_the_relationship() {
    let fx = fixture();
    seed_catalog(&fx);
    let mut ctx = fx.domain.new_context();
    ctx.select(
        &SelectQuery::new("Artist")
            .filter(Qualifier::Eq("id".into(), Value::BigInt(2)))
            .prefetch("paintings.gallery", PrefetchSemantics::DisjointById),
    )
    .unwrap();

    assert!(ctx.lookup(&painting(21)).is_some());
    assert!(ctx.lookup(&gallery(100)).is_some());
    assert!(!ctx.lookup(&artist(2)).unwrap().relation("paintings").unwrap().is_resolved());

    fx.storage.reset_counts();
    assert_eq!(ctx.to_many(&artist(2), "paintings").unwrap().len(), 2);
    assert_eq!(fx.storage.fetch_count(), 1);
}

#[test]
fn prefetched_rows_are_published_to_the_snapshot_store() {
    let fx = fixture();
    seed_catalog(&fx);
    let mut ctx = fx.domain.new_context();
    ctx.select(&SelectQuery::new("Artist").prefetch("paintings", PrefetchSemantics::DisjointById))
        .unwrap();

    let snapshots = fx.domain.snapshots();
    assert!(snapshots.contains(&artist(3)));
    assert!(snapshots.contains(&painting(30)));

    fx.storage.reset_counts();
    let mut sibling = fx.domain.new_context();
    sibling.object(&painting(30)).unwrap();
    assert_eq!(fx.storage.fetch_count(), 0);
}

#[test]
fn repeated_lazy_faults_are_counted() {
    let fx = fixture();
    seed_catalog(&fx);
    let mut ctx = fx.domain.new_context();
    let artists = ctx.select(&SelectQuery::new("Artist")).unwrap();
    for artist in &artists.objects {
        ctx.to_many(artist, "paintings").unwrap();
    }
    let stats = ctx.fault_stats();
    assert_eq!(stats.total_faults, 3);
    assert_eq!(stats.relationships_faulted, 1);
}

#[test]
fn prefetch_follows_unsaved_reverse_edits() {
    for semantics in [PrefetchSemantics::DisjointById, PrefetchSemantics::Joint] {
        let fx = fixture();
        seed_catalog(&fx);
        let mut ctx = fx.domain.new_context();
        ctx.set_to_one(&painting(10), "artist", Some(&artist(2))).unwrap();

        ctx.select(&SelectQuery::new("Artist").prefetch("paintings", semantics))
            .unwrap();
        fx.storage.block_fetches(true);
        let monet = ctx.to_many(&artist(1), "paintings").unwrap();
        let dali = ctx.to_many(&artist(2), "paintings").unwrap();
        assert!(!monet.contains(&painting(10)), "{semantics:?}");
        assert_eq!(monet.len(), 4, "{semantics:?}");
        assert!(dali.contains(&painting(10)), "{semantics:?}");
        assert_eq!(dali.len(), 3, "{semantics:?}");
        assert_eq!(ctx.to_one(&painting(10), "artist").unwrap(), Some(artist(2)));
    }
}

fn order(region: &str, num: i64) -> ObjectIdentity {
    ObjectIdentity::permanent("Order", [("region", Value::from(region)), ("num", Value::BigInt(num))])
}

fn line(id: i64) -> ObjectIdentity {
    ObjectIdentity::single("Line", "id", id)
}

fn order_book() -> (Arc<MemoryStorage>, Domain) {
    let storage = Arc::new(MemoryStorage::new());
    storage.define_table("Order", &["region", "num"], false);
    storage.define_table("Line", &["id"], true);
    let orders = [("eu", 1, "Ann"), ("us", 1, "Bob"), ("eu", 2, "Cy")];
    storage
        .seed(
            "Order",
            orders.iter().map(|(region, num, customer)| {
                row(&[
                    ("region", Value::from(*region)),
                    ("num", Value::BigInt(*num)),
                    ("customer", Value::from(*customer)),
                ])
            }),
        )
        .unwrap();
    // Lines 2 and 3 share `num` with order (eu, 1) but belong to (us, 1).
    let lines = [(1, "eu", 1), (2, "us", 1), (3, "us", 1)];
    storage
        .seed(
            "Line",
            lines.iter().map(|(id, region, num)| {
                row(&[
                    ("id", Value::BigInt(*id)),
                    ("sku", Value::from(format!("sku-{id}"))),
                    ("o_region", Value::from(*region)),
                    ("o_num", Value::BigInt(*num)),
                ])
            }),
        )
        .unwrap();
    let domain = Domain::builder(storage.clone())
        .entities(&[&ORDER, &LINE])
        .build()
        .unwrap();
    (storage, domain)
}

#[test]
fn composite_keys_join_on_every_column() {
    for semantics in [PrefetchSemantics::DisjointById, PrefetchSemantics::Joint] {
        let (storage, domain) = order_book();
        let mut ctx = domain.new_context();
        let result = ctx
            .select(&SelectQuery::new("Order").prefetch("lines", semantics))
            .unwrap();
        assert_eq!(result.len(), 3);

        storage.block_fetches(true);
        let counts: Vec<usize> = [order("eu", 1), order("us", 1), order("eu", 2)]
            .iter()
            .map(|o| ctx.to_many(o, "lines").unwrap().len())
            .collect();
        assert_eq!(counts, vec![1, 2, 0], "{semantics:?}");
        let lines = ctx.to_many(&order("us", 1), "lines").unwrap();
        assert!(lines.contains(&line(2)) && lines.contains(&line(3)));
        assert_eq!(ctx.to_one(&line(1), "order").unwrap(), Some(order("eu", 1)));
        assert_eq!(ctx.fault_stats().total_faults, 0);
    }
}
