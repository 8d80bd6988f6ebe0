#![allow(dead_code)]

use rowgraph::prelude::*;

pub static STUDIO: EntityInfo = EntityInfo::new("Studio", &["id"])
    .attributes(&[AttributeInfo::new("name")])
    .relationships(&[RelationshipInfo::to_many("artists", "Artist", &[("id", "studio_id")])
        .reverse("studio")
        .delete_rule(DeleteRule::Nullify)]);

pub static ARTIST: EntityInfo = EntityInfo::new("Artist", &["id"])
    .attributes(&[AttributeInfo::new("name").nullable(false)])
    .relationships(&[
        RelationshipInfo::to_many("paintings", "Painting", &[("id", "artist_id")])
            .reverse("artist")
            .delete_rule(DeleteRule::Cascade),
        RelationshipInfo::to_one("studio", "Studio", &[("studio_id", "id")]).reverse("artists"),
    ]);

pub static GALLERY: EntityInfo = EntityInfo::new("Gallery", &["id"])
    .attributes(&[AttributeInfo::new("name")])
    .relationships(&[RelationshipInfo::to_many("exhibits", "Painting", &[("id", "gallery_id")])
        .reverse("gallery")
        .delete_rule(DeleteRule::Deny)]);

pub static PAINTING: EntityInfo = EntityInfo::new("Painting", &["id"])
    .attributes(&[AttributeInfo::new("title")])
    .relationships(&[
        RelationshipInfo::to_one("artist", "Artist", &[("artist_id", "id")]).reverse("paintings"),
        RelationshipInfo::to_one("gallery", "Gallery", &[("gallery_id", "id")]).reverse("exhibits"),
    ]);

pub struct Fixture {
    pub storage: Arc<MemoryStorage>,
    pub domain: Domain,
}

pub fn fixture() -> Fixture {
    fixture_with(DomainConfig::default())
}

pub fn fixture_with(config: DomainConfig) -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    for table in ["Studio", "Artist", "Gallery", "Painting"] {
        storage.define_table(table, &["id"], true);
    }
    let domain = Domain::builder(storage.clone())
        .entities(&[&STUDIO, &ARTIST, &GALLERY, &PAINTING])
        .config(config)
        .build()
        .unwrap();
    Fixture { storage, domain }
}

pub fn row(pairs: &[(&str, Value)]) -> RowSnapshot {
    RowSnapshot::new(pairs.iter().cloned())
}

pub fn seed_artists(storage: &MemoryStorage, artists: &[(i64, &str)]) {
    storage
        .seed(
            "Artist",
            artists
                .iter()
                .map(|(id, name)| row(&[("id", Value::BigInt(*id)), ("name", Value::from(*name))])),
        )
        .unwrap();
}

/// `(id, title, artist id, gallery id)`
pub fn seed_paintings(storage: &MemoryStorage, paintings: &[(i64, &str, i64, Option<i64>)]) {
    storage
        .seed(
            "Painting",
            paintings.iter().map(|(id, title, artist_id, gallery_id)| {
                row(&[
                    ("id", Value::BigInt(*id)),
                    ("title", Value::from(*title)),
                    ("artist_id", Value::BigInt(*artist_id)),
                    ("gallery_id", gallery_id.map_or(Value::Null, Value::BigInt)),
                ])
            }),
        )
        .unwrap();
}

pub fn artist(id: i64) -> ObjectIdentity {
    ObjectIdentity::single("Artist", "id", id)
}

pub fn painting(id: i64) -> ObjectIdentity {
    ObjectIdentity::single("Painting", "id", id)
}

pub fn gallery(id: i64) -> ObjectIdentity {
    ObjectIdentity::single("Gallery", "id", id)
}

pub fn studio(id: i64) -> ObjectIdentity {
    ObjectIdentity::single("Studio", "id", id)
}

pub fn name_of(ctx: &ObjectContext, identity: &ObjectIdentity) -> Value {
    ctx.lookup(identity).unwrap().get("name").unwrap().clone()
}
