//! Delete rules, validation and atomicity of storage commits.

mod common;

use common::*;
use rowgraph::prelude::*;
use rowgraph::{NotNullRule, StorageError};

fn seed_gallery(fx: &Fixture) {
    fx.storage
        .seed("Gallery", [row(&[("id", Value::BigInt(100)), ("name", Value::from("Orsay"))])])
        .unwrap();
}

fn seed_studio(fx: &Fixture) {
    fx.storage
        .seed("Studio", [row(&[("id", Value::BigInt(7)), ("name", Value::from("Giverny"))])])
        .unwrap();
    fx.storage
        .seed(
            "Artist",
            [1, 2].map(|id| {
                row(&[
                    ("id", Value::BigInt(id)),
                    ("name", Value::from(format!("artist {id}"))),
                    ("studio_id", Value::BigInt(7)),
                ])
            }),
        )
        .unwrap();
}

// ============================================================================
// Delete rules
// ============================================================================

#[test]
fn deny_blocks_delete_and_touches_nothing() {
    let fx = fixture();
    seed_artists(&fx.storage, &[(1, "Monet")]);
    seed_gallery(&fx);
    seed_paintings(&fx.storage, &[(10, "Irises", 1, Some(100))]);
    let mut ctx = fx.domain.new_context();

    ctx.delete(&gallery(100)).unwrap();
    let cached_before = fx.domain.snapshots().get(&gallery(100));
    let err = ctx.commit().unwrap_err();
    match err {
        Error::DeleteRuleViolation {
            identity,
            relationship,
            dependents,
        } => {
            assert_eq!(identity, gallery(100));
            assert_eq!(relationship, "exhibits");
            assert_eq!(dependents, 1);
        }
        other => panic!("expected a delete rule violation, got {other:?}"),
    }
    assert_eq!(ctx.last_phase(), CommitPhase::Failed);
    assert_eq!(fx.storage.execute_count(), 0);
    assert!(fx.storage.row(&gallery(100)).is_some());
    assert_eq!(fx.domain.snapshots().get(&gallery(100)), cached_before);
    assert_eq!(ctx.lookup(&gallery(100)).unwrap().state(), PersistenceState::Deleted);

    ctx.rollback().unwrap();
    assert_eq!(ctx.lookup(&gallery(100)).unwrap().state(), PersistenceState::Committed);
    assert!(!ctx.has_changes());
}

#[test]
fn deny_is_satisfied_when_dependents_go_too() {
    let fx = fixture();
    seed_artists(&fx.storage, &[(1, "Monet")]);
    seed_gallery(&fx);
    seed_paintings(&fx.storage, &[(10, "Irises", 1, Some(100))]);
    let mut ctx = fx.domain.new_context();

    ctx.delete(&painting(10)).unwrap();
    ctx.delete(&gallery(100)).unwrap();
    let outcome = ctx.commit().unwrap();

    assert_eq!(outcome.deleted, vec![painting(10), gallery(100)]);
    assert!(fx.storage.rows("Gallery").is_empty());
    assert!(fx.storage.rows("Painting").is_empty());
}

#[test]
fn cascade_reaches_dependents_that_were_never_loaded() {
    let fx = fixture();
    seed_artists(&fx.storage, &[(1, "Monet"), (2, "Dali")]);
    seed_paintings(&fx.storage, &[(10, "Irises", 1, None), (11, "Poppies", 1, None), (20, "Clocks", 2, None)]);
    let mut ctx = fx.domain.new_context();

    ctx.delete(&artist(1)).unwrap();
    let outcome = ctx.commit().unwrap();

    assert_eq!(outcome.deleted.len(), 3);
    assert_eq!(outcome.deleted.last(), Some(&artist(1)));
    assert!(outcome.deleted.contains(&painting(10)));
    assert!(outcome.deleted.contains(&painting(11)));
    let remaining = fx.storage.rows("Painting");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].get("title"), Some(&Value::from("Clocks")));
    assert!(ctx.lookup(&artist(1)).is_none());
    assert!(!fx.domain.snapshots().contains(&artist(1)));
}

#[test]
fn cascade_discards_unsaved_dependents() {
    let fx = fixture();
    seed_artists(&fx.storage, &[(1, "Monet")]);
    let mut ctx = fx.domain.new_context();

    let sketch = ctx.create("Painting").unwrap();
    ctx.set_to_one(&sketch, "artist", Some(&artist(1))).unwrap();
    ctx.delete(&artist(1)).unwrap();
    let outcome = ctx.commit().unwrap();

    assert!(outcome.inserted.is_empty());
    assert_eq!(outcome.deleted, vec![artist(1)]);
    assert!(ctx.lookup(&sketch).is_none());
    assert!(fx.storage.rows("Painting").is_empty());
}

fn removal_log() -> (Fixture, Arc<std::sync::Mutex<Vec<ObjectIdentity>>>) {
    let storage = Arc::new(MemoryStorage::new());
    for table in ["Studio", "Artist", "Gallery", "Painting"] {
        storage.define_table(table, &["id"], true);
    }
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let domain = Domain::builder(storage.clone())
        .entities(&[&STUDIO, &ARTIST, &GALLERY, &PAINTING])
        .on(LifecycleEvent::PreRemove, move |object| {
            sink.lock().unwrap().push(object.identity().clone());
            Ok(())
        })
        .build()
        .unwrap();
    (Fixture { storage, domain }, log)
}

#[test]
fn cascade_fires_pre_remove_for_every_dependent() {
    let (fx, log) = removal_log();
    seed_artists(&fx.storage, &[(1, "Monet")]);
    seed_paintings(&fx.storage, &[(10, "Irises", 1, None), (11, "Poppies", 1, None)]);
    let mut ctx = fx.domain.new_context();

    let sketch = ctx.create("Painting").unwrap();
    ctx.set_to_one(&sketch, "artist", Some(&artist(1))).unwrap();
    ctx.delete(&artist(1)).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![artist(1)]);

    ctx.commit().unwrap();
    let removed = log.lock().unwrap().clone();
    assert_eq!(removed.len(), 4);
    assert_eq!(removed.iter().filter(|id| **id == artist(1)).count(), 1);
    for id in [painting(10), painting(11), sketch] {
        assert!(removed.contains(&id), "{id} saw no PreRemove");
    }
}

#[test]
fn pre_remove_veto_on_a_cascaded_dependent_aborts_the_commit() {
    let storage = Arc::new(MemoryStorage::new());
    for table in ["Studio", "Artist", "Gallery", "Painting"] {
        storage.define_table(table, &["id"], true);
    }
    let domain = Domain::builder(storage.clone())
        .entities(&[&STUDIO, &ARTIST, &GALLERY, &PAINTING])
        .on_entity(LifecycleEvent::PreRemove, "Painting", |_| {
            Err(Error::Callback("paintings are kept".into()))
        })
        .build()
        .unwrap();
    seed_artists(&storage, &[(1, "Monet")]);
    seed_paintings(&storage, &[(10, "Irises", 1, None)]);
    let mut ctx = domain.new_context();

    ctx.delete(&artist(1)).unwrap();
    let err = ctx.commit().unwrap_err();
    assert!(matches!(err, Error::Callback(_)));
    assert_eq!(ctx.last_phase(), CommitPhase::Failed);
    assert_eq!(storage.execute_count(), 0);
    assert_eq!(storage.rows("Artist").len(), 1);
    assert!(ctx.has_changes());
}

#[test]
fn nullify_clears_foreign_keys_loaded_or_not() {
    let fx = fixture();
    seed_studio(&fx);
    let mut ctx = fx.domain.new_context();

    assert_eq!(ctx.to_one(&artist(1), "studio").unwrap(), Some(studio(7)));
    ctx.delete(&studio(7)).unwrap();
    ctx.commit().unwrap();

    assert!(fx.storage.rows("Studio").is_empty());
    for id in [1, 2] {
        let stored = fx.storage.row(&artist(id)).unwrap();
        assert_eq!(stored.get("studio_id"), Some(&Value::Null));
    }
    assert_eq!(ctx.to_one(&artist(1), "studio").unwrap(), None);
    assert_eq!(ctx.lookup(&artist(1)).unwrap().state(), PersistenceState::Committed);

    // The unloaded artist's post-image reached the shared cache too.
    let cached = fx.domain.snapshots().get(&artist(2)).unwrap();
    assert_eq!(cached.get("studio_id"), Some(&Value::Null));
}

// ============================================================================
// Atomicity
// ============================================================================

#[test]
fn storage_failure_leaves_cache_and_pending_changes_alone() {
    let fx = fixture();
    seed_artists(&fx.storage, &[(1, "Monet")]);
    let mut ctx = fx.domain.new_context();
    ctx.set_attribute(&artist(1), "name", "Claude").unwrap();

    fx.storage.fail_next_execute(StorageError::backend("disk full"));
    let err = ctx.commit().unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert_eq!(ctx.last_phase(), CommitPhase::Failed);

    let cached = fx.domain.snapshots().get(&artist(1)).unwrap();
    assert_eq!(cached.get("name"), Some(&Value::from("Monet")));
    assert_eq!(ctx.lookup(&artist(1)).unwrap().state(), PersistenceState::Modified);
    assert!(ctx.has_changes());

    ctx.commit().unwrap();
    let stored = fx.storage.row(&artist(1)).unwrap();
    assert_eq!(stored.get("name"), Some(&Value::from("Claude")));
}

#[test]
fn create_then_delete_never_reaches_storage() {
    let fx = fixture();
    let mut ctx = fx.domain.new_context();

    let draft = ctx.create("Artist").unwrap();
    ctx.set_attribute(&draft, "name", "Nobody").unwrap();
    ctx.delete(&draft).unwrap();

    assert!(!ctx.has_changes());
    let outcome = ctx.commit().unwrap();
    assert!(outcome.is_empty());
    assert_eq!(fx.storage.execute_count(), 0);
}

#[test]
fn not_null_rule_rejects_incomplete_objects() {
    let storage = std::sync::Arc::new(MemoryStorage::new());
    storage.define_table("Artist", &["id"], true);
    storage.define_table("Painting", &["id"], true);
    storage.define_table("Studio", &["id"], true);
    storage.define_table("Gallery", &["id"], true);
    let domain = Domain::builder(storage.clone())
        .entities(&[&STUDIO, &ARTIST, &GALLERY, &PAINTING])
        .validator(NotNullRule)
        .build()
        .unwrap();
    let mut ctx = domain.new_context();

    let nameless = ctx.create("Artist").unwrap();
    match ctx.commit().unwrap_err() {
        Error::Validation(failure) => {
            assert_eq!(failure.identity, nameless);
            assert_eq!(failure.errors[0].attribute.as_deref(), Some("name"));
        }
        other => panic!("expected a validation failure, got {other:?}"),
    }
    assert_eq!(storage.execute_count(), 0);

    ctx.set_attribute(&nameless, "name", "Monet").unwrap();
    let outcome = ctx.commit().unwrap();
    assert_eq!(outcome.inserted.len(), 1);
}
