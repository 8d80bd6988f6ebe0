//! Per-object lifecycle callbacks.
//!
//! Callbacks are registered globally or for one entity and receive the
//! materialized [`DomainObject`]. `Pre*` callbacks can veto the operation by
//! returning an error; failures of `Post*` callbacks are logged and ignored
//! since the operation has already happened.

use std::collections::HashMap;
use std::sync::Arc;

use rowgraph_core::Result;

use crate::object::DomainObject;

/// Point in an object's life at which callbacks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// After an object is materialized from a fetched row.
    PostLoad,
    /// When a new object is registered in a context.
    PrePersist,
    /// After the insert has been committed.
    PostPersist,
    /// Before a modified object is validated for commit.
    PreUpdate,
    PostUpdate,
    /// When an object is marked for deletion, or when a CASCADE rule
    /// reaches it while the commit is ordered.
    PreRemove,
    PostRemove,
}

impl LifecycleEvent {
    /// Whether an error from a callback aborts the operation.
    pub const fn can_abort(self) -> bool {
        matches!(
            self,
            LifecycleEvent::PrePersist | LifecycleEvent::PreUpdate | LifecycleEvent::PreRemove
        )
    }
}

type LifecycleFn = Arc<dyn Fn(&DomainObject) -> Result<()> + Send + Sync>;

/// Registry of lifecycle callbacks, shared by every context of a domain.
#[derive(Clone, Default)]
pub struct LifecycleCallbacks {
    global: HashMap<LifecycleEvent, Vec<LifecycleFn>>,
    per_entity: HashMap<(LifecycleEvent, &'static str), Vec<LifecycleFn>>,
}

impl std::fmt::Debug for LifecycleCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCallbacks")
            .field("global", &self.global.values().map(Vec::len).sum::<usize>())
            .field("per_entity", &self.per_entity.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl LifecycleCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every entity.
    pub fn on(
        &mut self,
        event: LifecycleEvent,
        f: impl Fn(&DomainObject) -> Result<()> + Send + Sync + 'static,
    ) {
        self.global.entry(event).or_default().push(Arc::new(f));
    }

    /// Register a callback for one entity and its sub-entities.
    pub fn on_entity(
        &mut self,
        event: LifecycleEvent,
        entity: &'static str,
        f: impl Fn(&DomainObject) -> Result<()> + Send + Sync + 'static,
    ) {
        self.per_entity
            .entry((event, entity))
            .or_default()
            .push(Arc::new(f));
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.per_entity.is_empty()
    }

    /// Run the callbacks for `event` on `object`.
    ///
    /// Errors propagate only for events that [can abort](LifecycleEvent::can_abort).
    pub fn fire(&self, event: LifecycleEvent, object: &DomainObject) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let entity_callbacks = self
            .per_entity
            .iter()
            .filter(|((e, entity), _)| *e == event && object.descriptor().is_a(entity))
            .flat_map(|(_, callbacks)| callbacks);
        let callbacks = self.global.get(&event).into_iter().flatten().chain(entity_callbacks);

        for callback in callbacks {
            if let Err(error) = callback(object) {
                if event.can_abort() {
                    return Err(error);
                }
                tracing::warn!(
                    ?event,
                    identity = %object.identity(),
                    %error,
                    "Lifecycle callback failed"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rowgraph_core::{AttributeInfo, EntityInfo, EntityRegistry, Error, ObjectIdentity};

    static ANIMAL: EntityInfo = EntityInfo::new("Animal", &["id"])
        .attributes(&[AttributeInfo::new("kind")])
        .discriminator("kind", "A");
    static DOG: EntityInfo = EntityInfo::new("Dog", &[]).inherits("Animal").discriminator("kind", "D");

    fn object(entity: &str) -> DomainObject {
        let registry = EntityRegistry::new(&[&ANIMAL, &DOG]).unwrap();
        DomainObject::new(ObjectIdentity::temporary("Animal"), registry.descriptor(entity).unwrap())
    }

    #[test]
    fn test_entity_callbacks_apply_to_sub_entities() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut callbacks = LifecycleCallbacks::new();
        let counter = Arc::clone(&hits);
        callbacks.on_entity(LifecycleEvent::PostLoad, "Animal", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        callbacks.fire(LifecycleEvent::PostLoad, &object("Dog")).unwrap();
        callbacks.fire(LifecycleEvent::PostLoad, &object("Animal")).unwrap();
        callbacks.fire(LifecycleEvent::PostPersist, &object("Dog")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pre_events_abort_post_events_do_not() {
        let mut callbacks = LifecycleCallbacks::new();
        callbacks.on(LifecycleEvent::PreRemove, |_| Err(Error::Callback("no".into())));
        callbacks.on(LifecycleEvent::PostRemove, |_| Err(Error::Callback("ignored".into())));

        assert!(callbacks.fire(LifecycleEvent::PreRemove, &object("Dog")).is_err());
        assert!(callbacks.fire(LifecycleEvent::PostRemove, &object("Dog")).is_ok());
    }
}
