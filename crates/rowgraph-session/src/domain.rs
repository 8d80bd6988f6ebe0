//! Domain: the shared runtime every object context is created from.
//!
//! A [`Domain`] bundles the entity registry, the storage executor, the
//! process-wide snapshot store, configuration, validation hooks and
//! lifecycle callbacks. It is cheap to clone.

use std::sync::{Arc, Mutex};

use rowgraph_cache::{SnapshotStore, SnapshotStoreConfig};
use rowgraph_core::{EntityInfo, EntityRegistry, Error, Result, StorageExecutor};
use serde::{Deserialize, Serialize};

use crate::context::{ObjectContext, SharedContext};
use crate::fault_tracker::DEFAULT_FAULT_WARNING_THRESHOLD;
use crate::lifecycle::{LifecycleCallbacks, LifecycleEvent};
use crate::object::DomainObject;
use crate::validation::ValidationHook;

// ============================================================================
// Configuration
// ============================================================================

/// Per-context behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Run validation hooks during VALIDATING.
    pub validate_on_commit: bool,
    /// Sweep the identity graph once it holds more than this many objects.
    pub gc_threshold: Option<usize>,
    /// Relationship faults per (entity, relationship) before warning.
    pub fault_warning_threshold: usize,
    /// Publish rows read from storage to the snapshot store.
    pub publish_fetches: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            validate_on_commit: true,
            gc_threshold: None,
            fault_warning_threshold: DEFAULT_FAULT_WARNING_THRESHOLD,
            publish_fetches: true,
        }
    }
}

/// Configuration of a whole domain.
///
/// ```
/// use rowgraph_session::DomainConfig;
///
/// let config = DomainConfig::from_json_str(
///     r#"{ "snapshots": { "capacity": 1000 }, "context": { "gc_threshold": 5000 } }"#,
/// ).unwrap();
/// assert_eq!(config.snapshots.capacity, Some(1000));
/// assert!(config.context.validate_on_commit);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub snapshots: SnapshotStoreConfig,
    pub context: ContextConfig,
}

impl DomainConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid domain configuration: {e}")))?;
        config.snapshots.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Domain
// ============================================================================

struct DomainInner {
    registry: EntityRegistry,
    executor: Arc<dyn StorageExecutor>,
    snapshots: Arc<SnapshotStore>,
    config: ContextConfig,
    validators: Vec<Arc<dyn ValidationHook>>,
    callbacks: LifecycleCallbacks,
}

/// Shared runtime for object contexts.
#[derive(Clone)]
pub struct Domain {
    inner: Arc<DomainInner>,
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("entities", &self.inner.registry.len())
            .field("snapshots", &self.inner.snapshots)
            .field("config", &self.inner.config)
            .field("validators", &self.inner.validators.len())
            .field("callbacks", &self.inner.callbacks)
            .finish_non_exhaustive()
    }
}

impl Domain {
    pub fn builder(executor: Arc<dyn StorageExecutor>) -> DomainBuilder {
        DomainBuilder::new(executor)
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.inner.registry
    }

    pub fn executor(&self) -> &Arc<dyn StorageExecutor> {
        &self.inner.executor
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.inner.snapshots
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub fn validators(&self) -> &[Arc<dyn ValidationHook>] {
        &self.inner.validators
    }

    pub fn callbacks(&self) -> &LifecycleCallbacks {
        &self.inner.callbacks
    }

    /// A new top-level context reading from and committing to storage.
    pub fn new_context(&self) -> ObjectContext {
        ObjectContext::new(self)
    }

    /// A new top-level context behind a lock, ready to parent child contexts.
    pub fn shared_context(&self) -> SharedContext {
        Arc::new(Mutex::new(self.new_context()))
    }
}

/// Assembles a [`Domain`].
pub struct DomainBuilder {
    executor: Arc<dyn StorageExecutor>,
    entities: Vec<&'static EntityInfo>,
    snapshots: Option<Arc<SnapshotStore>>,
    config: DomainConfig,
    validators: Vec<Arc<dyn ValidationHook>>,
    callbacks: LifecycleCallbacks,
}

impl DomainBuilder {
    pub fn new(executor: Arc<dyn StorageExecutor>) -> Self {
        Self {
            executor,
            entities: Vec::new(),
            snapshots: None,
            config: DomainConfig::default(),
            validators: Vec::new(),
            callbacks: LifecycleCallbacks::new(),
        }
    }

    pub fn entity(mut self, info: &'static EntityInfo) -> Self {
        self.entities.push(info);
        self
    }

    pub fn entities(mut self, infos: &[&'static EntityInfo]) -> Self {
        self.entities.extend_from_slice(infos);
        self
    }

    pub fn config(mut self, config: DomainConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing snapshot store instead of building one from the
    /// configuration.
    pub fn snapshots(mut self, store: Arc<SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn validator(mut self, hook: impl ValidationHook + 'static) -> Self {
        self.validators.push(Arc::new(hook));
        self
    }

    pub fn on(
        mut self,
        event: LifecycleEvent,
        f: impl Fn(&DomainObject) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on(event, f);
        self
    }

    pub fn on_entity(
        mut self,
        event: LifecycleEvent,
        entity: &'static str,
        f: impl Fn(&DomainObject) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_entity(event, entity, f);
        self
    }

    pub fn build(self) -> Result<Domain> {
        let registry = EntityRegistry::new(&self.entities)?;
        let snapshots = match self.snapshots {
            Some(store) => store,
            None => Arc::new(SnapshotStore::new(self.config.snapshots)?),
        };
        tracing::debug!(
            entities = registry.len(),
            store = snapshots.name(),
            validators = self.validators.len(),
            "Domain built"
        );
        Ok(Domain {
            inner: Arc::new(DomainInner {
                registry,
                executor: self.executor,
                snapshots,
                config: self.config.context,
                validators: self.validators,
                callbacks: self.callbacks,
            }),
        })
    }
}
