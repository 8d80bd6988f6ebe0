//! Snapshot store configuration.

use rowgraph_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Capacity commonly used for bounded stores.
pub const DEFAULT_BOUNDED_CAPACITY: usize = 10_000;

/// Configuration for a [`SnapshotStore`](crate::SnapshotStore).
///
/// ```
/// use rowgraph_cache::SnapshotStoreConfig;
///
/// let config: SnapshotStoreConfig =
///     serde_json::from_str(r#"{ "name": "shared", "capacity": 500 }"#).unwrap();
/// assert_eq!(config.capacity, Some(500));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotStoreConfig {
    /// Name used in log records.
    pub name: String,
    /// Maximum number of cached snapshots; `None` means unbounded.
    pub capacity: Option<usize>,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            capacity: None,
        }
    }
}

impl SnapshotStoreConfig {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == Some(0) {
            return Err(Error::Config(format!(
                "snapshot store '{}': capacity must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}
