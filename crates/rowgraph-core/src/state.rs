//! Persistence states of domain objects.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a domain object relative to its context and storage.
///
/// ```text
///   TRANSIENT --create--> NEW --commit--> COMMITTED <--fault-- HOLLOW
///                          |                 |  ^
///                 rollback/delete       write|  |commit/rollback
///                          v                 v  |
///                      TRANSIENT           MODIFIED
///
///   COMMITTED/MODIFIED/HOLLOW --delete--> DELETED --commit--> TRANSIENT
///                                            |
///                                            +--rollback--> prior state
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Not attached to any context or row.
    Transient,
    /// Created in a context; no row exists yet.
    New,
    /// Identity known, field data not loaded.
    Hollow,
    /// Fields loaded and equal to the last known snapshot.
    Committed,
    /// Fields diverge from the last known snapshot.
    Modified,
    /// Marked for removal; still attached until commit.
    Deleted,
}

impl PersistenceState {
    /// Whether the object carries changes that a commit would flush.
    pub const fn is_dirty(self) -> bool {
        matches!(
            self,
            PersistenceState::New | PersistenceState::Modified | PersistenceState::Deleted
        )
    }

    /// Whether attribute writes are allowed.
    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            PersistenceState::New
                | PersistenceState::Hollow
                | PersistenceState::Committed
                | PersistenceState::Modified
        )
    }

    /// Whether `delete` may move this state to [`PersistenceState::Deleted`].
    pub const fn is_deletable(self) -> bool {
        matches!(
            self,
            PersistenceState::Hollow | PersistenceState::Committed | PersistenceState::Modified
        )
    }

    /// State after a field write.
    pub const fn after_write(self) -> Self {
        match self {
            PersistenceState::Committed | PersistenceState::Hollow => PersistenceState::Modified,
            other => other,
        }
    }

    /// Whether an unreferenced object in this state may be swept.
    pub const fn is_collectable(self) -> bool {
        matches!(self, PersistenceState::Hollow | PersistenceState::Committed)
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PersistenceState::Transient => "TRANSIENT",
            PersistenceState::New => "NEW",
            PersistenceState::Hollow => "HOLLOW",
            PersistenceState::Committed => "COMMITTED",
            PersistenceState::Modified => "MODIFIED",
            PersistenceState::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_transitions() {
        assert_eq!(
            PersistenceState::Committed.after_write(),
            PersistenceState::Modified
        );
        assert_eq!(PersistenceState::New.after_write(), PersistenceState::New);
        assert_eq!(
            PersistenceState::Modified.after_write(),
            PersistenceState::Modified
        );
    }

    #[test]
    fn test_new_objects_cannot_be_marked_deleted() {
        assert!(!PersistenceState::New.is_deletable());
        assert!(!PersistenceState::Transient.is_deletable());
        assert!(PersistenceState::Committed.is_deletable());
    }

    #[test]
    fn test_only_clean_states_are_collectable() {
        assert!(PersistenceState::Committed.is_collectable());
        assert!(!PersistenceState::New.is_collectable());
        assert!(!PersistenceState::Modified.is_collectable());
        assert!(!PersistenceState::Deleted.is_collectable());
    }
}
