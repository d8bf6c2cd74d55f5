//! Job lifecycle and object visibility states.
//!
//! Two state machines run side by side:
//!
//! - [`JobState`]: where the job is in its lifecycle (queued, running, rolling
//!   back, terminal).
//! - [`SchemaState`]: how visible the object being changed is to foreground
//!   statements. Each change publishes exactly one schema version.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a DDL job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Enqueued, not yet picked up by the owner.
    #[default]
    None,
    /// Dequeued; schema state is advancing.
    Running,
    /// An unrecoverable error or cancellation is being undone.
    RollingBack,
    /// Rollback finished; waiting to be archived.
    RollbackDone,
    /// Finished successfully.
    Done,
    /// Finished without effect.
    Cancelled,
}

impl JobState {
    /// Returns true once the job has nothing left to do but be archived.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::RollbackDone)
    }

    /// Returns true for states a job never leaves.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::None => matches!(target, Self::Running | Self::Cancelled),
            Self::Running => matches!(target, Self::Done | Self::RollingBack),
            Self::RollingBack => matches!(target, Self::RollbackDone),
            Self::RollbackDone => matches!(target, Self::Cancelled),
            Self::Done | Self::Cancelled => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Running => "running",
            Self::RollingBack => "rolling_back",
            Self::RollbackDone => "rollback_done",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Visibility state of a schema object during a change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SchemaState {
    /// Absent.
    #[default]
    None,
    /// Deletes maintain the object; it is invisible otherwise.
    DeleteOnly,
    /// All writes maintain the object; reads do not see it.
    WriteOnly,
    /// Like `WriteOnly`, while historical rows are backfilled.
    WriteReorganization,
    /// No foreground statement touches the object; leftovers are purged.
    DeleteReorganization,
    /// Fully visible.
    Public,
}

/// Forward path of an object being added.
pub const ADD_PATH: [SchemaState; 5] = [
    SchemaState::None,
    SchemaState::DeleteOnly,
    SchemaState::WriteOnly,
    SchemaState::WriteReorganization,
    SchemaState::Public,
];

/// Path of an object being dropped.
pub const DROP_PATH: [SchemaState; 5] = [
    SchemaState::Public,
    SchemaState::WriteOnly,
    SchemaState::DeleteOnly,
    SchemaState::DeleteReorganization,
    SchemaState::None,
];

impl SchemaState {
    /// Next state on the add path.
    #[must_use]
    pub const fn next_on_add(self) -> Option<Self> {
        match self {
            Self::None => Some(Self::DeleteOnly),
            Self::DeleteOnly => Some(Self::WriteOnly),
            Self::WriteOnly => Some(Self::WriteReorganization),
            Self::WriteReorganization => Some(Self::Public),
            Self::DeleteReorganization | Self::Public => None,
        }
    }

    /// Next state on the drop path.
    #[must_use]
    pub const fn next_on_drop(self) -> Option<Self> {
        match self {
            Self::Public => Some(Self::WriteOnly),
            Self::WriteOnly => Some(Self::DeleteOnly),
            Self::DeleteOnly => Some(Self::DeleteReorganization),
            Self::DeleteReorganization => Some(Self::None),
            Self::None | Self::WriteReorganization => None,
        }
    }

    /// Previous state on the add path; rollback retraces it.
    #[must_use]
    pub const fn prev_on_add(self) -> Option<Self> {
        match self {
            Self::DeleteOnly => Some(Self::None),
            Self::WriteOnly => Some(Self::DeleteOnly),
            Self::WriteReorganization => Some(Self::WriteOnly),
            Self::Public => Some(Self::WriteReorganization),
            Self::None | Self::DeleteReorganization => None,
        }
    }

    /// Foreground reads see the object.
    #[must_use]
    pub const fn is_public(self) -> bool {
        matches!(self, Self::Public)
    }

    /// Inserts and updates must maintain the object.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            Self::WriteOnly | Self::WriteReorganization | Self::Public
        )
    }

    /// Deletes must remove the object's entries.
    #[must_use]
    pub const fn is_deletable(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::DeleteOnly => "delete_only",
            Self::WriteOnly => "write_only",
            Self::WriteReorganization => "write_reorganization",
            Self::DeleteReorganization => "delete_reorganization",
            Self::Public => "public",
        }
    }
}

impl std::fmt::Display for SchemaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}
