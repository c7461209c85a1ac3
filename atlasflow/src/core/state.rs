//! Entity lifecycle state machine states.

use super::Stage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an entity currently sits in its lifecycle.
///
/// States that carry a [`Stage`] pin the entity to that stage; the pipeline
/// position is part of the state, not tracked separately. Serialized with an
/// internal `status` tag so stored entities remain readable as plain JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LifecycleState {
    /// Registered but not yet started.
    Pending,
    /// A stage attempt is in flight.
    Running {
        /// The stage being executed.
        stage: Stage,
    },
    /// The stage completed and the pipeline is holding for a user gate.
    AwaitingUser {
        /// The stage that completed.
        stage: Stage,
    },
    /// The stage attempt failed and compensation has run.
    Failed {
        /// The stage that failed.
        stage: Stage,
        /// Set when compensation itself failed and an operator must step in.
        needs_manual_intervention: bool,
    },
    /// All four stages completed.
    Completed,
    /// Abandoned by user request or cancellation.
    Discarded,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Pending
    }
}

impl LifecycleState {
    /// Returns true once the entity can never move again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Discarded)
    }

    /// Returns true while a stage attempt is executing.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// The stage this state is pinned to, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Running { stage }
            | Self::AwaitingUser { stage }
            | Self::Failed { stage, .. } => Some(*stage),
            Self::Pending | Self::Completed | Self::Discarded => None,
        }
    }

    /// Returns true when a failed entity is flagged for operator attention.
    #[must_use]
    pub const fn needs_manual_intervention(&self) -> bool {
        matches!(
            self,
            Self::Failed {
                needs_manual_intervention: true,
                ..
            }
        )
    }

    /// Stable lowercase label used in logs and rejection reasons.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running { .. } => "running",
            Self::AwaitingUser { .. } => "awaiting_user",
            Self::Failed { .. } => "failed",
            Self::Completed => "completed",
            Self::Discarded => "discarded",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage() {
            Some(stage) => write!(f, "{}({stage})", self.label()),
            None => write!(f, "{}", self.label()),
        }
    }
}
