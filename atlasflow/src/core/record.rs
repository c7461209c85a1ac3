//! Stage attempt records and activity outcomes.
//!
//! Every dispatched stage attempt produces exactly one [`StageRecord`],
//! appended to the entity history whether the attempt completed, failed or
//! was cancelled. Records are the audit trail the status surface exposes and
//! the input the compensation walk reads, so they carry per-activity detail
//! rather than a bare status.

use super::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How an activity or stage error should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help; fail the stage.
    Permanent,
    /// The orchestration substrate itself was unavailable; the dispatch is
    /// re-driven as if the stage had never started.
    Infra,
}

impl ErrorClass {
    /// Returns true if another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Infra => write!(f, "infra"),
        }
    }
}

/// A classified error captured on records and surfaced through status reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Classification driving retry and failure handling.
    pub class: ErrorClass,

    /// Human-readable description.
    pub message: String,

    /// The activity that produced the error, when attributable to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
}

impl ErrorDetail {
    /// Creates a transient error detail.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
            activity: None,
        }
    }

    /// Creates a permanent error detail.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
            activity: None,
        }
    }

    /// Creates an infrastructure error detail.
    #[must_use]
    pub fn infra(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Infra,
            message: message.into(),
            activity: None,
        }
    }

    /// Attributes the error to an activity.
    #[must_use]
    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.activity {
            Some(activity) => write!(f, "[{}] {activity}: {}", self.class, self.message),
            None => write!(f, "[{}] {}", self.class, self.message),
        }
    }
}

/// The recorded result of one activity within a stage attempt.
///
/// Outcomes are created up front for every planned activity, so a record
/// always shows which activities ran and which never started. An outcome is
/// `terminal` once its runner will not touch it again in this attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityOutcome {
    /// Activity name, unique within its stage plan.
    pub name: String,

    /// The idempotency key this invocation executed under.
    pub key: String,

    /// Attempts actually made in this dispatch. Zero means never started.
    pub attempts: u32,

    /// Output payload of a completed activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Final or most recent error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    /// True when this outcome is settled for the current attempt.
    pub terminal: bool,

    /// True when the payload was replayed from the idempotency ledger
    /// instead of executing the activity body.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

impl ActivityOutcome {
    /// Creates a placeholder for a planned activity that has not run yet.
    #[must_use]
    pub fn planned(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            attempts: 0,
            payload: None,
            error: None,
            terminal: false,
            replayed: false,
        }
    }

    /// Marks the outcome completed with a payload.
    #[must_use]
    pub fn completed(mut self, attempts: u32, payload: serde_json::Value) -> Self {
        self.attempts = attempts;
        self.payload = Some(payload);
        self.error = None;
        self.terminal = true;
        self
    }

    /// Marks the outcome completed from a ledger replay.
    #[must_use]
    pub fn replayed(mut self, payload: serde_json::Value) -> Self {
        self.attempts = 0;
        self.payload = Some(payload);
        self.error = None;
        self.terminal = true;
        self.replayed = true;
        self
    }

    /// Marks the outcome failed for good within this attempt.
    #[must_use]
    pub fn failed(mut self, attempts: u32, error: ErrorDetail) -> Self {
        self.attempts = attempts;
        self.error = Some(error);
        self.terminal = true;
        self
    }

    /// Marks the outcome interrupted before settling, recording the last
    /// error seen if any. A later attempt class may run it again.
    #[must_use]
    pub fn interrupted(mut self, attempts: u32, error: Option<ErrorDetail>) -> Self {
        self.attempts = attempts;
        self.error = error;
        self.terminal = false;
        self
    }

    /// Returns true if the activity produced its side effect and payload.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.terminal && self.error.is_none() && self.payload.is_some()
    }

    /// Returns true if the activity settled on failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.terminal && self.error.is_some()
    }
}

/// How a stage attempt resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Attempt is in flight. Never persisted to history.
    Running,
    /// All planned activities completed.
    Completed,
    /// An activity failed permanently or exhausted its retries.
    Failed,
    /// A cancel flag aborted the attempt between activity boundaries.
    Cancelled,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary of the compensation walk attached to a failed or cancelled record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationReport {
    /// True when every completed activity was compensated.
    pub clean: bool,

    /// Activities compensated, in walk order (reverse completion order).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensated: Vec<String>,

    /// Activities whose compensator did not run: the forward activity never
    /// completed, or the walk stopped on a fatal failure before reaching it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,

    /// The compensation failure that stopped the walk, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl CompensationReport {
    /// A report for a walk that undid everything it needed to.
    #[must_use]
    pub fn clean(compensated: Vec<String>, skipped: Vec<String>) -> Self {
        Self {
            clean: true,
            compensated,
            skipped,
            error: None,
        }
    }

    /// A report for a walk stopped by a failed compensator.
    #[must_use]
    pub fn failed(compensated: Vec<String>, skipped: Vec<String>, error: ErrorDetail) -> Self {
        Self {
            clean: false,
            compensated,
            skipped,
            error: Some(error),
        }
    }
}

/// One stage attempt, from dispatch to resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage that was attempted.
    pub stage: Stage,

    /// Attempt class of this dispatch, starting at zero. Frozen for the
    /// whole attempt so idempotency keys stay stable across re-drives.
    pub attempt: u32,

    /// Resolution of the attempt.
    pub status: RecordStatus,

    /// When the dispatch started.
    pub started_at: DateTime<Utc>,

    /// When the attempt resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Outcome per planned activity, in plan order.
    pub activities: Vec<ActivityOutcome>,

    /// The error that failed the stage, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    /// Why the attempt was cancelled, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,

    /// Compensation walk summary for failed or cancelled attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationReport>,
}

impl StageRecord {
    /// Opens a record for a fresh dispatch.
    #[must_use]
    pub fn begin(stage: Stage, attempt: u32) -> Self {
        Self {
            stage,
            attempt,
            status: RecordStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            activities: Vec::new(),
            error: None,
            cancel_reason: None,
            compensation: None,
        }
    }

    /// Resolves the record as completed.
    pub fn resolve_completed(&mut self) {
        self.status = RecordStatus::Completed;
        self.ended_at = Some(Utc::now());
    }

    /// Resolves the record as failed with the stage-level error.
    pub fn resolve_failed(&mut self, error: ErrorDetail) {
        self.status = RecordStatus::Failed;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
    }

    /// Resolves the record as cancelled.
    pub fn resolve_cancelled(&mut self, reason: impl Into<String>) {
        self.status = RecordStatus::Cancelled;
        self.cancel_reason = Some(reason.into());
        self.ended_at = Some(Utc::now());
    }

    /// Attaches the compensation walk summary.
    pub fn set_compensation(&mut self, report: CompensationReport) {
        self.compensation = Some(report);
    }

    /// Returns true if every planned activity completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == RecordStatus::Completed
    }

    /// Returns true for failed or cancelled attempts.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RecordStatus::Failed | RecordStatus::Cancelled)
    }

    /// Outcomes of activities that actually completed, in plan order.
    pub fn completed_activities(&self) -> impl Iterator<Item = &ActivityOutcome> {
        self.activities.iter().filter(|a| a.is_completed())
    }

    /// Looks up an outcome by activity name.
    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&ActivityOutcome> {
        self.activities.iter().find(|a| a.name == name)
    }

    /// Wall-clock duration of the attempt, if it has resolved.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}
