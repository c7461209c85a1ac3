//! Content entities and the snapshots handed to stage execution.

use super::{LifecycleState, Stage, StageRecord};
use super::record::ErrorDetail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a content entity.
///
/// UUIDv7 keeps identifiers time-ordered, which keeps store scans and log
/// output in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Registration request for a new content entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntity {
    /// Where the content comes from: a URL or a raw-text handle.
    pub source: String,

    /// What the transmutation is for, e.g. `"newsletter"` or `"study-notes"`.
    pub purpose: String,

    /// Output formats Confer should render. Empty means the configured
    /// default set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_formats: Vec<String>,
}

impl NewEntity {
    /// Creates a registration request.
    #[must_use]
    pub fn new(source: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            purpose: purpose.into(),
            output_formats: Vec::new(),
        }
    }

    /// Sets the output formats to render.
    #[must_use]
    pub fn with_output_formats(mut self, formats: Vec<String>) -> Self {
        self.output_formats = formats;
        self
    }
}

/// A user note attached to the entity while a stage gate was open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackNote {
    /// When the note was applied.
    pub at: DateTime<Utc>,

    /// The stage the entity was pinned to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,

    /// Free-form feedback payload.
    pub payload: serde_json::Value,
}

/// A content entity and everything the coordinator knows about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier.
    pub id: EntityId,

    /// Content source handle.
    pub source: String,

    /// Transmutation purpose.
    pub purpose: String,

    /// Output formats for the Confer stage.
    pub output_formats: Vec<String>,

    /// Current lifecycle state.
    pub state: LifecycleState,

    /// Store version this state was entered at. Signals delivered under an
    /// older version belong to an earlier gate and are dropped as stale.
    pub state_version: u64,

    /// Optimistic-concurrency version, bumped by every store update.
    pub version: u64,

    /// One record per resolved stage attempt, in dispatch order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<StageRecord>,

    /// User feedback notes, in delivery order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<FeedbackNote>,

    /// Most recent error observed, kept for the status surface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorDetail>,

    /// When the entity was registered.
    pub created_at: DateTime<Utc>,

    /// When the entity was last written.
    pub updated_at: DateTime<Utc>,

    /// When the entity was discarded, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discarded_at: Option<DateTime<Utc>>,
}

impl Entity {
    /// Creates a pending entity from a registration request.
    #[must_use]
    pub fn register(request: NewEntity) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new(),
            source: request.source,
            purpose: request.purpose,
            output_formats: request.output_formats,
            state: LifecycleState::Pending,
            state_version: 0,
            version: 0,
            history: Vec::new(),
            feedback: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            discarded_at: None,
        }
    }

    /// Moves to a new lifecycle state.
    ///
    /// The gate version is pinned to the version the pending store write
    /// will assign, so it only sticks if that write wins its version check.
    pub fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
        self.state_version = self.version + 1;
        if state == LifecycleState::Discarded {
            self.discarded_at = Some(Utc::now());
        }
    }

    /// Appends a resolved stage record to the history.
    pub fn push_record(&mut self, record: StageRecord) {
        if let Some(error) = &record.error {
            self.last_error = Some(error.clone());
        }
        self.history.push(record);
    }

    /// Appends a feedback note stamped with the current stage.
    pub fn push_feedback(&mut self, payload: serde_json::Value) {
        self.feedback.push(FeedbackNote {
            at: Utc::now(),
            stage: self.state.stage(),
            payload,
        });
    }

    /// Attempt class for the next dispatch of `stage`.
    ///
    /// Derived from history rather than a counter: resolved attempts bump
    /// it, re-drives of an unresolved dispatch do not. That keeps ledger
    /// keys stable exactly when side effects must not repeat.
    #[must_use]
    pub fn attempt_class(&self, stage: Stage) -> u32 {
        u32::try_from(self.history.iter().filter(|r| r.stage == stage).count())
            .unwrap_or(u32::MAX)
    }

    /// The latest completed record for `stage`, if any.
    #[must_use]
    pub fn latest_completed(&self, stage: Stage) -> Option<&StageRecord> {
        self.history
            .iter()
            .rev()
            .find(|r| r.stage == stage && r.is_completed())
    }

    /// The most recent record overall, resolved or not.
    #[must_use]
    pub fn latest_record(&self) -> Option<&StageRecord> {
        self.history.last()
    }

    /// Builds the immutable snapshot a stage dispatch runs against.
    ///
    /// Accumulated data is the merged payloads of completed activities from
    /// the latest completed record of every earlier stage, keyed by activity
    /// name. The current stage contributes nothing; its settled activities
    /// replay from the ledger instead.
    #[must_use]
    pub fn snapshot(&self, stage: Stage) -> EntitySnapshot {
        let mut data = HashMap::new();
        let priors = super::STAGE_SEQUENCE
            .into_iter()
            .take_while(|s| *s != stage);
        for prior in priors {
            if let Some(record) = self.latest_completed(prior) {
                for outcome in record.completed_activities() {
                    if let Some(payload) = &outcome.payload {
                        data.insert(outcome.name.clone(), payload.clone());
                    }
                }
            }
        }
        EntitySnapshot {
            entity_id: self.id,
            source: self.source.clone(),
            purpose: self.purpose.clone(),
            output_formats: self.output_formats.clone(),
            stage,
            attempt: self.attempt_class(stage),
            data,
            feedback: self.feedback.iter().map(|f| f.payload.clone()).collect(),
        }
    }
}

/// Immutable view of an entity handed to a stage dispatch.
///
/// Orchestrators and activities never see the live entity; they read this
/// snapshot and return a record, which keeps stage execution free of store
/// writes and safe to re-drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// The entity being driven.
    pub entity_id: EntityId,

    /// Content source handle.
    pub source: String,

    /// Transmutation purpose.
    pub purpose: String,

    /// Output formats for Confer.
    pub output_formats: Vec<String>,

    /// The stage this dispatch is for.
    pub stage: Stage,

    /// Attempt class of this dispatch.
    pub attempt: u32,

    /// Payloads of previously completed activities, keyed by activity name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,

    /// Feedback payloads delivered so far, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<serde_json::Value>,
}

impl EntitySnapshot {
    /// Reads an accumulated payload by activity name.
    #[must_use]
    pub fn data(&self, activity: &str) -> Option<&serde_json::Value> {
        self.data.get(activity)
    }

    /// Reads a string field out of an accumulated payload.
    #[must_use]
    pub fn data_str(&self, activity: &str, field: &str) -> Option<&str> {
        self.data
            .get(activity)
            .and_then(|v| v.get(field))
            .and_then(serde_json::Value::as_str)
    }
}
