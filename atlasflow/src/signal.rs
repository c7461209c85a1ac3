//! User-initiated signals and the per-entity signal queue.
//!
//! Signals arrive from outside at any time, including while a stage is
//! in flight. The coordinator validates them against the current
//! lifecycle state, then either applies them immediately or queues them
//! for the driver to apply at the next state-check boundary. Each queued
//! signal is stamped with the entity version current at delivery, so a
//! `proceed` aimed at a gate that has since closed can be recognized as
//! stale and dropped instead of advancing the wrong stage.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::core::EntityId;

/// A user-initiated pipeline signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// Advance past the current `AwaitingUser` gate.
    Proceed,
    /// Re-drive the failed stage with a fresh attempt.
    Retry,
    /// Soft-delete the entity from a resting state.
    Discard,
    /// Stop current work, unwind it, and discard the entity.
    Cancel,
    /// Attach guidance for downstream generation. Does not advance.
    Feedback { payload: serde_json::Value },
}

impl Signal {
    /// Creates a feedback signal.
    #[must_use]
    pub fn feedback(payload: serde_json::Value) -> Self {
        Self::Feedback { payload }
    }

    /// The signal's kind, used for queue dedup and rejection reporting.
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            Self::Proceed => SignalKind::Proceed,
            Self::Retry => SignalKind::Retry,
            Self::Discard => SignalKind::Discard,
            Self::Cancel => SignalKind::Cancel,
            Self::Feedback { .. } => SignalKind::Feedback,
        }
    }
}

/// Signal kind without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Proceed,
    Retry,
    Discard,
    Cancel,
    Feedback,
}

impl SignalKind {
    /// Lowercase name, for logs and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::Retry => "retry",
            Self::Discard => "discard",
            Self::Cancel => "cancel",
            Self::Feedback => "feedback",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a signal was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// No entity with this id is registered.
    UnknownEntity { id: EntityId },
    /// The signal is not legal in the entity's current state.
    InvalidSignalForState { signal: SignalKind, state: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownEntity { id } => write!(f, "unknown entity {id}"),
            Self::InvalidSignalForState { signal, state } => {
                write!(f, "signal '{signal}' is not valid in state '{state}'")
            }
        }
    }
}

/// The coordinator's verdict on a delivered signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignalOutcome {
    /// The signal was accepted for immediate or deferred application.
    Accepted,
    /// The signal was rejected and had no effect.
    Rejected { reason: RejectReason },
}

impl SignalOutcome {
    /// True when the signal was accepted.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Builds a rejection verdict.
    #[must_use]
    pub const fn rejected(reason: RejectReason) -> Self {
        Self::Rejected { reason }
    }
}

/// A signal waiting for the driver, stamped at delivery time.
#[derive(Debug, Clone)]
pub struct QueuedSignal {
    pub signal: Signal,
    /// Entity store version at the moment the signal was accepted. A
    /// queued `proceed` only applies while the gate it targeted is still
    /// the current one, i.e. while `delivered_version >= state_version`.
    pub delivered_version: u64,
    pub queued_at: DateTime<Utc>,
}

/// FIFO signal queue with dedup by kind.
///
/// Duplicate `proceed`/`retry`/`discard`/`cancel` signals collapse into
/// the already-queued one, which is what makes sending `proceed` twice
/// equivalent to sending it once. `Feedback` is never deduplicated; each
/// delivery carries its own payload.
#[derive(Debug, Default)]
pub struct SignalQueue {
    inner: Mutex<VecDeque<QueuedSignal>>,
}

impl SignalQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a signal stamped with the delivering version. Returns
    /// `false` when an equal-kind signal was already queued and this one
    /// was absorbed into it.
    pub fn push(&self, signal: Signal, delivered_version: u64) -> bool {
        let mut inner = self.inner.lock();
        if signal.kind() != SignalKind::Feedback
            && inner.iter().any(|q| q.signal.kind() == signal.kind())
        {
            return false;
        }
        inner.push_back(QueuedSignal {
            signal,
            delivered_version,
            queued_at: Utc::now(),
        });
        true
    }

    /// Takes the oldest queued signal.
    pub fn pop(&self) -> Option<QueuedSignal> {
        self.inner.lock().pop_front()
    }

    /// Number of queued signals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
