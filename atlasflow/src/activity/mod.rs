//! Activities: the unit of work inside a stage.
//!
//! An activity is either remote (provider calls with side effects, executed
//! through the idempotency ledger) or local (pure compute over the
//! snapshot). The [`ActivityRunner`] owns the invocation loop: ledger
//! lookup, per-attempt timeout, transient retry with backoff, cancel checks
//! at attempt boundaries and a hard stage deadline.

mod catalog;
mod retry;

pub use catalog::{
    DraftTransmutation, FetchCleanText, GenerateDerived, RenderFormat, ResolveSource, StoreDraft,
};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy, RetryState};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::cancellation::CancelFlag;
use crate::core::{ActivityOutcome, EntityId, EntitySnapshot, ErrorDetail, Stage};
use crate::errors::{ActivityError, CompensationError, LedgerError};
use crate::events::EventSink;
use crate::ledger::{ExecuteOutcome, IdempotencyLedger};

/// Whether an activity leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    /// Calls a provider and may leave side effects. Runs under the ledger.
    Remote,
    /// Pure compute over the snapshot. No ledger, single attempt by default.
    Local,
}

/// Execution context for one activity invocation.
#[derive(Debug)]
pub struct ActivityContext<'a> {
    /// The entity being driven.
    pub entity_id: EntityId,
    /// The stage this invocation belongs to.
    pub stage: Stage,
    /// Attempt class of the surrounding dispatch.
    pub attempt: u32,
    /// The idempotency key for this invocation.
    pub key: String,
    /// Immutable entity snapshot.
    pub snapshot: &'a EntitySnapshot,
    /// Accumulated payloads: prior stages plus earlier groups of this
    /// stage, keyed by activity name.
    pub data: &'a HashMap<String, serde_json::Value>,
}

impl ActivityContext<'_> {
    /// Reads an upstream payload by activity name.
    #[must_use]
    pub fn input(&self, activity: &str) -> Option<&serde_json::Value> {
        self.data.get(activity)
    }

    /// Reads an upstream payload, failing permanently when absent. Missing
    /// upstream data means the plan is wired wrong; retrying cannot fix it.
    pub fn require(&self, activity: &str) -> Result<&serde_json::Value, ActivityError> {
        self.input(activity).ok_or_else(|| {
            ActivityError::permanent(format!("missing upstream payload from '{activity}'"))
        })
    }

    /// Reads a string field out of an upstream payload.
    pub fn require_str(&self, activity: &str, field: &str) -> Result<&str, ActivityError> {
        self.require(activity)?
            .get(field)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                ActivityError::permanent(format!(
                    "upstream payload from '{activity}' has no string field '{field}'"
                ))
            })
    }
}

/// Context for compensating one completed activity.
#[derive(Debug)]
pub struct CompensateContext<'a> {
    /// The entity being unwound.
    pub entity_id: EntityId,
    /// The stage whose attempt is being unwound.
    pub stage: Stage,
    /// The completed outcome to undo.
    pub outcome: &'a ActivityOutcome,
}

impl CompensateContext<'_> {
    /// Reads a string field out of the recorded payload.
    #[must_use]
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.outcome
            .payload
            .as_ref()
            .and_then(|p| p.get(field))
            .and_then(serde_json::Value::as_str)
    }
}

/// One unit of stage work with an optional compensating action.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Name, unique within the stage plan. Also the payload key downstream
    /// activities read.
    fn name(&self) -> &str;

    /// Remote or local.
    fn kind(&self) -> ActivityKind;

    /// Runs the activity body once.
    async fn run(&self, ctx: &ActivityContext<'_>) -> Result<serde_json::Value, ActivityError>;

    /// Undoes the side effect of a completed invocation. The default is a
    /// no-op for activities without side effects.
    async fn compensate(&self, ctx: &CompensateContext<'_>) -> Result<(), CompensationError> {
        let _ = ctx;
        Ok(())
    }
}

/// Runs single activity invocations to a settled [`ActivityOutcome`].
pub struct ActivityRunner {
    ledger: Arc<IdempotencyLedger>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ActivityRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRunner").finish_non_exhaustive()
    }
}

impl ActivityRunner {
    /// Creates a runner over a ledger and event sink.
    #[must_use]
    pub fn new(ledger: Arc<IdempotencyLedger>, events: Arc<dyn EventSink>) -> Self {
        Self { ledger, events }
    }

    /// Drives one activity to a settled outcome.
    ///
    /// Cancel and deadline are checked at attempt boundaries only; an
    /// attempt in flight always finishes. Ledger failures abort the whole
    /// invocation without an outcome so the dispatch can be re-driven.
    pub async fn run(
        &self,
        activity: &dyn Activity,
        ctx: &ActivityContext<'_>,
        policy: &RetryPolicy,
        attempt_timeout: Duration,
        deadline: Instant,
        cancel: &CancelFlag,
    ) -> Result<ActivityOutcome, LedgerError> {
        let name = activity.name().to_string();
        let mut state = RetryState::new();
        let mut last_error: Option<ActivityError> = None;

        loop {
            if cancel.is_cancelled() {
                let detail = last_error.map(|e| e.into_detail(&name));
                return Ok(ActivityOutcome::planned(&name, &ctx.key)
                    .interrupted(state.attempt, detail));
            }
            let now = Instant::now();
            if now >= deadline {
                let detail = ErrorDetail::transient("stage deadline exceeded")
                    .with_activity(&name);
                return Ok(ActivityOutcome::planned(&name, &ctx.key)
                    .failed(state.attempt, detail));
            }

            let budget = attempt_timeout.min(deadline - now);
            let budget_remains = state.record_attempt(policy);
            let executed = self.attempt_once(activity, ctx, budget).await?;

            match executed {
                ExecuteOutcome::Replayed(payload) => {
                    self.events.try_emit(
                        "activity.replayed",
                        Some(serde_json::json!({
                            "entity_id": ctx.entity_id,
                            "stage": ctx.stage,
                            "activity": name,
                            "key": ctx.key,
                        })),
                    );
                    return Ok(ActivityOutcome::planned(&name, &ctx.key).replayed(payload));
                }
                ExecuteOutcome::Fresh(payload) => {
                    return Ok(ActivityOutcome::planned(&name, &ctx.key)
                        .completed(state.attempt, payload));
                }
                ExecuteOutcome::OpFailed(err) => {
                    if err.is_transient() && budget_remains {
                        let delay = state.backoff_delay(policy);
                        debug!(
                            activity = %name,
                            attempt = state.attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying activity after transient failure"
                        );
                        self.events.try_emit(
                            "activity.retry",
                            Some(serde_json::json!({
                                "entity_id": ctx.entity_id,
                                "stage": ctx.stage,
                                "activity": name,
                                "attempt": state.attempt,
                                "delay_ms": delay.as_millis() as u64,
                            })),
                        );
                        last_error = Some(err);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok(ActivityOutcome::planned(&name, &ctx.key)
                        .failed(state.attempt, err.into_detail(&name)));
                }
            }
        }
    }

    /// Runs one attempt: through the ledger for remote activities, directly
    /// for local ones. Attempt timeouts classify as transient so the retry
    /// budget applies, and a timed-out remote attempt records nothing.
    async fn attempt_once(
        &self,
        activity: &dyn Activity,
        ctx: &ActivityContext<'_>,
        budget: Duration,
    ) -> Result<ExecuteOutcome, LedgerError> {
        let body = || async {
            match tokio::time::timeout(budget, activity.run(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(ActivityError::transient(format!(
                    "attempt timed out after {}ms",
                    budget.as_millis()
                ))),
            }
        };

        match activity.kind() {
            ActivityKind::Remote => self.ledger.execute(&ctx.key, body).await,
            ActivityKind::Local => Ok(match body().await {
                Ok(payload) => ExecuteOutcome::Fresh(payload),
                Err(err) => ExecuteOutcome::OpFailed(err),
            }),
        }
    }
}
