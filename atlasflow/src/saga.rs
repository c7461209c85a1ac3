//! Compensation for failed or cancelled stage attempts.
//!
//! When a stage resolves failed or cancelled, the completed slice of its
//! work may have left side effects behind (stored artifacts, reserved
//! slots). The saga manager walks the attempt's outcomes in reverse plan
//! order and invokes each completed activity's compensating action,
//! retrying retryable failures under the stage's own policy. Replayed
//! outcomes are compensated too: the side effect exists, it just dates
//! from an earlier dispatch of the same attempt.
//!
//! A fatal compensation failure stops the walk. Whatever it left behind
//! is a human's problem from then on, reported as
//! `needs_manual_intervention` and never retried automatically.

use std::sync::Arc;
use tracing::{info, warn};

use crate::activity::{Activity, CompensateContext, RetryPolicy, RetryState};
use crate::core::{ActivityOutcome, CompensationReport, EntityId, ErrorDetail, Stage, StageRecord};
use crate::events::EventSink;
use crate::orchestrator::StagePlan;

/// Runs compensation walks over aborted stage records.
pub struct SagaManager {
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SagaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaManager").finish_non_exhaustive()
    }
}

impl SagaManager {
    /// Creates a manager emitting through the given sink.
    #[must_use]
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }

    /// Unwinds one aborted stage attempt.
    ///
    /// Walks `record`'s outcomes in reverse plan order, compensating each
    /// completed activity through its planned counterpart in `plan`.
    /// Never-completed activities are skipped. The returned report is
    /// `clean` when every completed activity was undone.
    pub async fn compensate(
        &self,
        entity_id: EntityId,
        plan: &StagePlan,
        record: &StageRecord,
        policy: &RetryPolicy,
    ) -> CompensationReport {
        let stage = record.stage;
        self.events
            .emit(
                "compensation.started",
                Some(serde_json::json!({
                    "entity_id": entity_id,
                    "stage": stage,
                    "attempt": record.attempt,
                })),
            )
            .await;

        let mut compensated = Vec::new();
        let mut skipped = Vec::new();
        let targets: Vec<&ActivityOutcome> = record.activities.iter().rev().collect();

        for (index, outcome) in targets.iter().enumerate() {
            if !outcome.is_completed() {
                skipped.push(outcome.name.clone());
                continue;
            }

            let result = match plan.activity(&outcome.name) {
                Some(activity) => {
                    self.run_compensator(activity.as_ref(), entity_id, stage, outcome, policy)
                        .await
                }
                // A completed outcome with no planned counterpart cannot be
                // undone; its side effect is orphaned.
                None => Err(ErrorDetail::permanent("no compensating action in plan")
                    .with_activity(&outcome.name)),
            };

            match result {
                Ok(()) => {
                    info!(
                        entity_id = %entity_id,
                        stage = %stage,
                        activity = %outcome.name,
                        "compensated activity"
                    );
                    compensated.push(outcome.name.clone());
                }
                Err(error) => {
                    for unreached in &targets[index + 1..] {
                        skipped.push(unreached.name.clone());
                    }
                    self.events
                        .emit(
                            "compensation.failed",
                            Some(serde_json::json!({
                                "entity_id": entity_id,
                                "stage": stage,
                                "activity": outcome.name,
                                "error": error.to_string(),
                            })),
                        )
                        .await;
                    return CompensationReport::failed(compensated, skipped, error);
                }
            }
        }

        self.events
            .emit(
                "compensation.completed",
                Some(serde_json::json!({
                    "entity_id": entity_id,
                    "stage": stage,
                    "compensated": compensated,
                })),
            )
            .await;
        CompensationReport::clean(compensated, skipped)
    }

    /// Drives one compensator to success or a terminal error.
    async fn run_compensator(
        &self,
        activity: &dyn Activity,
        entity_id: EntityId,
        stage: Stage,
        outcome: &ActivityOutcome,
        policy: &RetryPolicy,
    ) -> Result<(), ErrorDetail> {
        let ctx = CompensateContext {
            entity_id,
            stage,
            outcome,
        };
        let mut state = RetryState::new();

        loop {
            let budget_remains = state.record_attempt(policy);
            match activity.compensate(&ctx).await {
                Ok(()) => return Ok(()),
                Err(err) if err.retryable && budget_remains => {
                    let delay = state.backoff_delay(policy);
                    warn!(
                        entity_id = %entity_id,
                        stage = %stage,
                        activity = %outcome.name,
                        attempt = state.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying compensation"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let detail = if err.retryable {
                        ErrorDetail::transient(err.message)
                    } else {
                        ErrorDetail::permanent(err.message)
                    };
                    return Err(detail.with_activity(&outcome.name));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityContext, ActivityKind};
    use crate::core::ErrorClass;
    use crate::errors::{ActivityError, CompensationError};
    use crate::events::CollectingEventSink;
    use crate::orchestrator::ActivityGroup;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Undoable {
        name: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
        fail_times: AtomicU32,
        fatal: bool,
    }

    impl Undoable {
        fn ok(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                trace,
                fail_times: AtomicU32::new(0),
                fatal: false,
            })
        }

        fn flaky(name: &'static str, trace: Arc<Mutex<Vec<String>>>, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                trace,
                fail_times: AtomicU32::new(failures),
                fatal: false,
            })
        }

        fn broken(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                trace,
                fail_times: AtomicU32::new(0),
                fatal: true,
            })
        }
    }

    #[async_trait]
    impl Activity for Undoable {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> ActivityKind {
            ActivityKind::Remote
        }

        async fn run(&self, _ctx: &ActivityContext<'_>) -> Result<serde_json::Value, ActivityError> {
            Ok(serde_json::json!({}))
        }

        async fn compensate(&self, ctx: &CompensateContext<'_>) -> Result<(), CompensationError> {
            if self.fatal {
                return Err(CompensationError::fatal("artifact store refused delete"));
            }
            if self
                .fail_times
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CompensationError::transient("store busy"));
            }
            self.trace.lock().push(ctx.outcome.name.clone());
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay_ms(1)
            .with_max_delay_ms(5)
    }

    fn completed(name: &str) -> ActivityOutcome {
        ActivityOutcome::planned(name, format!("idem:{name}")).completed(1, serde_json::json!({}))
    }

    fn record_with(outcomes: Vec<ActivityOutcome>) -> StageRecord {
        let mut record = StageRecord::begin(Stage::Extract, 0);
        record.activities = outcomes;
        record.resolve_failed(ErrorDetail::permanent("boom"));
        record
    }

    #[tokio::test]
    async fn test_walks_completed_outcomes_in_reverse() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let plan = StagePlan::single(Undoable::ok("a", trace.clone()))
            .then(
                ActivityGroup::new()
                    .with(Undoable::ok("b", trace.clone()))
                    .with(Undoable::ok("c", trace.clone())),
            )
            .then(ActivityGroup::single(Undoable::ok("d", trace.clone())));

        let record = record_with(vec![
            completed("a"),
            completed("b"),
            completed("c"),
            ActivityOutcome::planned("d", "idem:d")
                .failed(3, ErrorDetail::transient("gave up").with_activity("d")),
        ]);

        let sink = Arc::new(CollectingEventSink::new());
        let saga = SagaManager::new(sink.clone());
        let report = saga
            .compensate(EntityId::new(), &plan, &record, &fast_policy())
            .await;

        assert!(report.clean);
        assert_eq!(report.compensated, vec!["c", "b", "a"]);
        assert_eq!(report.skipped, vec!["d"]);
        assert_eq!(*trace.lock(), vec!["c", "b", "a"]);
        assert_eq!(sink.count_of("compensation.started"), 1);
        assert_eq!(sink.count_of("compensation.completed"), 1);
    }

    #[tokio::test]
    async fn test_replayed_outcome_is_compensated() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let plan = StagePlan::single(Undoable::ok("a", trace.clone()));
        let record = record_with(vec![
            ActivityOutcome::planned("a", "idem:a").replayed(serde_json::json!({})),
        ]);

        let saga = SagaManager::new(Arc::new(CollectingEventSink::new()));
        let report = saga
            .compensate(EntityId::new(), &plan, &record, &fast_policy())
            .await;

        assert!(report.clean);
        assert_eq!(report.compensated, vec!["a"]);
    }

    #[tokio::test]
    async fn test_retryable_failure_retried_to_success() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let flaky = Undoable::flaky("a", trace.clone(), 2);
        let plan = StagePlan::single(flaky);
        let record = record_with(vec![completed("a")]);

        let saga = SagaManager::new(Arc::new(CollectingEventSink::new()));
        let report = saga
            .compensate(EntityId::new(), &plan, &record, &fast_policy())
            .await;

        assert!(report.clean);
        assert_eq!(*trace.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_exhausted_retryable_is_reported_transient() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let plan = StagePlan::single(Undoable::flaky("a", trace.clone(), 10));
        let record = record_with(vec![completed("a")]);

        let saga = SagaManager::new(Arc::new(CollectingEventSink::new()));
        let report = saga
            .compensate(EntityId::new(), &plan, &record, &fast_policy())
            .await;

        assert!(!report.clean);
        let error = report.error.unwrap();
        assert_eq!(error.class, ErrorClass::Transient);
        assert_eq!(error.activity.as_deref(), Some("a"));
        assert!(trace.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_failure_stops_walk() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let plan = StagePlan::new().then(
            ActivityGroup::new()
                .with(Undoable::ok("a", trace.clone()))
                .with(Undoable::broken("b", trace.clone()))
                .with(Undoable::ok("c", trace.clone())),
        );
        let record = record_with(vec![completed("a"), completed("b"), completed("c")]);

        let sink = Arc::new(CollectingEventSink::new());
        let saga = SagaManager::new(sink.clone());
        let report = saga
            .compensate(EntityId::new(), &plan, &record, &fast_policy())
            .await;

        assert!(!report.clean);
        assert_eq!(report.compensated, vec!["c"]);
        assert_eq!(report.skipped, vec!["a"]);
        let error = report.error.unwrap();
        assert_eq!(error.class, ErrorClass::Permanent);
        assert_eq!(error.activity.as_deref(), Some("b"));
        assert_eq!(*trace.lock(), vec!["c"]);
        assert_eq!(sink.count_of("compensation.failed"), 1);
        assert_eq!(sink.count_of("compensation.completed"), 0);
    }

    #[tokio::test]
    async fn test_nothing_completed_is_trivially_clean() {
        let plan = StagePlan::single(Undoable::ok("a", Arc::new(Mutex::new(Vec::new()))));
        let record = record_with(vec![ActivityOutcome::planned("a", "idem:a")
            .failed(1, ErrorDetail::permanent("bad input").with_activity("a"))]);

        let saga = SagaManager::new(Arc::new(CollectingEventSink::new()));
        let report = saga
            .compensate(EntityId::new(), &plan, &record, &fast_policy())
            .await;

        assert!(report.clean);
        assert!(report.compensated.is_empty());
        assert_eq!(report.skipped, vec!["a"]);
    }
}
