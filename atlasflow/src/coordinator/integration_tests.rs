//! End-to-end tests driving the coordinator through real dispatches,
//! scripted providers and fault-injecting stores.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use super::{Coordinator, StatusView};
use crate::core::{EntityId, ErrorClass, LifecycleState, NewEntity, RecordStatus, Stage};
use crate::errors::{ActivityError, OrchestrationError};
use crate::events::CollectingEventSink;
use crate::orchestrator::{ActivityGroup, OrchestratorSet, StagePlan};
use crate::signal::{RejectReason, Signal, SignalKind, SignalOutcome};
use crate::testing::{
    assert_compensated, assert_completed_activities, assert_event_count, assert_history_stages,
    assert_record_status, fast_config, FixedPlanOrchestrator, FlakyEntityStore, FlakyLedgerStore,
    PipelineHarness, StubActivity,
};

const fn awaiting(stage: Stage) -> LifecycleState {
    LifecycleState::AwaitingUser { stage }
}

const fn failed(stage: Stage, needs_manual_intervention: bool) -> LifecycleState {
    LifecycleState::Failed {
        stage,
        needs_manual_intervention,
    }
}

#[tokio::test]
async fn test_pipeline_reaches_first_gate() {
    let harness = PipelineHarness::new();
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();

    let status = harness
        .wait_for_state(entity.id, awaiting(Stage::Prospect))
        .await;

    assert_history_stages(&status, &[Stage::Prospect]);
    assert_record_status(&status.history[0], RecordStatus::Completed);
    assert_completed_activities(&status.history[0], &["resolve-source"]);
    assert_eq!(
        harness.fetcher.resolve_calls(),
        vec!["https://example.com/a"]
    );
    harness.wait_for_events("pipeline.started", 1).await;
    harness.wait_for_events("stage.completed", 1).await;
}

#[tokio::test]
async fn test_proceed_walks_every_gate_to_completion() {
    let harness = PipelineHarness::new();
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    for stage in [Stage::Prospect, Stage::Extract, Stage::Transmute] {
        harness.wait_for_state(id, awaiting(stage)).await;
        let outcome = harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
        assert_eq!(outcome, SignalOutcome::Accepted);
    }
    // Confer has no gate; its completion finishes the pipeline.
    let status = harness.wait_for_state(id, LifecycleState::Completed).await;

    assert_history_stages(
        &status,
        &[Stage::Prospect, Stage::Extract, Stage::Transmute, Stage::Confer],
    );
    for record in &status.history {
        assert_record_status(record, RecordStatus::Completed);
    }
    assert_completed_activities(&status.history[3], &["render-digest"]);

    let mut kinds: Vec<String> = harness
        .artifacts
        .inner()
        .for_entity(id)
        .into_iter()
        .map(|a| a.kind)
        .collect();
    kinds.sort();
    assert_eq!(
        kinds,
        vec!["highlights", "insights", "render", "summary", "transmutation"]
    );
}

#[tokio::test]
async fn test_auto_advance_completes_without_signals() {
    let harness = PipelineHarness::builder().auto_advance().build();
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();

    let status = harness
        .wait_for_state(entity.id, LifecycleState::Completed)
        .await;

    assert_history_stages(
        &status,
        &[Stage::Prospect, Stage::Extract, Stage::Transmute, Stage::Confer],
    );
    harness.wait_for_events("stage.completed", 4).await;
    assert_event_count(&harness.events, "signal.accepted", 0);
}

#[tokio::test]
async fn test_duplicate_start_is_idempotent() {
    let harness = PipelineHarness::new();
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    // Redelivered start while the first dispatch may still be running.
    harness.coordinator.start_pipeline(id).await.unwrap();
    harness.wait_for_state(id, awaiting(Stage::Prospect)).await;
    // And again at rest.
    harness.coordinator.start_pipeline(id).await.unwrap();

    let status = harness.coordinator.get_status(id).await.unwrap();
    assert_eq!(status.state, awaiting(Stage::Prospect));
    assert_history_stages(&status, &[Stage::Prospect]);
    assert_eq!(harness.fetcher.resolve_calls().len(), 1);
    assert_event_count(&harness.events, "pipeline.started", 1);
}

#[tokio::test]
async fn test_double_proceed_advances_one_gate() {
    let harness = PipelineHarness::new();
    let gate = harness.generator.gate("summary");
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    harness.wait_for_state(id, awaiting(Stage::Prospect)).await;
    let first = harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
    assert_eq!(first, SignalOutcome::Accepted);

    // Extract is now in flight; the duplicate proceed lands while Running
    // and carries the pre-gate version stamp.
    gate.entered().await;
    let second = harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
    assert_eq!(second, SignalOutcome::Accepted);
    gate.release();

    harness.wait_for_state(id, awaiting(Stage::Extract)).await;
    harness.wait_for_events("signal.dropped", 1).await;

    // The stale proceed advanced nothing.
    let status = harness.coordinator.get_status(id).await.unwrap();
    assert_eq!(status.state, awaiting(Stage::Extract));
    assert_history_stages(&status, &[Stage::Prospect, Stage::Extract]);
}

#[tokio::test]
async fn test_transient_activity_retries_within_stage() {
    let harness = PipelineHarness::new();
    harness
        .generator
        .fail_times("summary", 2, || ActivityError::transient("model overloaded"));
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    harness.wait_for_state(id, awaiting(Stage::Prospect)).await;
    harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
    let status = harness.wait_for_state(id, awaiting(Stage::Extract)).await;

    assert_eq!(harness.generator.calls_for("summary"), 3);
    let record = &status.history[1];
    assert_record_status(record, RecordStatus::Completed);
    assert_eq!(record.outcome("generate-summary").unwrap().attempts, 3);
    harness.wait_for_events("activity.retry", 2).await;
}

#[tokio::test]
async fn test_permanent_failure_fails_without_retry() {
    let harness = PipelineHarness::new();
    harness
        .fetcher
        .script_resolve(Err(ActivityError::permanent("paywalled source")));
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();

    let status = harness
        .wait_for_state(entity.id, failed(Stage::Prospect, false))
        .await;

    assert_eq!(harness.fetcher.resolve_calls().len(), 1);
    assert!(!status.needs_manual_intervention);
    let record = &status.history[0];
    assert_record_status(record, RecordStatus::Failed);
    let outcome = record.outcome("resolve-source").unwrap();
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.error.as_ref().unwrap().class, ErrorClass::Permanent);
    assert!(status.last_error.is_some());
    assert_event_count(&harness.events, "activity.retry", 0);
}

#[tokio::test]
async fn test_stage_failure_compensates_completed_activities() {
    let harness = PipelineHarness::new();
    harness
        .generator
        .fail_times("insights", 3, || ActivityError::transient("capacity"));
    let gate = harness.generator.gate("summary");
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    harness.wait_for_state(id, awaiting(Stage::Prospect)).await;
    harness.coordinator.signal(id, Signal::Proceed).await.unwrap();

    // A proceed queued while Extract is in flight must not advance a
    // pipeline whose stage then fails.
    gate.entered().await;
    harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
    gate.release();

    let status = harness.wait_for_state(id, failed(Stage::Extract, false)).await;
    harness.wait_for_events("signal.dropped", 1).await;

    let record = &status.history[1];
    assert_record_status(record, RecordStatus::Failed);
    let report = record.compensation.as_ref().unwrap();
    assert!(report.clean);
    assert_compensated(
        report,
        &["generate-highlights", "generate-summary", "fetch-clean-text"],
    );
    assert_eq!(report.skipped, vec!["generate-insights"]);
    assert!(harness.artifacts.inner().is_empty());
    assert_event_count(&harness.events, "compensation.completed", 1);

    let after = harness.coordinator.get_status(id).await.unwrap();
    assert_eq!(after.state, failed(Stage::Extract, false));
}

#[tokio::test]
async fn test_retry_after_failure_uses_fresh_attempt() {
    let harness = PipelineHarness::new();
    harness
        .generator
        .fail_times("insights", 3, || ActivityError::transient("capacity"));
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    harness.wait_for_state(id, awaiting(Stage::Prospect)).await;
    harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
    harness.wait_for_state(id, failed(Stage::Extract, false)).await;

    let outcome = harness.coordinator.signal(id, Signal::Retry).await.unwrap();
    assert_eq!(outcome, SignalOutcome::Accepted);
    let status = harness.wait_for_state(id, awaiting(Stage::Extract)).await;

    // The failed attempt appended a record, so the retry runs under a new
    // attempt class: every activity executes fresh instead of replaying
    // results whose artifacts were compensated away.
    assert_history_stages(&status, &[Stage::Prospect, Stage::Extract, Stage::Extract]);
    assert_record_status(&status.history[1], RecordStatus::Failed);
    assert_record_status(&status.history[2], RecordStatus::Completed);
    assert_eq!(status.history[2].attempt, 1);
    assert_eq!(harness.fetcher.fetch_calls().len(), 2);
    assert_event_count(&harness.events, "activity.replayed", 0);
    assert_eq!(harness.artifacts.inner().for_entity(id).len(), 3);
}

#[tokio::test]
async fn test_cancel_in_flight_unwinds_and_discards() {
    let harness = PipelineHarness::new();
    let gate = harness.generator.gate("transmutation");
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    for stage in [Stage::Prospect, Stage::Extract] {
        harness.wait_for_state(id, awaiting(stage)).await;
        harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
    }

    gate.entered().await;
    let outcome = harness.coordinator.signal(id, Signal::Cancel).await.unwrap();
    assert_eq!(outcome, SignalOutcome::Accepted);
    gate.release();

    let status = harness.wait_for_state(id, LifecycleState::Discarded).await;

    let record = status.history.last().unwrap();
    assert_eq!(record.stage, Stage::Transmute);
    assert_record_status(record, RecordStatus::Cancelled);
    let report = record.compensation.as_ref().unwrap();
    assert!(report.clean);
    assert_compensated(report, &["draft-transmutation"]);
    assert_eq!(report.skipped, vec!["store-draft"]);
    // Earlier stages stay settled; only the cancelled attempt unwound.
    assert_eq!(harness.artifacts.inner().for_entity(id).len(), 3);
    assert_event_count(&harness.events, "stage.cancelled", 1);

    // Cancel and discard are idempotent once discarded; anything else is
    // rejected.
    let again = harness.coordinator.signal(id, Signal::Cancel).await.unwrap();
    assert_eq!(again, SignalOutcome::Accepted);
    let discard = harness.coordinator.signal(id, Signal::Discard).await.unwrap();
    assert_eq!(discard, SignalOutcome::Accepted);
    assert!(matches!(
        harness.coordinator.signal(id, Signal::Retry).await.unwrap(),
        SignalOutcome::Rejected { .. }
    ));
}

#[tokio::test]
async fn test_cancel_at_gate_discards_without_compensation() {
    let harness = PipelineHarness::new();
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    harness.wait_for_state(id, awaiting(Stage::Prospect)).await;
    harness.coordinator.signal(id, Signal::Cancel).await.unwrap();
    let status = harness.wait_for_state(id, LifecycleState::Discarded).await;

    // Nothing was in flight, so nothing unwinds: the completed Prospect
    // attempt keeps its artifacts of record.
    assert_history_stages(&status, &[Stage::Prospect]);
    assert_record_status(&status.history[0], RecordStatus::Completed);
    assert!(status.history[0].compensation.is_none());
    assert_event_count(&harness.events, "compensation.started", 0);
    assert_event_count(&harness.events, "stage.cancelled", 0);
}

#[tokio::test]
async fn test_fatal_compensation_flags_manual_intervention() {
    let harness = PipelineHarness::new();
    harness
        .generator
        .fail_times("insights", 3, || ActivityError::transient("capacity"));
    harness
        .artifacts
        .fail_next_delete(ActivityError::permanent("artifact store refused"));
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    harness.wait_for_state(id, awaiting(Stage::Prospect)).await;
    harness.coordinator.signal(id, Signal::Proceed).await.unwrap();

    let status = harness.wait_for_state(id, failed(Stage::Extract, true)).await;
    assert!(status.needs_manual_intervention);

    let report = status.history[1].compensation.as_ref().unwrap();
    assert!(!report.clean);
    assert_compensated(report, &[]);
    assert_eq!(
        report.skipped,
        vec!["generate-insights", "generate-summary", "fetch-clean-text"]
    );
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.activity.as_deref(), Some("generate-highlights"));
    assert_event_count(&harness.events, "compensation.failed", 1);

    // Manual intervention flags the entity; it does not lock it.
    let note = harness
        .coordinator
        .signal(id, Signal::feedback(serde_json::json!({"note": "cleaned up"})))
        .await
        .unwrap();
    assert_eq!(note, SignalOutcome::Accepted);
    let retry = harness.coordinator.signal(id, Signal::Retry).await.unwrap();
    assert_eq!(retry, SignalOutcome::Accepted);
    harness.wait_for_state(id, awaiting(Stage::Extract)).await;

    // The two artifacts the stopped walk never deleted are still there,
    // alongside the three the retry produced.
    assert_eq!(harness.artifacts.inner().for_entity(id).len(), 5);
}

#[tokio::test]
async fn test_transient_compensation_retries_clean() {
    let harness = PipelineHarness::new();
    harness
        .generator
        .fail_times("insights", 3, || ActivityError::transient("capacity"));
    harness
        .artifacts
        .fail_delete_times(2, || ActivityError::transient("storage blip"));
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    harness.wait_for_state(id, awaiting(Stage::Prospect)).await;
    harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
    let status = harness.wait_for_state(id, failed(Stage::Extract, false)).await;

    let report = status.history[1].compensation.as_ref().unwrap();
    assert!(report.clean);
    assert_compensated(
        report,
        &["generate-highlights", "generate-summary", "fetch-clean-text"],
    );
    // The first compensator needed three delete attempts, the second one.
    assert_eq!(harness.artifacts.delete_calls().len(), 4);
    assert!(harness.artifacts.inner().is_empty());
}

#[tokio::test]
async fn test_ledger_outage_redrives_without_duplicate_effects() {
    // Fail the fifth ledger operation: the first read of Extract's
    // parallel group, after Prospect and the text fetch have recorded.
    let ledger_store = Arc::new(FlakyLedgerStore::failing_after(4, 1));
    let harness = PipelineHarness::builder()
        .auto_advance()
        .with_ledger_store(ledger_store)
        .build();
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    let status = harness.wait_for_state(id, LifecycleState::Completed).await;

    assert_history_stages(
        &status,
        &[Stage::Prospect, Stage::Extract, Stage::Transmute, Stage::Confer],
    );
    // The aborted dispatch appended nothing and the re-drive kept the same
    // attempt class, so recorded work replayed and every side effect ran
    // exactly once.
    assert_eq!(harness.fetcher.fetch_calls().len(), 1);
    for task in ["summary", "highlights", "insights"] {
        assert_eq!(harness.generator.calls_for(task), 1, "task {task} reran");
    }
    harness.wait_for_events("stage.redrive", 1).await;
    assert_event_count(&harness.events, "activity.replayed", 3);
}

/// Status poll for tests that wire the coordinator by hand instead of
/// going through the harness.
async fn poll_until_state(
    coordinator: &Coordinator,
    id: EntityId,
    state: LifecycleState,
) -> StatusView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = coordinator.get_status(id).await.unwrap();
        if status.state == state {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on {id}; state is {}",
            status.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_store_outage_parks_at_gate_until_resignalled() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let store = Arc::new(FlakyEntityStore::new());
    let events = Arc::new(CollectingEventSink::new());
    let orchestrators = OrchestratorSet::new()
        .with(Arc::new(FixedPlanOrchestrator::new(
            Stage::Prospect,
            StagePlan::new().then(ActivityGroup::single(Arc::new(
                StubActivity::remote("step-a").with_log(log.clone()),
            ))),
        )))
        .with(Arc::new(FixedPlanOrchestrator::new(
            Stage::Extract,
            StagePlan::new().then(ActivityGroup::single(Arc::new(
                StubActivity::remote("step-b").with_log(log.clone()),
            ))),
        )));
    let coordinator = Coordinator::builder()
        .with_store(store.clone())
        .with_orchestrators(orchestrators)
        .with_config(fast_config())
        .with_events(events.clone())
        .build();

    let entity = coordinator
        .register(NewEntity::new("https://example.com/a", "newsletter"))
        .await
        .unwrap();
    let id = entity.id;
    coordinator.start_pipeline(id).await.unwrap();
    poll_until_state(&coordinator, id, awaiting(Stage::Prospect)).await;

    // Two updates have landed (start and the gate write). The third is
    // the proceed apply; the armed outage eats it and the queued signal
    // with it.
    store.fail_next_updates(1);
    let outcome = coordinator.signal(id, Signal::Proceed).await.unwrap();
    assert_eq!(outcome, SignalOutcome::Accepted);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.update_calls().len() < 3 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "driver never hit the outage"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The apply was not retried and the entity did not move. The signal
    // is gone without a verdict rather than half-applied.
    assert_eq!(store.update_calls().len(), 3);
    let parked = coordinator.get_status(id).await.unwrap();
    assert_eq!(parked.state, awaiting(Stage::Prospect));
    assert_event_count(&events, "signal.dropped", 0);

    // The aborted driver released its claim; a fresh proceed re-drives.
    let retry = coordinator.signal(id, Signal::Proceed).await.unwrap();
    assert_eq!(retry, SignalOutcome::Accepted);
    let status = poll_until_state(&coordinator, id, awaiting(Stage::Extract)).await;

    assert_history_stages(&status, &[Stage::Prospect, Stage::Extract]);
    assert_record_status(&status.history[1], RecordStatus::Completed);
    assert_eq!(log.lock().clone(), vec!["run:step-a", "run:step-b"]);
    assert_event_count(&events, "stage.redrive", 0);
}

#[tokio::test]
async fn test_feedback_accumulates_and_guides_generation() {
    let harness = PipelineHarness::new();
    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let id = entity.id;

    harness.wait_for_state(id, awaiting(Stage::Prospect)).await;
    for payload in [
        serde_json::json!({"tone": "casual"}),
        serde_json::json!({"length": "short"}),
    ] {
        let outcome = harness
            .coordinator
            .signal(id, Signal::feedback(payload))
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Accepted);
    }

    // Feedback lands immediately and never advances the gate.
    let status = harness.coordinator.get_status(id).await.unwrap();
    assert_eq!(status.state, awaiting(Stage::Prospect));
    assert_eq!(status.feedback_count, 2);

    harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
    harness.wait_for_state(id, awaiting(Stage::Extract)).await;
    harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
    harness.wait_for_state(id, awaiting(Stage::Transmute)).await;

    let drafting = harness
        .generator
        .calls()
        .into_iter()
        .find(|r| r.task == "transmutation")
        .unwrap();
    assert_eq!(
        drafting.guidance,
        vec![
            serde_json::json!({"tone": "casual"}),
            serde_json::json!({"length": "short"})
        ]
    );
    assert_eq!(drafting.purpose.as_deref(), Some("newsletter"));
}

#[tokio::test]
async fn test_unknown_entity_is_rejected() {
    let harness = PipelineHarness::new();
    let id = EntityId::new();

    let outcome = harness.coordinator.signal(id, Signal::Proceed).await.unwrap();
    assert_eq!(
        outcome,
        SignalOutcome::rejected(RejectReason::UnknownEntity { id })
    );
    assert!(matches!(
        harness.coordinator.get_status(id).await,
        Err(OrchestrationError::UnknownEntity { .. })
    ));
    assert!(matches!(
        harness.coordinator.start_pipeline(id).await,
        Err(OrchestrationError::UnknownEntity { .. })
    ));
}

#[tokio::test]
async fn test_signal_validation_on_pending_and_terminal() {
    let harness = PipelineHarness::builder().auto_advance().build();

    // Pending: flow signals are invalid, feedback and discard are not.
    let pending = harness
        .coordinator
        .register(NewEntity::new("https://example.com/p", "newsletter"))
        .await
        .unwrap();
    let outcome = harness
        .coordinator
        .signal(pending.id, Signal::Proceed)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SignalOutcome::rejected(RejectReason::InvalidSignalForState {
            signal: SignalKind::Proceed,
            state: "pending".to_string(),
        })
    );
    assert!(matches!(
        harness.coordinator.signal(pending.id, Signal::Retry).await.unwrap(),
        SignalOutcome::Rejected { .. }
    ));
    let note = harness
        .coordinator
        .signal(pending.id, Signal::feedback(serde_json::json!("early note")))
        .await
        .unwrap();
    assert_eq!(note, SignalOutcome::Accepted);
    let discard = harness
        .coordinator
        .signal(pending.id, Signal::Discard)
        .await
        .unwrap();
    assert_eq!(discard, SignalOutcome::Accepted);
    harness
        .wait_for_state(pending.id, LifecycleState::Discarded)
        .await;

    // Completed: nothing is accepted.
    let done = harness
        .register_and_start("https://example.com/d", "newsletter")
        .await
        .unwrap();
    harness
        .wait_for_state(done.id, LifecycleState::Completed)
        .await;
    for signal in [
        Signal::Proceed,
        Signal::Retry,
        Signal::Discard,
        Signal::Cancel,
        Signal::feedback(serde_json::json!("late")),
    ] {
        assert!(matches!(
            harness.coordinator.signal(done.id, signal).await.unwrap(),
            SignalOutcome::Rejected { .. }
        ));
    }

    // Discarded: duplicate discard and cancel are no-op accepts, the rest
    // is rejected.
    let cancel = harness
        .coordinator
        .signal(pending.id, Signal::Cancel)
        .await
        .unwrap();
    assert_eq!(cancel, SignalOutcome::Accepted);
    assert!(matches!(
        harness.coordinator.signal(pending.id, Signal::Proceed).await.unwrap(),
        SignalOutcome::Rejected { .. }
    ));
    assert!(matches!(
        harness
            .coordinator
            .signal(pending.id, Signal::feedback(serde_json::json!("x")))
            .await
            .unwrap(),
        SignalOutcome::Rejected { .. }
    ));
}

#[tokio::test]
async fn test_compensation_walks_reverse_completion_order() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let plan = StagePlan::new()
        .then(ActivityGroup::single(Arc::new(
            StubActivity::remote("step-a").with_log(log.clone()),
        )))
        .then(ActivityGroup::single(Arc::new(
            StubActivity::remote("step-b").with_log(log.clone()),
        )))
        .then(ActivityGroup::single(Arc::new(
            StubActivity::remote("step-c")
                .with_log(log.clone())
                .then_run(Err(ActivityError::permanent("boom"))),
        )));
    let harness = PipelineHarness::builder()
        .with_orchestrators(OrchestratorSet::new().with(Arc::new(
            FixedPlanOrchestrator::new(Stage::Prospect, plan),
        )))
        .build();

    let entity = harness
        .register_and_start("https://example.com/a", "newsletter")
        .await
        .unwrap();
    let status = harness
        .wait_for_state(entity.id, failed(Stage::Prospect, false))
        .await;

    assert_eq!(
        log.lock().clone(),
        vec![
            "run:step-a",
            "run:step-b",
            "run:step-c",
            "undo:step-b",
            "undo:step-a"
        ]
    );
    let report = status.history[0].compensation.as_ref().unwrap();
    assert_compensated(report, &["step-b", "step-a"]);
    assert_eq!(report.skipped, vec!["step-c"]);
}

#[tokio::test]
async fn test_render_formats_from_registration() {
    let harness = PipelineHarness::builder().auto_advance().build();
    let entity = harness
        .coordinator
        .register(
            NewEntity::new("https://example.com/a", "newsletter")
                .with_output_formats(vec!["digest".to_string(), "cards".to_string()]),
        )
        .await
        .unwrap();
    harness.coordinator.start_pipeline(entity.id).await.unwrap();

    let status = harness
        .wait_for_state(entity.id, LifecycleState::Completed)
        .await;

    let confer = status.history.last().unwrap();
    assert_completed_activities(confer, &["render-digest", "render-cards"]);

    let formats: Vec<String> = harness
        .artifacts
        .inner()
        .for_entity(entity.id)
        .into_iter()
        .filter(|a| a.kind == "render")
        .filter_map(|a| a.format)
        .collect();
    assert_eq!(formats.len(), 2);
    assert!(formats.contains(&"digest".to_string()));
    assert!(formats.contains(&"cards".to_string()));
}
