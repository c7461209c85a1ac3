//! The pipeline coordinator: lifecycle owner and state machine.
//!
//! The coordinator is the only writer of lifecycle transitions. Inbound
//! calls (`register`, `start_pipeline`, `signal`, `get_status`) validate
//! against the persisted entity and either mutate it directly or enqueue
//! work for the entity's driver. The driver is a spawned task holding an
//! exclusive per-entity claim; it dispatches stages, resolves their
//! records, runs compensation through the saga manager, and applies queued
//! signals at state-check boundaries. Entities are independent: each has
//! its own driver, queue and cancel flag, and there is no cross-entity
//! lock.
//!
//! Every entity mutation is a read-modify-write loop over the versioned
//! store, so a lost race reloads and re-decides instead of clobbering.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::activity::{ActivityRunner, RetryPolicy};
use crate::cancellation::CancelFlag;
use crate::config::PipelineConfig;
use crate::core::{
    Entity, EntityId, EntitySnapshot, ErrorDetail, LifecycleState, NewEntity, RecordStatus, Stage,
    StageRecord,
};
use crate::errors::{OrchestrationError, StoreError};
use crate::events::{EventSink, NoOpEventSink};
use crate::ledger::IdempotencyLedger;
use crate::orchestrator::{OrchestratorSet, StageExecution, StageOrchestrator};
use crate::saga::SagaManager;
use crate::signal::{
    QueuedSignal, RejectReason, Signal, SignalKind, SignalOutcome, SignalQueue,
};
use crate::store::{EntityStore, InMemoryEntityStore};

#[cfg(test)]
mod integration_tests;

/// In-process runtime for one entity: its signal queue, cooperative
/// cancel flag, and the single-driver claim.
#[derive(Debug)]
struct EntityRuntime {
    queue: SignalQueue,
    cancel: CancelFlag,
    driving: AtomicBool,
}

impl EntityRuntime {
    fn new() -> Self {
        Self {
            queue: SignalQueue::new(),
            cancel: CancelFlag::new(),
            driving: AtomicBool::new(false),
        }
    }
}

struct CoordinatorInner {
    store: Arc<dyn EntityStore>,
    runner: ActivityRunner,
    orchestrators: OrchestratorSet,
    saga: SagaManager,
    config: PipelineConfig,
    events: Arc<dyn EventSink>,
    // Never removed once created; a runtime departing while signals land
    // would lose them.
    runtimes: DashMap<EntityId, Arc<EntityRuntime>>,
}

/// Result of a conditional read-modify-write.
enum MutateResult {
    /// The precondition held and the write won its version check.
    Written(Entity),
    /// The precondition no longer held; nothing was written.
    Unchanged(Entity),
}

impl CoordinatorInner {
    fn runtime(&self, id: EntityId) -> Arc<EntityRuntime> {
        self.runtimes
            .entry(id)
            .or_insert_with(|| Arc::new(EntityRuntime::new()))
            .clone()
    }

    /// Read-modify-write with version check. `mutate` runs against a fresh
    /// load on every round and returns false to abort when its
    /// precondition no longer holds.
    async fn mutate<F>(&self, id: EntityId, mutate: F) -> Result<MutateResult, StoreError>
    where
        F: Fn(&mut Entity) -> bool,
    {
        loop {
            let mut entity = self.store.load(id).await?;
            if !mutate(&mut entity) {
                return Ok(MutateResult::Unchanged(entity));
            }
            match self.store.update(entity).await {
                Ok(written) => return Ok(MutateResult::Written(written)),
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn emit_transition(&self, id: EntityId, state: LifecycleState) {
        self.events
            .emit(
                "entity.transitioned",
                Some(serde_json::json!({
                    "entity_id": id,
                    "state": state.label(),
                    "stage": state.stage(),
                })),
            )
            .await;
    }

    async fn emit_signal_verdict(&self, id: EntityId, kind: SignalKind, accepted: bool) {
        let event = if accepted {
            "signal.accepted"
        } else {
            "signal.rejected"
        };
        self.events
            .emit(
                event,
                Some(serde_json::json!({
                    "entity_id": id,
                    "signal": kind,
                })),
            )
            .await;
    }
}

/// Whether a signal is legal in a lifecycle state, before staleness and
/// boundary checks.
///
/// `proceed` is accepted while `Running` even though it cannot apply
/// there: it may be racing the gate transition, and the version stamp
/// sorts fresh from stale when the driver drains it. `retry` on a
/// manual-intervention failure is accepted deliberately; the flag marks
/// what an operator must fix, not a lock on the entity.
const fn signal_valid(kind: SignalKind, state: &LifecycleState) -> bool {
    match kind {
        SignalKind::Proceed => matches!(
            state,
            LifecycleState::AwaitingUser { .. } | LifecycleState::Running { .. }
        ),
        SignalKind::Retry => matches!(state, LifecycleState::Failed { .. }),
        SignalKind::Discard | SignalKind::Cancel => {
            !matches!(state, LifecycleState::Completed)
        }
        SignalKind::Feedback => !state.is_terminal(),
    }
}

/// User-facing view of one entity, as returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub entity_id: EntityId,
    /// Current lifecycle state, stage included where applicable.
    pub state: LifecycleState,
    /// The stage the state is pinned to, if any.
    pub stage: Option<Stage>,
    /// True when compensation failed and an operator must step in.
    pub needs_manual_intervention: bool,
    /// The most recent error observed, never a raw backtrace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorDetail>,
    /// Every resolved stage attempt, oldest first.
    pub history: Vec<StageRecord>,
    /// Number of feedback payloads attached so far.
    pub feedback_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl StatusView {
    fn from_entity(entity: &Entity) -> Self {
        Self {
            entity_id: entity.id,
            state: entity.state,
            stage: entity.state.stage(),
            needs_manual_intervention: entity.state.needs_manual_intervention(),
            last_error: entity.last_error.clone(),
            history: entity.history.clone(),
            feedback_count: entity.feedback.len(),
            updated_at: entity.updated_at,
        }
    }
}

/// Drives entities through the pipeline.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Starts building a coordinator.
    #[must_use]
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    /// Creates a new entity in `Pending`.
    pub async fn register(&self, request: NewEntity) -> Result<Entity, OrchestrationError> {
        let entity = Entity::register(request);
        self.inner.store.insert(entity.clone()).await?;
        self.inner
            .events
            .emit(
                "entity.registered",
                Some(serde_json::json!({
                    "entity_id": entity.id,
                    "source": entity.source,
                    "purpose": entity.purpose,
                })),
            )
            .await;
        info!(entity_id = %entity.id, source = %entity.source, "entity registered");
        Ok(entity)
    }

    /// Moves a pending entity into `Running(Prospect)` and spawns its
    /// driver. Calling it again after the pipeline started is an
    /// idempotent accept, as redelivered dispatches are expected.
    pub async fn start_pipeline(&self, id: EntityId) -> Result<(), OrchestrationError> {
        let result = self
            .inner
            .mutate(id, |entity| {
                if entity.state == LifecycleState::Pending {
                    entity.set_state(LifecycleState::Running {
                        stage: Stage::first(),
                    });
                    true
                } else {
                    false
                }
            })
            .await;
        let result = match result {
            Ok(result) => result,
            Err(StoreError::NotFound { .. }) => {
                return Err(OrchestrationError::UnknownEntity { id })
            }
            Err(err) => return Err(err.into()),
        };

        if let MutateResult::Written(entity) = result {
            self.inner
                .events
                .emit(
                    "pipeline.started",
                    Some(serde_json::json!({"entity_id": id})),
                )
                .await;
            self.inner.emit_transition(id, entity.state).await;
            info!(entity_id = %id, "pipeline started");
        }
        // Also reached on duplicate starts, where it revives an entity
        // left Running without an active driver.
        ensure_driver(&self.inner, id);
        Ok(())
    }

    /// Delivers a user signal.
    ///
    /// Returns the accept/reject verdict; `Err` is reserved for
    /// infrastructure failure. Accepted signals apply immediately
    /// (feedback) or are queued for the driver to apply at the next
    /// state-check boundary.
    pub async fn signal(
        &self,
        id: EntityId,
        signal: Signal,
    ) -> Result<SignalOutcome, OrchestrationError> {
        let inner = &self.inner;
        let entity = match inner.store.load(id).await {
            Ok(entity) => entity,
            Err(StoreError::NotFound { .. }) => {
                inner
                    .emit_signal_verdict(id, signal.kind(), false)
                    .await;
                return Ok(SignalOutcome::rejected(RejectReason::UnknownEntity { id }));
            }
            Err(err) => return Err(err.into()),
        };

        let kind = signal.kind();
        if !signal_valid(kind, &entity.state) {
            inner.emit_signal_verdict(id, kind, false).await;
            info!(
                entity_id = %id,
                signal = %kind,
                state = %entity.state,
                "signal rejected"
            );
            return Ok(SignalOutcome::rejected(RejectReason::InvalidSignalForState {
                signal: kind,
                state: entity.state.label().to_string(),
            }));
        }

        match signal {
            Signal::Feedback { payload } => {
                let result = inner
                    .mutate(id, |entity| {
                        if entity.state.is_terminal() {
                            false
                        } else {
                            entity.push_feedback(payload.clone());
                            true
                        }
                    })
                    .await?;
                match result {
                    MutateResult::Written(_) => {
                        inner.emit_signal_verdict(id, kind, true).await;
                        Ok(SignalOutcome::Accepted)
                    }
                    MutateResult::Unchanged(entity) => {
                        inner.emit_signal_verdict(id, kind, false).await;
                        Ok(SignalOutcome::rejected(
                            RejectReason::InvalidSignalForState {
                                signal: kind,
                                state: entity.state.label().to_string(),
                            },
                        ))
                    }
                }
            }
            Signal::Discard | Signal::Cancel
                if entity.state == LifecycleState::Discarded =>
            {
                // Already discarded; redelivery is a no-op accept.
                inner.emit_signal_verdict(id, kind, true).await;
                Ok(SignalOutcome::Accepted)
            }
            Signal::Cancel => {
                let runtime = inner.runtime(id);
                runtime.cancel.cancel("cancel requested");
                runtime.queue.push(Signal::Cancel, entity.version);
                inner.emit_signal_verdict(id, kind, true).await;
                ensure_driver(inner, id);
                Ok(SignalOutcome::Accepted)
            }
            other => {
                let runtime = inner.runtime(id);
                runtime.queue.push(other, entity.version);
                inner.emit_signal_verdict(id, kind, true).await;
                ensure_driver(inner, id);
                Ok(SignalOutcome::Accepted)
            }
        }
    }

    /// Reads the current status of an entity.
    pub async fn get_status(&self, id: EntityId) -> Result<StatusView, OrchestrationError> {
        match self.inner.store.load(id).await {
            Ok(entity) => Ok(StatusView::from_entity(&entity)),
            Err(StoreError::NotFound { .. }) => Err(OrchestrationError::UnknownEntity { id }),
            Err(err) => Err(err.into()),
        }
    }
}

/// Builder for [`Coordinator`]. Everything has an in-memory default
/// except the orchestrator set, which callers almost always provide.
pub struct CoordinatorBuilder {
    store: Option<Arc<dyn EntityStore>>,
    ledger: Option<Arc<IdempotencyLedger>>,
    orchestrators: OrchestratorSet,
    config: PipelineConfig,
    events: Arc<dyn EventSink>,
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorBuilder {
    /// Creates a builder with in-memory defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: None,
            ledger: None,
            orchestrators: OrchestratorSet::new(),
            config: PipelineConfig::default(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the entity store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the idempotency ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<IdempotencyLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Sets the stage orchestrators.
    #[must_use]
    pub fn with_orchestrators(mut self, orchestrators: OrchestratorSet) -> Self {
        self.orchestrators = orchestrators;
        self
    }

    /// Sets the pipeline configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink shared by the coordinator, runner and saga.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Builds the coordinator.
    #[must_use]
    pub fn build(self) -> Coordinator {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEntityStore::new()));
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(IdempotencyLedger::in_memory()));
        let runner = ActivityRunner::new(ledger, self.events.clone());
        let saga = SagaManager::new(self.events.clone());
        Coordinator {
            inner: Arc::new(CoordinatorInner {
                store,
                runner,
                orchestrators: self.orchestrators,
                saga,
                config: self.config,
                events: self.events,
                runtimes: DashMap::new(),
            }),
        }
    }
}

/// Spawns a driver for the entity unless one is already active.
fn ensure_driver(inner: &Arc<CoordinatorInner>, id: EntityId) {
    let runtime = inner.runtime(id);
    if runtime
        .driving
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            drive(inner, id).await;
        });
    }
}

/// The per-entity driver task. Holds the exclusive claim, works until
/// parked, and re-checks for signals that raced the release.
async fn drive(inner: Arc<CoordinatorInner>, id: EntityId) {
    let runtime = inner.runtime(id);
    loop {
        if let Err(err) = drive_until_parked(&inner, &runtime, id).await {
            error!(
                entity_id = %id,
                error = %err,
                "driver aborted on infrastructure failure; next signal re-drives"
            );
        }
        runtime.driving.store(false, Ordering::SeqCst);
        // A signal may have been queued between the park decision and the
        // release; reclaim and keep going if so.
        if runtime.queue.is_empty()
            || runtime
                .driving
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return;
        }
    }
}

/// Works the entity until there is nothing to do: a gate or failure with
/// an empty queue, a terminal state, or an entity never started.
async fn drive_until_parked(
    inner: &Arc<CoordinatorInner>,
    runtime: &EntityRuntime,
    id: EntityId,
) -> Result<(), OrchestrationError> {
    loop {
        let entity = inner.store.load(id).await?;
        match entity.state {
            LifecycleState::Running { stage } => {
                if apply_pre_dispatch_signals(inner, runtime, id).await? {
                    continue;
                }
                dispatch_stage(inner, runtime, id, stage).await?;
            }
            // Pending is a resting state too: a discard or cancel accepted
            // before the pipeline starts must still land.
            LifecycleState::Pending
            | LifecycleState::AwaitingUser { .. }
            | LifecycleState::Failed { .. } => {
                let Some(queued) = runtime.queue.pop() else {
                    return Ok(());
                };
                apply_queued_signal(inner, id, queued).await?;
            }
            LifecycleState::Completed | LifecycleState::Discarded => {
                while let Some(queued) = runtime.queue.pop() {
                    drop_signal(inner, id, &queued, "entity is terminal").await;
                }
                return Ok(());
            }
        }
    }
}

/// Drains signals queued before a dispatch begins. A pending discard or
/// cancel ends the entity without running the stage; anything else is
/// not applicable while `Running` and is dropped. Returns true when the
/// state changed and the driver should re-read it.
async fn apply_pre_dispatch_signals(
    inner: &Arc<CoordinatorInner>,
    runtime: &EntityRuntime,
    id: EntityId,
) -> Result<bool, OrchestrationError> {
    while let Some(queued) = runtime.queue.pop() {
        match queued.signal.kind() {
            SignalKind::Discard | SignalKind::Cancel => {
                // Nothing has dispatched for this attempt, so there is
                // nothing to compensate.
                let result = inner
                    .mutate(id, |entity| {
                        if entity.state.is_running() {
                            entity.set_state(LifecycleState::Discarded);
                            true
                        } else {
                            false
                        }
                    })
                    .await?;
                match result {
                    MutateResult::Written(entity) => {
                        inner.emit_transition(id, entity.state).await;
                        info!(entity_id = %id, "entity discarded before dispatch");
                        return Ok(true);
                    }
                    MutateResult::Unchanged(_) => {
                        drop_signal(inner, id, &queued, "state moved before apply").await;
                    }
                }
            }
            _ => drop_signal(inner, id, &queued, "not applicable while running").await,
        }
    }
    Ok(false)
}

/// Runs one stage to a resolved record, re-driving the whole dispatch on
/// infrastructure failure up to the configured budget. The attempt class
/// is frozen per dispatch, so a re-drive replays recorded activity
/// results instead of repeating their side effects.
async fn dispatch_stage(
    inner: &Arc<CoordinatorInner>,
    runtime: &EntityRuntime,
    id: EntityId,
    stage: Stage,
) -> Result<(), OrchestrationError> {
    let policy = inner.config.policy(stage);
    let redrive = inner.config.dispatch_retry;
    let mut dispatch = 0u32;

    loop {
        dispatch += 1;
        let entity = inner.store.load(id).await?;
        if entity.state != (LifecycleState::Running { stage }) {
            return Ok(());
        }
        let snapshot = entity.snapshot(stage);

        inner
            .events
            .emit(
                "stage.started",
                Some(serde_json::json!({
                    "entity_id": id,
                    "stage": stage,
                    "attempt": snapshot.attempt,
                    "dispatch": dispatch,
                })),
            )
            .await;
        info!(
            entity_id = %id,
            stage = %stage,
            attempt = snapshot.attempt,
            dispatch,
            "dispatching stage"
        );

        let Some(orchestrator) = inner.orchestrators.get(stage) else {
            let detail =
                ErrorDetail::permanent(format!("no orchestrator registered for stage {stage}"));
            fail_without_record(inner, id, stage, detail).await?;
            return Ok(());
        };

        let exec = StageExecution {
            runner: &inner.runner,
            snapshot: &snapshot,
            policy,
            local_max_attempts: inner.config.local_max_attempts,
            cancel: &runtime.cancel,
        };

        match orchestrator.run(&exec).await {
            Ok(record) => {
                resolve_record(inner, id, orchestrator.as_ref(), &snapshot, record).await?;
                return Ok(());
            }
            Err(err) => {
                warn!(
                    entity_id = %id,
                    stage = %stage,
                    dispatch,
                    error = %err,
                    "dispatch aborted by infrastructure failure"
                );
                inner
                    .events
                    .emit(
                        "stage.redrive",
                        Some(serde_json::json!({
                            "entity_id": id,
                            "stage": stage,
                            "dispatch": dispatch,
                            "error": err.to_string(),
                        })),
                    )
                    .await;
                if dispatch >= redrive.max_attempts {
                    fail_without_record(inner, id, stage, ErrorDetail::infra(err.to_string()))
                        .await?;
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(redrive.backoff_ms)).await;
            }
        }
    }
}

/// Marks the stage failed without appending a record, for dispatches
/// that never produced one. The attempt class is unchanged, so a later
/// retry re-drives under the same idempotency keys.
async fn fail_without_record(
    inner: &Arc<CoordinatorInner>,
    id: EntityId,
    stage: Stage,
    detail: ErrorDetail,
) -> Result<(), OrchestrationError> {
    let result = inner
        .mutate(id, |entity| {
            if entity.state == (LifecycleState::Running { stage }) {
                entity.last_error = Some(detail.clone());
                entity.set_state(LifecycleState::Failed {
                    stage,
                    needs_manual_intervention: false,
                });
                true
            } else {
                false
            }
        })
        .await?;

    if let MutateResult::Written(entity) = result {
        inner
            .events
            .emit(
                "stage.failed",
                Some(serde_json::json!({
                    "entity_id": id,
                    "stage": stage,
                    "error": detail.to_string(),
                })),
            )
            .await;
        inner.emit_transition(id, entity.state).await;
        warn!(entity_id = %id, stage = %stage, error = %detail, "stage failed without record");
    }
    Ok(())
}

/// Translates a resolved stage record into the next lifecycle state,
/// running compensation first for failed and cancelled attempts.
async fn resolve_record(
    inner: &Arc<CoordinatorInner>,
    id: EntityId,
    orchestrator: &dyn StageOrchestrator,
    snapshot: &EntitySnapshot,
    mut record: StageRecord,
) -> Result<(), OrchestrationError> {
    let stage = record.stage;
    match record.status {
        RecordStatus::Completed => {
            let next_state = match stage.next() {
                None => LifecycleState::Completed,
                Some(next) if inner.config.policy(stage).auto_advance => {
                    LifecycleState::Running { stage: next }
                }
                Some(_) => LifecycleState::AwaitingUser { stage },
            };
            inner
                .mutate(id, |entity| {
                    entity.push_record(record.clone());
                    entity.set_state(next_state);
                    true
                })
                .await?;
            inner
                .events
                .emit(
                    "stage.completed",
                    Some(serde_json::json!({
                        "entity_id": id,
                        "stage": stage,
                        "attempt": record.attempt,
                    })),
                )
                .await;
            inner.emit_transition(id, next_state).await;
            info!(entity_id = %id, stage = %stage, next = %next_state, "stage completed");
        }
        RecordStatus::Failed => {
            let plan = orchestrator.plan(snapshot);
            let retry = RetryPolicy::from(inner.config.policy(stage));
            let report = inner.saga.compensate(id, &plan, &record, &retry).await;
            let needs_manual_intervention = !report.clean;
            record.set_compensation(report);

            let next_state = LifecycleState::Failed {
                stage,
                needs_manual_intervention,
            };
            inner
                .mutate(id, |entity| {
                    entity.push_record(record.clone());
                    entity.set_state(next_state);
                    true
                })
                .await?;
            inner
                .events
                .emit(
                    "stage.failed",
                    Some(serde_json::json!({
                        "entity_id": id,
                        "stage": stage,
                        "attempt": record.attempt,
                        "needs_manual_intervention": needs_manual_intervention,
                    })),
                )
                .await;
            inner.emit_transition(id, next_state).await;
            warn!(
                entity_id = %id,
                stage = %stage,
                needs_manual_intervention,
                "stage failed and was compensated"
            );
        }
        RecordStatus::Cancelled => {
            let plan = orchestrator.plan(snapshot);
            let retry = RetryPolicy::from(inner.config.policy(stage));
            let report = inner.saga.compensate(id, &plan, &record, &retry).await;
            record.set_compensation(report);

            inner
                .mutate(id, |entity| {
                    entity.push_record(record.clone());
                    entity.set_state(LifecycleState::Discarded);
                    true
                })
                .await?;
            inner
                .events
                .emit(
                    "stage.cancelled",
                    Some(serde_json::json!({
                        "entity_id": id,
                        "stage": stage,
                        "attempt": record.attempt,
                    })),
                )
                .await;
            inner.emit_transition(id, LifecycleState::Discarded).await;
            info!(entity_id = %id, stage = %stage, "stage cancelled and unwound");
        }
        RecordStatus::Running => {
            error!(entity_id = %id, stage = %stage, "dispatch returned an unresolved record");
        }
    }
    Ok(())
}

/// Applies one queued signal at a resting-state boundary, re-validating
/// against a fresh load inside the version-checked write.
async fn apply_queued_signal(
    inner: &Arc<CoordinatorInner>,
    id: EntityId,
    queued: QueuedSignal,
) -> Result<(), OrchestrationError> {
    match &queued.signal {
        Signal::Proceed => {
            let delivered = queued.delivered_version;
            let result = inner
                .mutate(id, |entity| {
                    if let LifecycleState::AwaitingUser { stage } = entity.state {
                        // A proceed delivered before this gate opened was
                        // aimed at an earlier one; applying it would
                        // double-advance.
                        if delivered >= entity.state_version {
                            if let Some(next) = stage.next() {
                                entity.set_state(LifecycleState::Running { stage: next });
                                return true;
                            }
                        }
                    }
                    false
                })
                .await?;
            match result {
                MutateResult::Written(entity) => {
                    inner.emit_transition(id, entity.state).await;
                    info!(entity_id = %id, next = %entity.state, "proceed applied");
                }
                MutateResult::Unchanged(_) => {
                    drop_signal(inner, id, &queued, "stale or not at a gate").await;
                }
            }
        }
        Signal::Retry => {
            let result = inner
                .mutate(id, |entity| {
                    if let LifecycleState::Failed { stage, .. } = entity.state {
                        entity.set_state(LifecycleState::Running { stage });
                        true
                    } else {
                        false
                    }
                })
                .await?;
            match result {
                MutateResult::Written(entity) => {
                    inner.emit_transition(id, entity.state).await;
                    info!(entity_id = %id, state = %entity.state, "retry applied");
                }
                MutateResult::Unchanged(_) => {
                    drop_signal(inner, id, &queued, "entity is not failed").await;
                }
            }
        }
        Signal::Discard | Signal::Cancel => {
            let result = inner
                .mutate(id, |entity| {
                    if entity.state.is_terminal() || entity.state.is_running() {
                        false
                    } else {
                        entity.set_state(LifecycleState::Discarded);
                        true
                    }
                })
                .await?;
            match result {
                MutateResult::Written(entity) => {
                    inner.emit_transition(id, entity.state).await;
                    info!(entity_id = %id, "entity discarded");
                }
                MutateResult::Unchanged(_) => {
                    drop_signal(inner, id, &queued, "state moved before apply").await;
                }
            }
        }
        // Feedback is applied at delivery and never queued; tolerate a
        // queued one by applying it the same way.
        Signal::Feedback { payload } => {
            let payload = payload.clone();
            inner
                .mutate(id, move |entity| {
                    entity.push_feedback(payload.clone());
                    true
                })
                .await?;
        }
    }
    Ok(())
}

async fn drop_signal(
    inner: &CoordinatorInner,
    id: EntityId,
    queued: &QueuedSignal,
    reason: &str,
) {
    inner
        .events
        .emit(
            "signal.dropped",
            Some(serde_json::json!({
                "entity_id": id,
                "signal": queued.signal.kind(),
                "delivered_version": queued.delivered_version,
                "reason": reason,
            })),
        )
        .await;
    info!(
        entity_id = %id,
        signal = %queued.signal.kind(),
        reason,
        "queued signal dropped"
    );
}
