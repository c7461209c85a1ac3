//! Mock providers and activities for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::activity::{Activity, ActivityContext, ActivityKind, CompensateContext};
use crate::core::{Entity, EntityId, EntitySnapshot, Stage};
use crate::errors::{ActivityError, CompensationError, LedgerError, StoreError};
use crate::ledger::{InMemoryLedgerStore, LedgerEntry, LedgerStore};
use crate::orchestrator::{StageOrchestrator, StagePlan};
use crate::providers::{
    ArtifactDraft, ArtifactStore, CleanText, ContentFetcher, GeneratedText, GenerationProvider,
    GenerationRequest, InMemoryArtifactStore, SourceInfo, StoredArtifact,
};
use crate::store::{EntityStore, InMemoryEntityStore};

/// A fetcher that replays scripted results and records its calls.
///
/// With nothing scripted every call succeeds with deterministic fabricated
/// content, so happy-path tests need no setup.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    resolve_script: Mutex<VecDeque<Result<SourceInfo, ActivityError>>>,
    fetch_script: Mutex<VecDeque<Result<CleanText, ActivityError>>>,
    resolve_calls: Mutex<Vec<String>>,
    fetch_calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    /// Creates a fetcher that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a result for the next unscripted `resolve` call.
    pub fn script_resolve(&self, result: Result<SourceInfo, ActivityError>) {
        self.resolve_script.lock().push_back(result);
    }

    /// Queues a result for the next unscripted `fetch_text` call.
    pub fn script_fetch(&self, result: Result<CleanText, ActivityError>) {
        self.fetch_script.lock().push_back(result);
    }

    /// Queues `n` copies of a failure for `resolve`.
    pub fn fail_resolve_times(&self, n: usize, make: impl Fn() -> ActivityError) {
        let mut script = self.resolve_script.lock();
        for _ in 0..n {
            script.push_back(Err(make()));
        }
    }

    /// Queues `n` copies of a failure for `fetch_text`.
    pub fn fail_fetch_times(&self, n: usize, make: impl Fn() -> ActivityError) {
        let mut script = self.fetch_script.lock();
        for _ in 0..n {
            script.push_back(Err(make()));
        }
    }

    /// Sources passed to `resolve`, in call order.
    #[must_use]
    pub fn resolve_calls(&self) -> Vec<String> {
        self.resolve_calls.lock().clone()
    }

    /// Canonical urls passed to `fetch_text`, in call order.
    #[must_use]
    pub fn fetch_calls(&self) -> Vec<String> {
        self.fetch_calls.lock().clone()
    }
}

#[async_trait]
impl ContentFetcher for ScriptedFetcher {
    async fn resolve(&self, source: &str) -> Result<SourceInfo, ActivityError> {
        self.resolve_calls.lock().push(source.to_string());
        if let Some(result) = self.resolve_script.lock().pop_front() {
            return result;
        }
        Ok(SourceInfo {
            canonical_url: format!("{source}#canonical"),
            title: "Scripted title".to_string(),
            content_type: "text/html".to_string(),
        })
    }

    async fn fetch_text(&self, canonical_url: &str) -> Result<CleanText, ActivityError> {
        self.fetch_calls.lock().push(canonical_url.to_string());
        if let Some(result) = self.fetch_script.lock().pop_front() {
            return result;
        }
        Ok(CleanText::new(
            "scripted body text with enough words to summarize",
        ))
    }
}

/// Lets a test hold one generation task in flight.
///
/// The provider side signals entry and then waits; the test side waits for
/// [`TaskGate::entered`] and later calls [`TaskGate::release`].
#[derive(Debug)]
pub struct TaskGate {
    entered: tokio::sync::Semaphore,
    release: tokio::sync::Semaphore,
}

impl TaskGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: tokio::sync::Semaphore::new(0),
            release: tokio::sync::Semaphore::new(0),
        })
    }

    /// Waits until the gated task is in flight.
    pub async fn entered(&self) {
        if let Ok(permit) = self.entered.acquire().await {
            permit.forget();
        }
    }

    /// Lets the gated task finish.
    pub fn release(&self) {
        self.release.add_permits(1);
    }

    fn mark_entered(&self) {
        self.entered.add_permits(1);
    }

    async fn wait_release(&self) {
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

/// A generation provider scripted per task name.
///
/// Unscripted tasks succeed with deterministic content, so only the
/// behavior under test needs arranging.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<HashMap<String, VecDeque<Result<GeneratedText, ActivityError>>>>,
    gates: Mutex<HashMap<String, Arc<TaskGate>>>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    /// Creates a generator that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a result for the next call of `task`.
    pub fn script(&self, task: impl Into<String>, result: Result<GeneratedText, ActivityError>) {
        self.scripts
            .lock()
            .entry(task.into())
            .or_default()
            .push_back(result);
    }

    /// Queues `n` copies of a failure for `task`.
    pub fn fail_times(&self, task: &str, n: usize, make: impl Fn() -> ActivityError) {
        let mut scripts = self.scripts.lock();
        let queue = scripts.entry(task.to_string()).or_default();
        for _ in 0..n {
            queue.push_back(Err(make()));
        }
    }

    /// Gates every future call of `task` behind a [`TaskGate`].
    pub fn gate(&self, task: impl Into<String>) -> Arc<TaskGate> {
        let gate = TaskGate::new();
        self.gates.lock().insert(task.into(), gate.clone());
        gate
    }

    /// Every request seen, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().clone()
    }

    /// Number of calls for one task.
    #[must_use]
    pub fn calls_for(&self, task: &str) -> usize {
        self.calls.lock().iter().filter(|r| r.task == task).count()
    }

    fn default_text(task: &str) -> GeneratedText {
        GeneratedText {
            content: format!("generated {task} content"),
            model: "scripted-model".to_string(),
            provider: "scripted".to_string(),
            latency_ms: None,
        }
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedText, ActivityError> {
        self.calls.lock().push(request.clone());
        let gate = self.gates.lock().get(&request.task).cloned();
        if let Some(gate) = gate {
            gate.mark_entered();
            gate.wait_release().await;
        }
        if let Some(result) = self
            .scripts
            .lock()
            .get_mut(&request.task)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        Ok(Self::default_text(&request.task))
    }
}

/// An artifact store whose deletes can be made to fail.
///
/// Failures are consumed in order; with none queued it behaves exactly
/// like the in-memory store it wraps.
#[derive(Debug, Default)]
pub struct FlakyArtifacts {
    inner: InMemoryArtifactStore,
    delete_failures: Mutex<VecDeque<ActivityError>>,
    delete_calls: Mutex<Vec<String>>,
}

impl FlakyArtifacts {
    /// Creates a store with no scripted failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next delete.
    pub fn fail_next_delete(&self, err: ActivityError) {
        self.delete_failures.lock().push_back(err);
    }

    /// Queues `n` copies of a failure for upcoming deletes.
    pub fn fail_delete_times(&self, n: usize, make: impl Fn() -> ActivityError) {
        let mut failures = self.delete_failures.lock();
        for _ in 0..n {
            failures.push_back(make());
        }
    }

    /// Artifact ids passed to delete, failures included, in call order.
    #[must_use]
    pub fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().clone()
    }

    /// The wrapped store, for content assertions.
    #[must_use]
    pub fn inner(&self) -> &InMemoryArtifactStore {
        &self.inner
    }
}

#[async_trait]
impl ArtifactStore for FlakyArtifacts {
    async fn put(&self, draft: ArtifactDraft) -> Result<String, ActivityError> {
        self.inner.put(draft).await
    }

    async fn get(&self, artifact_id: &str) -> Result<Option<StoredArtifact>, ActivityError> {
        self.inner.get(artifact_id).await
    }

    async fn delete(&self, artifact_id: &str) -> Result<(), ActivityError> {
        self.delete_calls.lock().push(artifact_id.to_string());
        if let Some(err) = self.delete_failures.lock().pop_front() {
            return Err(err);
        }
        self.inner.delete(artifact_id).await
    }
}

/// A ledger store that fails a contiguous window of operations.
///
/// Operations are counted across get, put, delete and clear. Indices in
/// `[fail_from, fail_from + fail_count)` return
/// [`LedgerError::Unavailable`]; everything else hits the wrapped
/// in-memory store.
#[derive(Debug)]
pub struct FlakyLedgerStore {
    inner: InMemoryLedgerStore,
    ops: AtomicU32,
    fail_from: u32,
    fail_count: u32,
}

impl FlakyLedgerStore {
    /// Fails `fail_count` operations after the first `successes` succeed.
    #[must_use]
    pub fn failing_after(successes: u32, fail_count: u32) -> Self {
        Self {
            inner: InMemoryLedgerStore::new(),
            ops: AtomicU32::new(0),
            fail_from: successes,
            fail_count,
        }
    }

    /// The wrapped store, for content assertions.
    #[must_use]
    pub fn inner(&self) -> &InMemoryLedgerStore {
        &self.inner
    }

    fn check(&self) -> Result<(), LedgerError> {
        let index = self.ops.fetch_add(1, Ordering::SeqCst);
        if index >= self.fail_from && index < self.fail_from + self.fail_count {
            return Err(LedgerError::unavailable("scripted ledger outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FlakyLedgerStore {
    async fn get(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, entry: LedgerEntry) -> Result<(), LedgerError> {
        self.check()?;
        self.inner.put(key, entry).await
    }

    async fn delete(&self, key: &str) -> Result<(), LedgerError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<(), LedgerError> {
        self.check()?;
        self.inner.clear().await
    }
}

/// An entity store whose next few updates can be made to fail.
///
/// Armed failures are consumed only by `update`, before any write lands
/// in the wrapped store; insert and load always pass through. This is how
/// tests stage a persistence outage at an exact transition.
#[derive(Debug, Default)]
pub struct FlakyEntityStore {
    inner: InMemoryEntityStore,
    update_failures: AtomicU32,
    update_calls: Mutex<Vec<EntityId>>,
}

impl FlakyEntityStore {
    /// Creates a store with no scripted failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` update calls with [`StoreError::Unavailable`].
    pub fn fail_next_updates(&self, n: u32) {
        self.update_failures.store(n, Ordering::SeqCst);
    }

    /// Entity ids passed to update, failures included, in call order.
    #[must_use]
    pub fn update_calls(&self) -> Vec<EntityId> {
        self.update_calls.lock().clone()
    }

    /// The wrapped store, for content assertions.
    #[must_use]
    pub fn inner(&self) -> &InMemoryEntityStore {
        &self.inner
    }

    fn consume_failure(&self) -> bool {
        self.update_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EntityStore for FlakyEntityStore {
    async fn insert(&self, entity: Entity) -> Result<(), StoreError> {
        self.inner.insert(entity).await
    }

    async fn load(&self, id: EntityId) -> Result<Entity, StoreError> {
        self.inner.load(id).await
    }

    async fn update(&self, entity: Entity) -> Result<Entity, StoreError> {
        self.update_calls.lock().push(entity.id);
        if self.consume_failure() {
            return Err(StoreError::unavailable("scripted store outage"));
        }
        self.inner.update(entity).await
    }
}

/// An activity with scripted run and compensate results that appends to a
/// shared log, so tests can assert execution and unwind order.
pub struct StubActivity {
    name: String,
    kind: ActivityKind,
    run_script: Mutex<VecDeque<Result<serde_json::Value, ActivityError>>>,
    compensate_script: Mutex<VecDeque<Result<(), CompensationError>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl StubActivity {
    /// A remote activity that succeeds with an empty payload.
    #[must_use]
    pub fn remote(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ActivityKind::Remote,
            run_script: Mutex::new(VecDeque::new()),
            compensate_script: Mutex::new(VecDeque::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A local activity that succeeds with an empty payload.
    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            kind: ActivityKind::Local,
            ..Self::remote(name)
        }
    }

    /// Shares an order log with other stubs.
    #[must_use]
    pub fn with_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = log;
        self
    }

    /// Queues a run result.
    #[must_use]
    pub fn then_run(self, result: Result<serde_json::Value, ActivityError>) -> Self {
        self.run_script.lock().push_back(result);
        self
    }

    /// Queues a compensate result.
    #[must_use]
    pub fn then_compensate(self, result: Result<(), CompensationError>) -> Self {
        self.compensate_script.lock().push_back(result);
        self
    }

    /// The log entries recorded so far.
    #[must_use]
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl std::fmt::Debug for StubActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubActivity")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Activity for StubActivity {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ActivityKind {
        self.kind
    }

    async fn run(&self, _ctx: &ActivityContext<'_>) -> Result<serde_json::Value, ActivityError> {
        self.log.lock().push(format!("run:{}", self.name));
        match self.run_script.lock().pop_front() {
            Some(result) => result,
            None => Ok(serde_json::json!({ "activity": self.name })),
        }
    }

    async fn compensate(&self, _ctx: &CompensateContext<'_>) -> Result<(), CompensationError> {
        self.log.lock().push(format!("undo:{}", self.name));
        match self.compensate_script.lock().pop_front() {
            Some(result) => result,
            None => Ok(()),
        }
    }
}

/// An orchestrator that serves one fixed plan for one stage.
#[derive(Clone, Debug)]
pub struct FixedPlanOrchestrator {
    stage: Stage,
    plan: StagePlan,
}

impl FixedPlanOrchestrator {
    /// Creates an orchestrator serving `plan` for `stage`.
    #[must_use]
    pub fn new(stage: Stage, plan: StagePlan) -> Self {
        Self { stage, plan }
    }
}

#[async_trait]
impl StageOrchestrator for FixedPlanOrchestrator {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn plan(&self, _snapshot: &EntitySnapshot) -> StagePlan {
        self.plan.clone()
    }
}
