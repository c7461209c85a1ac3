//! Stage orchestrators: one per pipeline stage, each sequencing its
//! activities into a [`StagePlan`] and driving them to a [`StageRecord`].
//!
//! A plan is an ordered list of groups. Groups run sequentially; the
//! activities inside a group have no data dependency on each other and run
//! concurrently, and the orchestrator waits on the whole group before
//! moving on. The first failed group resolves the stage as failed with
//! every later activity still marked as never run, which is exactly the
//! shape the compensation walk needs.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::activity::{Activity, ActivityContext, ActivityKind, ActivityRunner, RetryPolicy};
use crate::activity::{
    DraftTransmutation, FetchCleanText, GenerateDerived, RenderFormat, ResolveSource, StoreDraft,
};
use crate::cancellation::CancelFlag;
use crate::config::StagePolicy;
use crate::core::{ActivityOutcome, EntitySnapshot, ErrorDetail, Stage, StageRecord};
use crate::errors::LedgerError;
use crate::ledger::derive_key;
use crate::providers::{ArtifactStore, ContentFetcher, GenerationProvider};

/// Activities that run concurrently against the same inputs.
#[derive(Clone, Default)]
pub struct ActivityGroup {
    activities: Vec<Arc<dyn Activity>>,
}

impl ActivityGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A group with one member.
    #[must_use]
    pub fn single(activity: Arc<dyn Activity>) -> Self {
        Self::new().with(activity)
    }

    /// Adds a member.
    #[must_use]
    pub fn with(mut self, activity: Arc<dyn Activity>) -> Self {
        self.activities.push(activity);
        self
    }

    /// The group members, in plan order.
    #[must_use]
    pub fn activities(&self) -> &[Arc<dyn Activity>] {
        &self.activities
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.activities.len()
    }

    /// True when the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

impl fmt::Debug for ActivityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.activities.iter().map(|a| a.name()).collect();
        f.debug_tuple("ActivityGroup").field(&names).finish()
    }
}

/// The ordered execution plan for one stage dispatch.
#[derive(Clone, Debug, Default)]
pub struct StagePlan {
    groups: Vec<ActivityGroup>,
}

impl StagePlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A plan with a single one-activity group.
    #[must_use]
    pub fn single(activity: Arc<dyn Activity>) -> Self {
        Self::new().then(ActivityGroup::single(activity))
    }

    /// Appends a group to run after everything already planned.
    #[must_use]
    pub fn then(mut self, group: ActivityGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// The groups, in execution order.
    #[must_use]
    pub fn groups(&self) -> &[ActivityGroup] {
        &self.groups
    }

    /// Total number of planned activities.
    #[must_use]
    pub fn activity_count(&self) -> usize {
        self.groups.iter().map(ActivityGroup::len).sum()
    }

    /// All activities in plan order, groups flattened.
    pub fn iter_activities(&self) -> impl Iterator<Item = &Arc<dyn Activity>> {
        self.groups.iter().flat_map(|g| g.activities.iter())
    }

    /// Looks up a planned activity by name.
    #[must_use]
    pub fn activity(&self, name: &str) -> Option<&Arc<dyn Activity>> {
        self.iter_activities().find(|a| a.name() == name)
    }

    /// True when nothing is planned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(ActivityGroup::is_empty)
    }
}

/// Everything a stage dispatch executes against.
pub struct StageExecution<'a> {
    /// Runner owning the ledger and retry loop.
    pub runner: &'a ActivityRunner,
    /// Immutable view of the entity for this dispatch.
    pub snapshot: &'a EntitySnapshot,
    /// Policy of the stage being dispatched.
    pub policy: &'a StagePolicy,
    /// Attempt budget for local activities.
    pub local_max_attempts: u32,
    /// Cooperative cancel flag, checked between groups and attempts.
    pub cancel: &'a CancelFlag,
}

/// One stage of the pipeline.
///
/// Implementations are stateless between invocations: everything a
/// dispatch needs arrives through the snapshot, and everything it
/// produced leaves through the record.
#[async_trait]
pub trait StageOrchestrator: Send + Sync {
    /// The stage this orchestrator drives.
    fn stage(&self) -> Stage;

    /// Builds the activity plan for one dispatch.
    fn plan(&self, snapshot: &EntitySnapshot) -> StagePlan;

    /// Runs the plan to a resolved record.
    ///
    /// `Err` means ledger or persistence infrastructure failed mid-flight;
    /// the dispatch is abandoned with nothing persisted, as if the stage
    /// had not started, and the caller re-drives it.
    async fn run(&self, exec: &StageExecution<'_>) -> Result<StageRecord, LedgerError> {
        execute_plan(&self.plan(exec.snapshot), exec).await
    }
}

/// Replaces the planned placeholder with the settled outcome.
fn settle(record: &mut StageRecord, outcome: ActivityOutcome) {
    if let Some(slot) = record.activities.iter_mut().find(|a| a.name == outcome.name) {
        *slot = outcome;
    }
}

async fn execute_plan(
    plan: &StagePlan,
    exec: &StageExecution<'_>,
) -> Result<StageRecord, LedgerError> {
    let snapshot = exec.snapshot;
    let stage = snapshot.stage;
    let mut record = StageRecord::begin(stage, snapshot.attempt);

    // A placeholder per planned activity, so an aborted stage still shows
    // which activities never ran.
    for activity in plan.iter_activities() {
        let key = derive_key(snapshot.entity_id, stage, activity.name(), snapshot.attempt);
        record
            .activities
            .push(ActivityOutcome::planned(activity.name(), key));
    }

    let deadline = Instant::now() + exec.policy.stage_deadline(plan.activity_count());
    let attempt_timeout = exec.policy.activity_timeout();
    let remote_policy = RetryPolicy::from(exec.policy);
    let local_policy = remote_policy.clone().with_max_attempts(exec.local_max_attempts);

    // Accumulated payloads: prior stages from the snapshot, extended by
    // each completed group before the next group starts.
    let mut data = snapshot.data.clone();

    if exec.cancel.is_cancelled() {
        record.resolve_cancelled(exec.cancel.reason_or_default());
        return Ok(record);
    }

    for group in plan.groups() {
        let data_ref = &data;
        let tasks: Vec<_> = group
            .activities()
            .iter()
            .map(|activity| {
                let activity = Arc::clone(activity);
                let key =
                    derive_key(snapshot.entity_id, stage, activity.name(), snapshot.attempt);
                let policy = match activity.kind() {
                    ActivityKind::Remote => &remote_policy,
                    ActivityKind::Local => &local_policy,
                };
                async move {
                    let ctx = ActivityContext {
                        entity_id: snapshot.entity_id,
                        stage,
                        attempt: snapshot.attempt,
                        key,
                        snapshot,
                        data: data_ref,
                    };
                    exec.runner
                        .run(
                            activity.as_ref(),
                            &ctx,
                            policy,
                            attempt_timeout,
                            deadline,
                            exec.cancel,
                        )
                        .await
                }
            })
            .collect();

        let mut first_error: Option<ErrorDetail> = None;
        for settled in join_all(tasks).await {
            let outcome = settled?;
            if outcome.is_completed() {
                if let Some(payload) = &outcome.payload {
                    data.insert(outcome.name.clone(), payload.clone());
                }
            } else if first_error.is_none() {
                first_error = outcome.error.clone();
            }
            settle(&mut record, outcome);
        }

        // Cancel wins over a same-group failure; the saga unwinds either way.
        if exec.cancel.is_cancelled() {
            record.resolve_cancelled(exec.cancel.reason_or_default());
            return Ok(record);
        }
        if let Some(error) = first_error {
            record.resolve_failed(error);
            return Ok(record);
        }
    }

    record.resolve_completed();
    Ok(record)
}

/// Provider handles the standard orchestrators execute against.
#[derive(Clone)]
pub struct StageProviders {
    pub fetcher: Arc<dyn ContentFetcher>,
    pub generator: Arc<dyn GenerationProvider>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl fmt::Debug for StageProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageProviders").finish_non_exhaustive()
    }
}

/// Prospect: resolve the source to canonical metadata.
pub struct ProspectOrchestrator {
    providers: StageProviders,
}

impl ProspectOrchestrator {
    #[must_use]
    pub fn new(providers: StageProviders) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl StageOrchestrator for ProspectOrchestrator {
    fn stage(&self) -> Stage {
        Stage::Prospect
    }

    fn plan(&self, _snapshot: &EntitySnapshot) -> StagePlan {
        StagePlan::single(Arc::new(ResolveSource::new(self.providers.fetcher.clone())))
    }
}

/// Extract: fetch clean text, then derive summary, highlights and
/// insights from it in parallel.
pub struct ExtractOrchestrator {
    providers: StageProviders,
}

impl ExtractOrchestrator {
    #[must_use]
    pub fn new(providers: StageProviders) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl StageOrchestrator for ExtractOrchestrator {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    fn plan(&self, _snapshot: &EntitySnapshot) -> StagePlan {
        let generator = &self.providers.generator;
        let artifacts = &self.providers.artifacts;
        StagePlan::single(Arc::new(FetchCleanText::new(self.providers.fetcher.clone())))
            .then(
                ActivityGroup::new()
                    .with(Arc::new(GenerateDerived::summary(
                        generator.clone(),
                        artifacts.clone(),
                    )))
                    .with(Arc::new(GenerateDerived::highlights(
                        generator.clone(),
                        artifacts.clone(),
                    )))
                    .with(Arc::new(GenerateDerived::insights(
                        generator.clone(),
                        artifacts.clone(),
                    ))),
            )
    }
}

/// Transmute: draft the transmuted content, then persist it.
pub struct TransmuteOrchestrator {
    providers: StageProviders,
}

impl TransmuteOrchestrator {
    #[must_use]
    pub fn new(providers: StageProviders) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl StageOrchestrator for TransmuteOrchestrator {
    fn stage(&self) -> Stage {
        Stage::Transmute
    }

    fn plan(&self, _snapshot: &EntitySnapshot) -> StagePlan {
        StagePlan::single(Arc::new(DraftTransmutation::new(
            self.providers.generator.clone(),
            self.providers.artifacts.clone(),
        )))
        .then(ActivityGroup::single(Arc::new(StoreDraft::new(
            self.providers.artifacts.clone(),
        ))))
    }
}

/// Confer: render the stored draft into every requested output format.
pub struct ConferOrchestrator {
    providers: StageProviders,
    default_formats: Vec<String>,
}

impl ConferOrchestrator {
    #[must_use]
    pub fn new(providers: StageProviders, default_formats: Vec<String>) -> Self {
        Self {
            providers,
            default_formats,
        }
    }
}

#[async_trait]
impl StageOrchestrator for ConferOrchestrator {
    fn stage(&self) -> Stage {
        Stage::Confer
    }

    fn plan(&self, snapshot: &EntitySnapshot) -> StagePlan {
        let formats = if snapshot.output_formats.is_empty() {
            &self.default_formats
        } else {
            &snapshot.output_formats
        };
        let mut group = ActivityGroup::new();
        for format in formats {
            group = group.with(Arc::new(RenderFormat::new(
                format,
                self.providers.generator.clone(),
                self.providers.artifacts.clone(),
            )));
        }
        StagePlan::new().then(group)
    }
}

/// Lookup table of orchestrators keyed on the stage enum.
#[derive(Default)]
pub struct OrchestratorSet {
    orchestrators: HashMap<Stage, Arc<dyn StageOrchestrator>>,
}

impl OrchestratorSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The four standard orchestrators over one provider set.
    #[must_use]
    pub fn standard(providers: StageProviders, default_formats: Vec<String>) -> Self {
        Self::new()
            .with(Arc::new(ProspectOrchestrator::new(providers.clone())))
            .with(Arc::new(ExtractOrchestrator::new(providers.clone())))
            .with(Arc::new(TransmuteOrchestrator::new(providers.clone())))
            .with(Arc::new(ConferOrchestrator::new(providers, default_formats)))
    }

    /// Registers an orchestrator under its own stage, replacing any
    /// previous registration for that stage.
    #[must_use]
    pub fn with(mut self, orchestrator: Arc<dyn StageOrchestrator>) -> Self {
        self.orchestrators.insert(orchestrator.stage(), orchestrator);
        self
    }

    /// Looks up the orchestrator for a stage.
    #[must_use]
    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn StageOrchestrator>> {
        self.orchestrators.get(&stage)
    }

    /// True when every pipeline stage has an orchestrator.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        crate::core::STAGE_SEQUENCE
            .iter()
            .all(|s| self.orchestrators.contains_key(s))
    }
}

impl fmt::Debug for OrchestratorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<&str> = self.orchestrators.keys().map(|s| s.as_str()).collect();
        stages.sort_unstable();
        f.debug_tuple("OrchestratorSet").field(&stages).finish()
    }
}
