//! A fully wired in-memory pipeline for integration tests.

use std::sync::Arc;
use std::time::Duration;

use super::mocks::{FlakyArtifacts, ScriptedFetcher, ScriptedGenerator};
use crate::config::{DispatchRetry, PipelineConfig};
use crate::coordinator::{Coordinator, StatusView};
use crate::core::{Entity, EntityId, LifecycleState, NewEntity, STAGE_SEQUENCE};
use crate::errors::OrchestrationError;
use crate::events::CollectingEventSink;
use crate::ledger::{IdempotencyLedger, LedgerStore};
use crate::orchestrator::{OrchestratorSet, StageProviders};
use crate::store::InMemoryEntityStore;

/// How long [`PipelineHarness::wait_for_state`] polls before giving up.
/// Generous on purpose; predicates normally settle in milliseconds.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pipeline policies tightened for tests: millisecond backoffs and short
/// slack, three attempts everywhere.
#[must_use]
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    for stage in STAGE_SEQUENCE {
        let policy = config.policy_mut(stage);
        policy.max_attempts = 3;
        policy.backoff_base_ms = 2;
        policy.backoff_max_ms = 10;
        policy.activity_timeout_ms = 2_000;
        policy.stage_slack_ms = 500;
    }
    config.dispatch_retry = DispatchRetry {
        max_attempts: 3,
        backoff_ms: 5,
    };
    config
}

/// A coordinator wired to scripted providers, an in-memory store and a
/// collecting event sink, all exposed for assertions.
pub struct PipelineHarness {
    pub coordinator: Coordinator,
    pub events: Arc<CollectingEventSink>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub generator: Arc<ScriptedGenerator>,
    pub artifacts: Arc<FlakyArtifacts>,
    pub ledger: Arc<IdempotencyLedger>,
    pub store: Arc<InMemoryEntityStore>,
}

impl Default for PipelineHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHarness {
    /// A harness with default wiring and [`fast_config`].
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a customized harness.
    #[must_use]
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    /// Registers an entity and starts its pipeline.
    pub async fn register_and_start(
        &self,
        source: &str,
        purpose: &str,
    ) -> Result<Entity, OrchestrationError> {
        let entity = self
            .coordinator
            .register(NewEntity::new(source, purpose))
            .await?;
        self.coordinator.start_pipeline(entity.id).await?;
        Ok(entity)
    }

    /// Polls the entity status until `predicate` holds. Panics with the
    /// last observed state on timeout.
    pub async fn wait_for<F>(&self, id: EntityId, predicate: F) -> StatusView
    where
        F: Fn(&StatusView) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        let mut last: Option<StatusView> = None;
        loop {
            if let Ok(status) = self.coordinator.get_status(id).await {
                if predicate(&status) {
                    return status;
                }
                last = Some(status);
            }
            if tokio::time::Instant::now() >= deadline {
                match last {
                    Some(status) => {
                        panic!("timed out waiting on {id}; state is {}", status.state)
                    }
                    None => panic!("timed out waiting on {id}; status unavailable"),
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Polls until the entity reaches exactly `state`.
    pub async fn wait_for_state(&self, id: EntityId, state: LifecycleState) -> StatusView {
        self.wait_for(id, |status| status.state == state).await
    }

    /// Polls until `event_type` has been emitted at least `count` times.
    /// Event emission trails the state write, so assertions on event
    /// counts go through here rather than reading the sink directly.
    pub async fn wait_for_events(&self, event_type: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while self.events.count_of(event_type) < count {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {count} '{event_type}' events; saw {}",
                    self.events.count_of(event_type)
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Builder for [`PipelineHarness`].
pub struct HarnessBuilder {
    config: PipelineConfig,
    ledger_store: Option<Arc<dyn LedgerStore>>,
    orchestrators: Option<OrchestratorSet>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessBuilder {
    /// Creates a builder using [`fast_config`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: fast_config(),
            ledger_store: None,
            orchestrators: None,
        }
    }

    /// Replaces the pipeline configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Turns on auto-advance for every stage, so the pipeline runs
    /// end to end without proceed signals.
    #[must_use]
    pub fn auto_advance(mut self) -> Self {
        for stage in STAGE_SEQUENCE {
            self.config.policy_mut(stage).auto_advance = true;
        }
        self
    }

    /// Backs the idempotency ledger with a custom store.
    #[must_use]
    pub fn with_ledger_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.ledger_store = Some(store);
        self
    }

    /// Replaces the orchestrator set. The scripted providers are still
    /// constructed but nothing will call them.
    #[must_use]
    pub fn with_orchestrators(mut self, orchestrators: OrchestratorSet) -> Self {
        self.orchestrators = Some(orchestrators);
        self
    }

    /// Wires everything together.
    #[must_use]
    pub fn build(self) -> PipelineHarness {
        let events = Arc::new(CollectingEventSink::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        let generator = Arc::new(ScriptedGenerator::new());
        let artifacts = Arc::new(FlakyArtifacts::new());
        let store = Arc::new(InMemoryEntityStore::new());
        let ledger = Arc::new(match self.ledger_store {
            Some(backend) => IdempotencyLedger::new(backend),
            None => IdempotencyLedger::in_memory(),
        });

        let orchestrators = self.orchestrators.unwrap_or_else(|| {
            OrchestratorSet::standard(
                StageProviders {
                    fetcher: fetcher.clone(),
                    generator: generator.clone(),
                    artifacts: artifacts.clone(),
                },
                self.config.default_formats.clone(),
            )
        });

        let coordinator = Coordinator::builder()
            .with_store(store.clone())
            .with_ledger(ledger.clone())
            .with_orchestrators(orchestrators)
            .with_config(self.config)
            .with_events(events.clone())
            .build();

        PipelineHarness {
            coordinator,
            events,
            fetcher,
            generator,
            artifacts,
            ledger,
            store,
        }
    }
}
