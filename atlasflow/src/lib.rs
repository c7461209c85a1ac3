//! # Atlasflow
//!
//! A durable workflow core that drives content entities through a fixed
//! four-stage pipeline: Prospect, Extract, Transmute, Confer.
//!
//! Atlasflow provides:
//!
//! - **Stage orchestration**: ordered activity groups per stage, with
//!   concurrent execution inside a group
//! - **Exactly-once side effects**: an idempotency ledger keyed on
//!   entity, stage, activity and attempt class
//! - **User gates and signals**: proceed, retry, feedback, discard and
//!   cancel, validated against the entity's lifecycle state
//! - **Saga compensation**: failed or cancelled attempts unwind their
//!   completed work in reverse order
//! - **Event-driven observability**: structured events for every
//!   transition, dispatch and compensation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use atlasflow::prelude::*;
//!
//! // Wire a coordinator over in-memory stores
//! let coordinator = Coordinator::builder()
//!     .with_orchestrators(OrchestratorSet::standard(providers, formats))
//!     .build();
//!
//! // Register and drive an entity
//! let entity = coordinator
//!     .register(NewEntity::new("https://example.com/article", "newsletter"))
//!     .await?;
//! coordinator.start_pipeline(entity.id).await?;
//!
//! // Advance past the first gate once the user approves
//! coordinator.signal(entity.id, Signal::Proceed).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod activity;
pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod observability;
pub mod orchestrator;
pub mod providers;
pub mod saga;
pub mod signal;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::activity::{
        Activity, ActivityContext, ActivityKind, ActivityRunner, CompensateContext, RetryPolicy,
    };
    pub use crate::cancellation::CancelFlag;
    pub use crate::config::{DispatchRetry, PipelineConfig, StagePolicy};
    pub use crate::coordinator::{Coordinator, CoordinatorBuilder, StatusView};
    pub use crate::core::{
        ActivityOutcome, CompensationReport, Entity, EntityId, EntitySnapshot, ErrorClass,
        ErrorDetail, LifecycleState, NewEntity, RecordStatus, Stage, StageRecord, STAGE_SEQUENCE,
    };
    pub use crate::errors::{
        ActivityError, CompensationError, LedgerError, OrchestrationError, StoreError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::ledger::{derive_key, IdempotencyLedger, LedgerStore};
    pub use crate::orchestrator::{
        ActivityGroup, OrchestratorSet, StageOrchestrator, StagePlan, StageProviders,
    };
    pub use crate::providers::{
        ArtifactStore, ContentFetcher, GenerationProvider, InMemoryArtifactStore,
    };
    pub use crate::saga::SagaManager;
    pub use crate::signal::{RejectReason, Signal, SignalKind, SignalOutcome};
    pub use crate::store::{EntityStore, InMemoryEntityStore};
}
