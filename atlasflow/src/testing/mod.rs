//! Testing utilities for pipeline orchestration.
//!
//! This module provides:
//! - Scripted providers and fault-injecting stores
//! - Stub activities and fixed-plan orchestrators
//! - A fully wired in-memory harness for end-to-end tests

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_compensated, assert_completed_activities, assert_event_count, assert_history_stages,
    assert_record_status,
};
pub use fixtures::{fast_config, HarnessBuilder, PipelineHarness};
pub use mocks::{
    FixedPlanOrchestrator, FlakyArtifacts, FlakyEntityStore, FlakyLedgerStore, ScriptedFetcher,
    ScriptedGenerator, StubActivity, TaskGate,
};
