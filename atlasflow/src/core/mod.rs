//! Core domain model types for atlasflow.
//!
//! This module contains the fundamental types the whole crate is built on:
//! - The fixed stage sequence
//! - Lifecycle states and transitions
//! - Stage attempt records with per-activity outcomes
//! - Content entities and execution snapshots

mod entity;
mod record;
mod stage;
mod state;

pub use entity::{Entity, EntityId, EntitySnapshot, FeedbackNote, NewEntity};
pub use record::{
    ActivityOutcome, CompensationReport, ErrorClass, ErrorDetail, RecordStatus, StageRecord,
};
pub use stage::{Stage, STAGE_SEQUENCE};
pub use state::LifecycleState;
