//! External-service seams used by stage activities.
//!
//! Activities never talk to the outside world directly. They go through
//! these traits, so orchestration logic stays testable and provider
//! failures arrive already classified as transient or permanent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::EntityId;
use crate::errors::ActivityError;

/// Resolved source metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub canonical_url: String,
    pub title: String,
    pub content_type: String,
}

/// Cleaned article text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanText {
    pub text: String,
    pub word_count: usize,
}

impl CleanText {
    /// Wraps raw text, counting words.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let word_count = text.split_whitespace().count();
        Self { text, word_count }
    }
}

/// Fetches and cleans source content.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Resolves a source handle to canonical metadata without pulling the
    /// full body.
    async fn resolve(&self, source: &str) -> Result<SourceInfo, ActivityError>;

    /// Fetches the full body and strips it to clean text.
    async fn fetch_text(&self, canonical_url: &str) -> Result<CleanText, ActivityError>;
}

/// A text-generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// What to produce, e.g. `"summary"` or `"render:digest"`.
    pub task: String,

    /// Source material the generation works from.
    pub input: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,

    /// User feedback to honor, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guidance: Vec<serde_json::Value>,
}

impl GenerationRequest {
    /// Creates a request for a task over some input.
    #[must_use]
    pub fn new(task: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            input: input.into(),
            purpose: None,
            guidance: Vec::new(),
        }
    }

    /// Sets the transmutation purpose.
    #[must_use]
    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    /// Attaches user guidance.
    #[must_use]
    pub fn with_guidance(mut self, guidance: Vec<serde_json::Value>) -> Self {
        self.guidance = guidance;
        self
    }
}

/// Generated text with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedText {
    pub content: String,
    pub model: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

/// Produces generated text, typically through a hosted model.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Runs one generation task.
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedText, ActivityError>;
}

/// A write request for the artifact store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub entity_id: EntityId,
    /// Artifact kind, e.g. `"summary"`, `"transmutation"`, `"render"`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub content: String,
}

impl ArtifactDraft {
    /// Creates a draft of a given kind.
    #[must_use]
    pub fn new(entity_id: EntityId, kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            entity_id,
            kind: kind.into(),
            format: None,
            content: content.into(),
        }
    }

    /// Tags the draft with an output format.
    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

/// A persisted artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub id: String,
    pub entity_id: EntityId,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Durable storage for generated artifacts.
///
/// `delete` must be idempotent: compensations re-drive, and deleting an
/// artifact that is already gone is success, not failure.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persists a draft and returns its artifact id.
    async fn put(&self, draft: ArtifactDraft) -> Result<String, ActivityError>;

    /// Reads an artifact back.
    async fn get(&self, artifact_id: &str) -> Result<Option<StoredArtifact>, ActivityError>;

    /// Deletes an artifact. Missing artifacts are fine.
    async fn delete(&self, artifact_id: &str) -> Result<(), ActivityError>;
}

/// In-memory artifact store.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    artifacts: DashMap<String, StoredArtifact>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Returns true if `artifact_id` is stored.
    #[must_use]
    pub fn contains(&self, artifact_id: &str) -> bool {
        self.artifacts.contains_key(artifact_id)
    }

    /// All artifacts for an entity, unordered.
    #[must_use]
    pub fn for_entity(&self, entity_id: EntityId) -> Vec<StoredArtifact> {
        self.artifacts
            .iter()
            .filter(|entry| entry.value().entity_id == entity_id)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, draft: ArtifactDraft) -> Result<String, ActivityError> {
        let id = format!("art-{}", Uuid::new_v4().simple());
        let artifact = StoredArtifact {
            id: id.clone(),
            entity_id: draft.entity_id,
            kind: draft.kind,
            format: draft.format,
            content: draft.content,
            created_at: Utc::now(),
        };
        self.artifacts.insert(id.clone(), artifact);
        Ok(id)
    }

    async fn get(&self, artifact_id: &str) -> Result<Option<StoredArtifact>, ActivityError> {
        Ok(self.artifacts.get(artifact_id).map(|a| a.clone()))
    }

    async fn delete(&self, artifact_id: &str) -> Result<(), ActivityError> {
        self.artifacts.remove(artifact_id);
        Ok(())
    }
}
