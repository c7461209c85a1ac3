//! The built-in activity catalog for the four pipeline stages.
//!
//! Prospect: `resolve-source`. Extract: `fetch-clean-text`, then
//! `generate-summary` / `generate-highlights` / `generate-insights` in
//! parallel. Transmute: `draft-transmutation`, then `store-draft`. Confer:
//! one `render-<format>` per requested output format, in parallel.
//!
//! Activities that persist artifacts compensate by deleting them; pure
//! fetch and generation activities have nothing to undo.

use async_trait::async_trait;
use std::sync::Arc;

use super::{Activity, ActivityContext, ActivityKind, CompensateContext};
use crate::errors::{ActivityError, CompensationError};
use crate::providers::{
    ArtifactDraft, ArtifactStore, ContentFetcher, GenerationProvider, GenerationRequest,
};

fn delete_artifact_error(err: &ActivityError) -> CompensationError {
    if err.is_transient() {
        CompensationError::transient(err.message.clone())
    } else {
        CompensationError::fatal(err.message.clone())
    }
}

/// Resolves the entity source to canonical metadata.
pub struct ResolveSource {
    fetcher: Arc<dyn ContentFetcher>,
}

impl ResolveSource {
    /// Creates the activity.
    #[must_use]
    pub fn new(fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Activity for ResolveSource {
    fn name(&self) -> &str {
        "resolve-source"
    }

    fn kind(&self) -> ActivityKind {
        ActivityKind::Remote
    }

    async fn run(&self, ctx: &ActivityContext<'_>) -> Result<serde_json::Value, ActivityError> {
        let info = self.fetcher.resolve(&ctx.snapshot.source).await?;
        Ok(serde_json::json!({
            "canonical_url": info.canonical_url,
            "title": info.title,
            "content_type": info.content_type,
        }))
    }
}

/// Fetches the source body and strips it to clean text.
pub struct FetchCleanText {
    fetcher: Arc<dyn ContentFetcher>,
}

impl FetchCleanText {
    /// Creates the activity.
    #[must_use]
    pub fn new(fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Activity for FetchCleanText {
    fn name(&self) -> &str {
        "fetch-clean-text"
    }

    fn kind(&self) -> ActivityKind {
        ActivityKind::Remote
    }

    async fn run(&self, ctx: &ActivityContext<'_>) -> Result<serde_json::Value, ActivityError> {
        let url = ctx.require_str("resolve-source", "canonical_url")?;
        let clean = self.fetcher.fetch_text(url).await?;
        if clean.text.trim().is_empty() {
            return Err(ActivityError::permanent("source produced no text"));
        }
        Ok(serde_json::json!({
            "text": clean.text,
            "word_count": clean.word_count,
        }))
    }
}

/// Generates one derived text (summary, highlights or insights) from the
/// clean text and persists it as an artifact.
pub struct GenerateDerived {
    task: String,
    name: String,
    generator: Arc<dyn GenerationProvider>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl GenerateDerived {
    /// Creates a derived-text activity named `generate-<task>`.
    #[must_use]
    pub fn new(
        task: impl Into<String>,
        generator: Arc<dyn GenerationProvider>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let task = task.into();
        Self {
            name: format!("generate-{task}"),
            task,
            generator,
            artifacts,
        }
    }

    /// The summary variant.
    #[must_use]
    pub fn summary(
        generator: Arc<dyn GenerationProvider>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self::new("summary", generator, artifacts)
    }

    /// The highlights variant.
    #[must_use]
    pub fn highlights(
        generator: Arc<dyn GenerationProvider>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self::new("highlights", generator, artifacts)
    }

    /// The insights variant.
    #[must_use]
    pub fn insights(
        generator: Arc<dyn GenerationProvider>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self::new("insights", generator, artifacts)
    }
}

#[async_trait]
impl Activity for GenerateDerived {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ActivityKind {
        ActivityKind::Remote
    }

    async fn run(&self, ctx: &ActivityContext<'_>) -> Result<serde_json::Value, ActivityError> {
        let text = ctx.require_str("fetch-clean-text", "text")?;
        let request = GenerationRequest::new(&self.task, text)
            .with_purpose(&ctx.snapshot.purpose);
        let generated = self.generator.generate(request).await?;

        let draft = ArtifactDraft::new(ctx.entity_id, &self.task, generated.content);
        let artifact_id = self.artifacts.put(draft).await?;

        Ok(serde_json::json!({
            "artifact_id": artifact_id,
            "kind": self.task,
            "model": generated.model,
            "provider": generated.provider,
        }))
    }

    async fn compensate(&self, ctx: &CompensateContext<'_>) -> Result<(), CompensationError> {
        let Some(artifact_id) = ctx.payload_str("artifact_id") else {
            return Ok(());
        };
        self.artifacts
            .delete(artifact_id)
            .await
            .map_err(|e| delete_artifact_error(&e))
    }
}

/// Drafts the transmuted content from the derived artifacts. Generation
/// only; persistence is `store-draft`'s job, so this has nothing to undo.
pub struct DraftTransmutation {
    generator: Arc<dyn GenerationProvider>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl DraftTransmutation {
    /// Creates the activity.
    #[must_use]
    pub fn new(
        generator: Arc<dyn GenerationProvider>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            generator,
            artifacts,
        }
    }

    async fn collect_sections(
        &self,
        ctx: &ActivityContext<'_>,
    ) -> Result<String, ActivityError> {
        let mut sections = Vec::new();
        for task in ["summary", "highlights", "insights"] {
            let upstream = format!("generate-{task}");
            let Some(payload) = ctx.input(&upstream) else {
                continue;
            };
            let Some(artifact_id) = payload.get("artifact_id").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(artifact) = self.artifacts.get(artifact_id).await? {
                sections.push(format!("## {task}\n{}", artifact.content));
            }
        }
        if sections.is_empty() {
            return Err(ActivityError::permanent(
                "no derived artifacts available to draft from",
            ));
        }
        Ok(sections.join("\n\n"))
    }
}

#[async_trait]
impl Activity for DraftTransmutation {
    fn name(&self) -> &str {
        "draft-transmutation"
    }

    fn kind(&self) -> ActivityKind {
        ActivityKind::Remote
    }

    async fn run(&self, ctx: &ActivityContext<'_>) -> Result<serde_json::Value, ActivityError> {
        let material = self.collect_sections(ctx).await?;
        let request = GenerationRequest::new("transmutation", material)
            .with_purpose(&ctx.snapshot.purpose)
            .with_guidance(ctx.snapshot.feedback.clone());
        let generated = self.generator.generate(request).await?;

        Ok(serde_json::json!({
            "content": generated.content,
            "model": generated.model,
            "provider": generated.provider,
        }))
    }
}

/// Persists the transmutation draft as an artifact.
pub struct StoreDraft {
    artifacts: Arc<dyn ArtifactStore>,
}

impl StoreDraft {
    /// Creates the activity.
    #[must_use]
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl Activity for StoreDraft {
    fn name(&self) -> &str {
        "store-draft"
    }

    fn kind(&self) -> ActivityKind {
        ActivityKind::Remote
    }

    async fn run(&self, ctx: &ActivityContext<'_>) -> Result<serde_json::Value, ActivityError> {
        let content = ctx.require_str("draft-transmutation", "content")?;
        let draft = ArtifactDraft::new(ctx.entity_id, "transmutation", content);
        let artifact_id = self.artifacts.put(draft).await?;
        Ok(serde_json::json!({
            "artifact_id": artifact_id,
            "kind": "transmutation",
        }))
    }

    async fn compensate(&self, ctx: &CompensateContext<'_>) -> Result<(), CompensationError> {
        let Some(artifact_id) = ctx.payload_str("artifact_id") else {
            return Ok(());
        };
        self.artifacts
            .delete(artifact_id)
            .await
            .map_err(|e| delete_artifact_error(&e))
    }
}

/// Renders the transmutation draft into one output format.
pub struct RenderFormat {
    format: String,
    name: String,
    generator: Arc<dyn GenerationProvider>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl RenderFormat {
    /// Creates a render activity named `render-<format>`.
    #[must_use]
    pub fn new(
        format: impl Into<String>,
        generator: Arc<dyn GenerationProvider>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let format = format.into();
        Self {
            name: format!("render-{format}"),
            format,
            generator,
            artifacts,
        }
    }
}

#[async_trait]
impl Activity for RenderFormat {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ActivityKind {
        ActivityKind::Remote
    }

    async fn run(&self, ctx: &ActivityContext<'_>) -> Result<serde_json::Value, ActivityError> {
        let draft = ctx.require_str("draft-transmutation", "content")?;
        let request = GenerationRequest::new(format!("render:{}", self.format), draft)
            .with_purpose(&ctx.snapshot.purpose);
        let generated = self.generator.generate(request).await?;

        let artifact = ArtifactDraft::new(ctx.entity_id, "render", generated.content)
            .with_format(&self.format);
        let artifact_id = self.artifacts.put(artifact).await?;

        Ok(serde_json::json!({
            "artifact_id": artifact_id,
            "format": self.format,
        }))
    }

    async fn compensate(&self, ctx: &CompensateContext<'_>) -> Result<(), CompensationError> {
        let Some(artifact_id) = ctx.payload_str("artifact_id") else {
            return Ok(());
        };
        self.artifacts
            .delete(artifact_id)
            .await
            .map_err(|e| delete_artifact_error(&e))
    }
}
