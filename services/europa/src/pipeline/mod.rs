//! Promotion pipelines.
//!
//! A pipeline is an ordered list of components triggered by pushes to one
//! repository. Each component receives a [`PromotedImage`] and either passes an
//! updated one on or halts the run. [`ManualPromotionGate`] halts until a person
//! resumes the pipeline from it with [`run_manual_promotion`].
//!
//! [`ManualPromotionGate`]: PipelineComponent::ManualPromotionGate

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::context::RegistryContext;
use crate::copy::CopyImageBetweenRepos;
use crate::digest::{Digest, Reference};
use crate::error::{RegistryError, RegistryResult};
use crate::repo::ContainerRepo;

mod run;

pub use self::run::{PipelineOutcome, RunPipeline};

/// The image handed from one component to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotedImage {
    /// Repository currently holding the image.
    pub repo: ContainerRepo,
    /// Tag (or digest) it is known by there.
    pub tag: String,
    /// Manifest digest.
    pub manifest_digest: Digest,
}

/// What a component sees besides the image.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    /// Stores and adapters.
    pub registry: &'a RegistryContext,
    /// A person asked for this component to run.
    pub manually_triggered: bool,
}

/// One step of a pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable identifier, used to resume a run.
    fn id(&self) -> &str;

    /// Run the step. `None` halts the pipeline.
    async fn execute(
        &self,
        image: PromotedImage,
        ctx: &StageContext<'_>,
    ) -> RegistryResult<Option<PromotedImage>>;
}

/// A configured pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum PipelineComponent {
    /// Copy the image into another repository.
    CopyToRepository {
        /// Component id.
        id: String,
        /// Domain of the destination, defaults to the image's domain.
        #[serde(default)]
        destination_container_repo_domain: Option<String>,
        /// Destination repository id.
        #[serde(default)]
        destination_container_repo_id: Option<String>,
        /// Destination tag, defaults to the image's tag.
        #[serde(default)]
        tag: Option<String>,
    },
    /// Wait for a person to approve the promotion.
    ManualPromotionGate {
        /// Component id.
        id: String,
    },
}

impl PipelineComponent {
    /// A copy step into `repo_id`.
    pub fn copy_to_repository(repo_id: &str, tag: Option<&str>) -> Self {
        PipelineComponent::CopyToRepository {
            id: uuid::Uuid::new_v4().to_string(),
            destination_container_repo_domain: None,
            destination_container_repo_id: Some(repo_id.to_owned()),
            tag: tag.map(str::to_owned),
        }
    }

    /// An approval gate.
    pub fn manual_promotion_gate() -> Self {
        PipelineComponent::ManualPromotionGate {
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Check the component is fully configured.
    pub fn validate(&self) -> RegistryResult<()> {
        match self {
            PipelineComponent::CopyToRepository {
                destination_container_repo_id,
                tag,
                ..
            } => {
                if destination_container_repo_id
                    .as_deref()
                    .is_none_or(|id| id.trim().is_empty())
                {
                    return Err(RegistryError::MissingParam("destinationContainerRepoId"));
                }
                if let Some(tag) = tag {
                    tag.parse::<Reference>()?;
                }
                Ok(())
            }
            PipelineComponent::ManualPromotionGate { .. } => Ok(()),
        }
    }

    async fn copy_to_repository_stage(
        &self,
        image: PromotedImage,
        ctx: &StageContext<'_>,
    ) -> RegistryResult<Option<PromotedImage>> {
        let PipelineComponent::CopyToRepository {
            destination_container_repo_domain,
            destination_container_repo_id,
            tag,
            ..
        } = self
        else {
            return Ok(Some(image));
        };
        let repo_id = destination_container_repo_id
            .as_deref()
            .ok_or(RegistryError::MissingParam("destinationContainerRepoId"))?;
        let domain = destination_container_repo_domain
            .as_deref()
            .unwrap_or(&image.repo.domain);

        let Some(destination) = ctx.registry.repos.get_repo(domain, repo_id).await? else {
            tracing::debug!(domain, repo_id, "Destination repository no longer exists");
            return Ok(None);
        };
        let tag = tag.clone().unwrap_or_else(|| image.tag.clone());

        let copy = CopyImageBetweenRepos::builder()
            .source_repo(image.repo)
            .source_reference(image.manifest_digest.as_str())
            .destination_repo(destination.clone())
            .destination_tag(tag.as_str())
            .build()?;
        match copy.run(ctx.registry).await {
            Ok(manifest_digest) => Ok(Some(PromotedImage {
                repo: destination,
                tag,
                manifest_digest,
            })),
            Err(RegistryError::ManifestNotFound { reference, .. }) => {
                tracing::debug!(%reference, "Promoted manifest no longer exists");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl Stage for PipelineComponent {
    fn id(&self) -> &str {
        match self {
            PipelineComponent::CopyToRepository { id, .. }
            | PipelineComponent::ManualPromotionGate { id } => id,
        }
    }

    async fn execute(
        &self,
        image: PromotedImage,
        ctx: &StageContext<'_>,
    ) -> RegistryResult<Option<PromotedImage>> {
        match self {
            PipelineComponent::CopyToRepository { .. } => {
                self.copy_to_repository_stage(image, ctx).await
            }
            PipelineComponent::ManualPromotionGate { id } => {
                if ctx.manually_triggered {
                    tracing::info!(component = %id, "Promotion approved");
                    Ok(Some(image))
                } else {
                    tracing::debug!(component = %id, "Waiting for manual promotion");
                    Ok(None)
                }
            }
        }
    }
}

/// A promotion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Tenant.
    pub domain: String,
    /// Identifier within the tenant.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Pushes to this repository start the pipeline.
    #[serde(default)]
    pub container_repo_id: Option<String>,
    /// Ordered steps.
    #[serde(default)]
    pub components: Vec<PipelineComponent>,
}

impl Pipeline {
    /// An empty pipeline triggered by `container_repo_id`.
    pub fn new(domain: &str, name: &str, container_repo_id: Option<&str>) -> Self {
        Self {
            domain: domain.to_ascii_lowercase(),
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_owned(),
            container_repo_id: container_repo_id.map(str::to_ascii_lowercase),
            components: Vec::new(),
        }
    }

    /// Position of a component, ignoring case.
    pub fn component_index(&self, component_id: &str) -> Option<usize> {
        self.components
            .iter()
            .position(|component| component.id().eq_ignore_ascii_case(component_id))
    }

    fn require_index(&self, component_id: &str) -> RegistryResult<usize> {
        self.component_index(component_id)
            .ok_or(RegistryError::PipelineComponentNotFound)
    }

    /// Insert `component` before `before`, or append it.
    pub fn add_component(
        &mut self,
        component: PipelineComponent,
        before: Option<&str>,
    ) -> RegistryResult<()> {
        component.validate()?;
        let index = match before {
            Some(before) => self.require_index(before)?,
            None => self.components.len(),
        };
        self.components.insert(index, component);
        Ok(())
    }

    /// Remove a component.
    pub fn remove_component(&mut self, component_id: &str) -> RegistryResult<PipelineComponent> {
        let index = self.require_index(component_id)?;
        Ok(self.components.remove(index))
    }

    /// Move a component to `index`, clamped to the end of the list.
    pub fn move_component(&mut self, component_id: &str, index: usize) -> RegistryResult<()> {
        let component = self.remove_component(component_id)?;
        let index = index.min(self.components.len());
        self.components.insert(index, component);
        Ok(())
    }
}

/// Persistence for pipelines.
#[async_trait]
pub trait PipelineStore: fmt::Debug + Send + Sync {
    /// Insert or replace a pipeline.
    async fn save(&self, pipeline: Pipeline) -> RegistryResult<Pipeline>;

    /// Look up a pipeline.
    async fn get_pipeline(&self, domain: &str, id: &str) -> RegistryResult<Option<Pipeline>>;

    /// Pipelines started by pushes to `repo_id`.
    async fn list_pipelines_by_trigger(
        &self,
        domain: &str,
        repo_id: &str,
    ) -> RegistryResult<Vec<Pipeline>>;

    /// Remove a pipeline, returning it.
    async fn delete_pipeline(&self, domain: &str, id: &str) -> RegistryResult<Option<Pipeline>>;
}

/// Pipelines held in process memory.
#[derive(Debug, Default)]
pub struct MemoryPipelines {
    pipelines: RwLock<BTreeMap<(String, String), Pipeline>>,
}

impl MemoryPipelines {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(domain: &str, id: &str) -> (String, String) {
        (domain.to_ascii_lowercase(), id.to_ascii_lowercase())
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelines {
    async fn save(&self, mut pipeline: Pipeline) -> RegistryResult<Pipeline> {
        if pipeline.name.trim().is_empty() {
            return Err(RegistryError::MissingParam("name"));
        }
        for component in &pipeline.components {
            component.validate()?;
        }
        pipeline.domain = pipeline.domain.to_ascii_lowercase();
        pipeline.container_repo_id = pipeline
            .container_repo_id
            .map(|id| id.to_ascii_lowercase());

        let key = Self::key(&pipeline.domain, &pipeline.id);
        self.pipelines.write().await.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    async fn get_pipeline(&self, domain: &str, id: &str) -> RegistryResult<Option<Pipeline>> {
        Ok(self.pipelines.read().await.get(&Self::key(domain, id)).cloned())
    }

    async fn list_pipelines_by_trigger(
        &self,
        domain: &str,
        repo_id: &str,
    ) -> RegistryResult<Vec<Pipeline>> {
        let domain = domain.to_ascii_lowercase();
        Ok(self
            .pipelines
            .read()
            .await
            .values()
            .filter(|pipeline| {
                pipeline.domain == domain
                    && pipeline
                        .container_repo_id
                        .as_deref()
                        .is_some_and(|id| id.eq_ignore_ascii_case(repo_id))
            })
            .cloned()
            .collect())
    }

    async fn delete_pipeline(&self, domain: &str, id: &str) -> RegistryResult<Option<Pipeline>> {
        Ok(self.pipelines.write().await.remove(&Self::key(domain, id)))
    }
}

/// Run every pipeline triggered by a push of `image`.
#[tracing::instrument(skip_all, fields(repo = %image.repo.name, tag = %image.tag))]
pub async fn run_triggered_pipelines(
    ctx: &RegistryContext,
    image: &PromotedImage,
) -> RegistryResult<Vec<PipelineOutcome>> {
    let pipelines = ctx
        .pipelines
        .list_pipelines_by_trigger(&image.repo.domain, &image.repo.id)
        .await?;

    let runner = RunPipeline::new(ctx);
    let mut outcomes = Vec::with_capacity(pipelines.len());
    for pipeline in pipelines {
        tracing::debug!(pipeline = %pipeline.id, "Running pipeline");
        outcomes.push(
            runner
                .run(&pipeline.components, image.clone(), None, false)
                .await?,
        );
    }
    Ok(outcomes)
}

/// A request to resume a pipeline from one of its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualPromotion {
    /// Tenant.
    pub domain: String,
    /// Pipeline to resume.
    pub pipeline_id: String,
    /// Component to start from, usually a gate.
    pub component_id: String,
    /// Repository holding the image.
    pub source_repo_id: String,
    /// Tag of the image in that repository.
    pub source_tag: String,
    /// Overrides the tag of a copy component the run starts at.
    pub destination_tag: Option<String>,
}

/// Resume a pipeline from `promotion.component_id` with approval given.
#[tracing::instrument(skip_all, fields(pipeline = %promotion.pipeline_id, component = %promotion.component_id))]
pub async fn run_manual_promotion(
    ctx: &RegistryContext,
    promotion: &ManualPromotion,
) -> RegistryResult<PipelineOutcome> {
    if let Some(tag) = &promotion.destination_tag {
        tag.parse::<Reference>()?;
    }

    let pipeline = ctx
        .pipelines
        .get_pipeline(&promotion.domain, &promotion.pipeline_id)
        .await?
        .ok_or_else(|| RegistryError::PipelineNotFound {
            domain: promotion.domain.clone(),
            id: promotion.pipeline_id.clone(),
        })?;
    let repo = ctx
        .repos
        .get_repo(&promotion.domain, &promotion.source_repo_id)
        .await?
        .ok_or_else(|| {
            RegistryError::repo_id_not_found(&promotion.domain, &promotion.source_repo_id)
        })?;
    let start = pipeline.require_index(&promotion.component_id)?;

    let row = ctx
        .manifests
        .get_manifest(&repo.domain, &repo.id, &promotion.source_tag)
        .await?
        .ok_or_else(|| RegistryError::ManifestNotFound {
            reference: promotion.source_tag.clone(),
            repository: repo.name.clone(),
        })?;

    let mut components = pipeline.components[start..].to_vec();
    if let (
        Some(override_tag),
        Some(PipelineComponent::CopyToRepository { tag, .. }),
    ) = (&promotion.destination_tag, components.first_mut())
    {
        *tag = Some(override_tag.clone());
    }

    let image = PromotedImage {
        repo,
        tag: promotion.source_tag.clone(),
        manifest_digest: row.manifest_id,
    };
    RunPipeline::new(ctx)
        .run(&components, image, None, true)
        .await
}
