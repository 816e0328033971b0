//! The collaborators every registry operation runs against.

use std::sync::Arc;

use api_client::Transport;

use crate::adapter::{EuropaRegistry, Registry, RegistryAccess, RegistryFactory};
use crate::blob::{BlobTable, MemoryBlobs};
use crate::credentials::{CredentialStore, MemoryCredentials};
use crate::directory::{MemoryDirectory, RepoDirectory};
use crate::error::RegistryResult;
use crate::manifest::{ManifestTable, MemoryManifests};
use crate::objects::ObjectStore;
use crate::pipeline::{MemoryPipelines, PipelineStore};
use crate::repo::ContainerRepo;
use crate::sync::{MemoryTaskQueue, TaskQueue};

/// Stores, queues and adapter factory, passed explicitly to each operation.
///
/// Cloning is cheap: every field is shared.
#[derive(Debug, Clone)]
pub struct RegistryContext {
    /// Repository descriptors.
    pub repos: Arc<dyn RepoDirectory>,
    /// Manifest rows.
    pub manifests: Arc<dyn ManifestTable>,
    /// Blob rows.
    pub blobs: Arc<dyn BlobTable>,
    /// Manifest bodies and blob content.
    pub objects: ObjectStore,
    /// Stored remote registry credentials.
    pub credentials: Arc<dyn CredentialStore>,
    /// Promotion pipelines.
    pub pipelines: Arc<dyn PipelineStore>,
    /// Queue receiving sync work.
    pub tasks: Arc<dyn TaskQueue>,
    /// Builds adapters for repositories.
    pub registries: RegistryFactory,
}

impl RegistryContext {
    /// A context over in-memory tables, storing objects in `objects` and
    /// reaching remote registries through `transport`.
    pub fn new(objects: ObjectStore, transport: Transport) -> Self {
        Self {
            repos: Arc::new(MemoryDirectory::new()),
            manifests: Arc::new(MemoryManifests::new()),
            blobs: Arc::new(MemoryBlobs::new()),
            objects,
            credentials: Arc::new(MemoryCredentials::new()),
            pipelines: Arc::new(MemoryPipelines::new()),
            tasks: Arc::new(MemoryTaskQueue::new()),
            registries: RegistryFactory::new(transport),
        }
    }

    /// Replace the repository directory.
    pub fn with_repos(mut self, repos: Arc<dyn RepoDirectory>) -> Self {
        self.repos = repos;
        self
    }

    /// Replace the manifest table.
    pub fn with_manifests(mut self, manifests: Arc<dyn ManifestTable>) -> Self {
        self.manifests = manifests;
        self
    }

    /// Replace the blob table.
    pub fn with_blobs(mut self, blobs: Arc<dyn BlobTable>) -> Self {
        self.blobs = blobs;
        self
    }

    /// Replace the credential store.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Replace the pipeline store.
    pub fn with_pipelines(mut self, pipelines: Arc<dyn PipelineStore>) -> Self {
        self.pipelines = pipelines;
        self
    }

    /// Replace the task queue.
    pub fn with_tasks(mut self, tasks: Arc<dyn TaskQueue>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Replace the adapter factory.
    pub fn with_registries(mut self, registries: RegistryFactory) -> Self {
        self.registries = registries;
        self
    }

    /// The adapter for this registry's own store.
    pub fn local_registry(&self) -> EuropaRegistry {
        EuropaRegistry::new(
            self.manifests.clone(),
            self.blobs.clone(),
            self.objects.clone(),
        )
    }

    /// The adapter for `repo`.
    pub async fn registry_for(
        &self,
        repo: &ContainerRepo,
        access: &RegistryAccess,
    ) -> RegistryResult<Arc<dyn Registry>> {
        self.registries.open(self, repo, access).await
    }
}
