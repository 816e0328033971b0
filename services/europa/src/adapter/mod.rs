//! One interface over every registry backend.
//!
//! [`Registry`] is implemented by the local store ([`EuropaRegistry`]) and by
//! [`RemoteRegistry`], which speaks the distribution HTTP API to Docker Hub,
//! Google Container Registry, ECR and private registries. [`RegistryFactory`]
//! resolves stored credentials into a ready-to-use adapter for a repository.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use api_client::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use storage_driver::{Reader, Writer};

use crate::context::RegistryContext;
use crate::credentials::RegistryCred;
use crate::digest::{Digest, Reference};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::ImageManifest;
use crate::repo::{ContainerRepo, RegistryProvider};

mod dockerhub;
mod ecr;
mod gcr;
mod local;
mod remote;

pub use self::ecr::{EcrAuthorization, EcrAuthorizer};
pub use self::gcr::ServiceAccountKey;
pub use self::local::EuropaRegistry;
pub use self::remote::{RegistryAuth, RemoteRegistry};

/// An upload session for one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUpload {
    /// Tenant of the target repository.
    pub domain: String,
    /// Repository name the upload targets.
    pub name: String,
    /// Digest the uploaded bytes must hash to.
    pub digest: Digest,
    /// The destination already has the blob.
    pub complete: bool,
    /// Media type recorded with the blob.
    pub media_type: Option<String>,
    /// Upload URL handed out by a remote registry.
    pub location: Option<String>,
    /// Blob row backing a local upload.
    pub blob_id: Option<String>,
}

impl BlobUpload {
    /// A session for a blob the destination does not have yet.
    pub fn pending(repo: &ContainerRepo, digest: &Digest) -> Self {
        Self {
            domain: repo.domain.clone(),
            name: repo.name.clone(),
            digest: digest.clone(),
            complete: false,
            media_type: None,
            location: None,
            blob_id: None,
        }
    }

    /// A session for a blob the destination already has.
    pub fn completed(repo: &ContainerRepo, digest: &Digest, media_type: Option<String>) -> Self {
        Self {
            complete: true,
            media_type,
            ..Self::pending(repo, digest)
        }
    }
}

/// What a backend knows about a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    /// Content digest.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Media type, when recorded.
    pub media_type: Option<String>,
}

/// The capabilities every registry backend provides.
#[async_trait]
pub trait Registry: fmt::Debug + Send + Sync {
    /// Which provider this adapter speaks to.
    fn provider(&self) -> RegistryProvider;

    /// Fetch a manifest, `None` when the reference is unknown.
    async fn get_manifest(
        &self,
        repo: &ContainerRepo,
        reference: &Reference,
    ) -> RegistryResult<Option<ImageManifest>>;

    /// Stream a blob into `writer`.
    async fn get_blob(
        &self,
        repo: &ContainerRepo,
        digest: &Digest,
        writer: &mut Writer<'_>,
    ) -> RegistryResult<()>;

    /// Open an upload session.
    ///
    /// A session which comes back `complete` needs no data: the destination
    /// already has the blob, or mounted it from `from_repo`.
    async fn create_blob_upload(
        &self,
        repo: &ContainerRepo,
        digest: &Digest,
        from_repo: Option<&str>,
    ) -> RegistryResult<BlobUpload>;

    /// Send the whole blob through an upload session.
    ///
    /// Fails with [`RegistryError::DigestMismatch`] when the bytes do not hash
    /// to `digest`; nothing is kept in that case.
    async fn blob_upload_chunk(
        &self,
        upload: &mut BlobUpload,
        reader: &mut Reader<'_>,
        length: Option<u64>,
        digest: &Digest,
    ) -> RegistryResult<BlobMeta>;

    /// Store a manifest under `reference`, returning its digest.
    async fn put_manifest(
        &self,
        repo: &ContainerRepo,
        reference: &Reference,
        manifest: &ImageManifest,
    ) -> RegistryResult<Digest>;

    /// Every tag of a repository with the digest it points at.
    async fn list_tags(&self, repo: &ContainerRepo) -> RegistryResult<Vec<(String, Digest)>>;
}

/// Why an adapter is being opened.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegistryAccess {
    /// Read only.
    #[default]
    Pull,
    /// Read and write, optionally mounting blobs from another repository.
    Push {
        /// Repository name blobs may be mounted from.
        mount_from: Option<String>,
    },
}

impl RegistryAccess {
    /// Whether writes are needed.
    pub fn is_push(&self) -> bool {
        matches!(self, RegistryAccess::Push { .. })
    }

    /// The repository blobs may be mounted from.
    pub fn mount_from(&self) -> Option<&str> {
        match self {
            RegistryAccess::Pull => None,
            RegistryAccess::Push { mount_from } => mount_from.as_deref(),
        }
    }
}

/// Token endpoints and registry hosts for the public providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    /// Docker Hub token service.
    pub dockerhub_auth: String,
    /// Docker Hub registry API root.
    pub dockerhub_registry: String,
    /// Scheme used for GCR hosts.
    pub gcr_scheme: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            dockerhub_auth: "https://auth.docker.io/token".into(),
            dockerhub_registry: "https://index.docker.io/v2/".into(),
            gcr_scheme: "https".into(),
        }
    }
}

/// Builds adapters for repositories.
#[derive(Clone)]
pub struct RegistryFactory {
    transport: Transport,
    endpoints: ProviderEndpoints,
    ecr: Option<Arc<dyn EcrAuthorizer>>,
    gcr_tokens: Arc<Mutex<HashMap<String, gcr::TokenCache>>>,
}

impl fmt::Debug for RegistryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryFactory")
            .field("endpoints", &self.endpoints)
            .field("ecr", &self.ecr)
            .finish_non_exhaustive()
    }
}

impl RegistryFactory {
    /// Adapters send their requests through `transport`.
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            endpoints: ProviderEndpoints::default(),
            ecr: None,
            gcr_tokens: Default::default(),
        }
    }

    /// Override the provider endpoints.
    pub fn with_endpoints(mut self, endpoints: ProviderEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Enable ECR repositories.
    pub fn with_ecr(mut self, authorizer: Arc<dyn EcrAuthorizer>) -> Self {
        self.ecr = Some(authorizer);
        self
    }

    /// Open the adapter for `repo`.
    #[tracing::instrument(skip_all, fields(repo = %repo.name, provider = %repo.provider))]
    pub async fn open(
        &self,
        ctx: &RegistryContext,
        repo: &ContainerRepo,
        access: &RegistryAccess,
    ) -> RegistryResult<Arc<dyn Registry>> {
        let registry = match repo.provider {
            RegistryProvider::Europa if repo.local => {
                return Ok(Arc::new(ctx.local_registry()));
            }
            RegistryProvider::Europa => {
                return Err(RegistryError::RegistryNotFound {
                    repository: repo.name.clone(),
                    provider: repo.provider.to_string(),
                });
            }
            RegistryProvider::DockerHub => {
                let cred = self.credential(ctx, repo).await?;
                dockerhub::open(
                    &self.transport,
                    &self.endpoints,
                    repo,
                    cred.as_ref(),
                    access,
                )
                .await?
            }
            RegistryProvider::Gcr => {
                let cred = self
                    .credential(ctx, repo)
                    .await?
                    .ok_or_else(|| missing_credential(repo))?;
                gcr::open(
                    &self.transport,
                    &self.endpoints,
                    &self.gcr_tokens,
                    repo,
                    &cred,
                )
                .await?
            }
            RegistryProvider::Ecr => {
                let authorizer =
                    self.ecr
                        .as_ref()
                        .ok_or_else(|| RegistryError::RegistryNotFound {
                            repository: repo.name.clone(),
                            provider: repo.provider.to_string(),
                        })?;
                let cred = self
                    .credential(ctx, repo)
                    .await?
                    .ok_or_else(|| missing_credential(repo))?;
                ecr::open(&self.transport, authorizer.as_ref(), repo, &cred).await?
            }
            RegistryProvider::Private => {
                let cred = self.credential(ctx, repo).await?;
                remote::open_private(&self.transport, repo, cred.as_ref())?
            }
        };
        Ok(Arc::new(registry))
    }

    async fn credential(
        &self,
        ctx: &RegistryContext,
        repo: &ContainerRepo,
    ) -> RegistryResult<Option<RegistryCred>> {
        let Some(cred_id) = repo.cred_id.as_deref() else {
            return Ok(None);
        };
        let cred = ctx.credentials.get_cred(&repo.domain, cred_id).await?;
        cred.map(Some).ok_or_else(|| RegistryError::CredentialNotFound {
            domain: repo.domain.clone(),
            id: cred_id.to_owned(),
        })
    }
}

fn missing_credential(repo: &ContainerRepo) -> RegistryError {
    RegistryError::InvalidCredential(format!(
        "repository {} on {} requires a credential",
        repo.name, repo.provider
    ))
}

#[cfg(test)]
mod tests {
    use api_client::mock::{MockResponse, MockService};
    use http::{Method, StatusCode};
    use serde_json::json;
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::objects::ObjectStore;

    #[derive(Debug)]
    struct StaticEcr;

    #[async_trait]
    impl EcrAuthorizer for StaticEcr {
        async fn authorize(
            &self,
            _cred: &RegistryCred,
            _registry_id: Option<&str>,
            _region: Option<&str>,
        ) -> RegistryResult<EcrAuthorization> {
            Ok(EcrAuthorization {
                token: "QVdTOnRva2Vu".into(),
                proxy_endpoint: "https://ecr.example".into(),
            })
        }
    }

    fn context(mock: &MockService, factory: fn(RegistryFactory) -> RegistryFactory) -> RegistryContext {
        let objects =
            ObjectStore::new(Storage::new(MemoryStorage::with_buckets(&["registry"])).bucket("registry"));
        let transport = api_client::shared_service(mock.clone());
        let registries = factory(RegistryFactory::new(transport.clone()));
        RegistryContext::new(objects, transport).with_registries(registries)
    }

    #[tokio::test]
    async fn local_repos_use_the_store() {
        let ctx = context(&MockService::new(), |factory| factory);
        let repo = ContainerRepo::local("acme", "dev", "app");
        let registry = ctx.registry_for(&repo, &RegistryAccess::Pull).await.unwrap();
        assert_eq!(registry.provider(), RegistryProvider::Europa);

        let mut hosted = repo.clone();
        hosted.local = false;
        let error = ctx
            .registry_for(&hosted, &RegistryAccess::Pull)
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::RegistryNotFound { .. }));
    }

    #[tokio::test]
    async fn endpoints_can_be_overridden() {
        let mock = MockService::new();
        mock.add(
            Method::GET,
            "/hub/token",
            MockResponse::new(
                StatusCode::OK,
                http::HeaderMap::new(),
                json!({"access_token": "anonymous"}).to_string(),
            ),
        );
        let ctx = context(&mock, |factory| {
            factory.with_endpoints(ProviderEndpoints {
                dockerhub_auth: "http://auth.test/hub/token".into(),
                dockerhub_registry: "http://hub.test".into(),
                gcr_scheme: "http".into(),
            })
        });

        let repo = ContainerRepo::remote("acme", "s1", "ubuntu", RegistryProvider::DockerHub, None);
        let registry = ctx.registry_for(&repo, &RegistryAccess::Pull).await.unwrap();
        assert_eq!(registry.provider(), RegistryProvider::DockerHub);
        assert_eq!(mock.requests_to(&Method::GET, "/hub/token").len(), 1);
    }

    #[tokio::test]
    async fn ecr_needs_an_authorizer() {
        let mock = MockService::new();
        let repo = ContainerRepo::remote("acme", "e1", "app", RegistryProvider::Ecr, Some("aws"));

        let ctx = context(&mock, |factory| factory);
        ctx.credentials
            .save(RegistryCred::new("acme", "aws", RegistryProvider::Ecr))
            .await
            .unwrap();
        let error = ctx
            .registry_for(&repo, &RegistryAccess::Pull)
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::RegistryNotFound { .. }));

        let ctx = context(&mock, |factory| factory.with_ecr(Arc::new(StaticEcr)));
        ctx.credentials
            .save(RegistryCred::new("acme", "aws", RegistryProvider::Ecr))
            .await
            .unwrap();
        let registry = ctx.registry_for(&repo, &RegistryAccess::Pull).await.unwrap();
        assert_eq!(registry.provider(), RegistryProvider::Ecr);
    }

    #[tokio::test]
    async fn credentials_must_resolve() {
        let ctx = context(&MockService::new(), |factory| factory);

        let gcr = ContainerRepo::remote("acme", "g1", "proj/app", RegistryProvider::Gcr, None);
        let error = ctx.registry_for(&gcr, &RegistryAccess::Pull).await.unwrap_err();
        assert!(matches!(error, RegistryError::InvalidCredential(_)));

        let mut private =
            ContainerRepo::remote("acme", "p1", "app", RegistryProvider::Private, Some("gone"));
        private.endpoint = Some("registry.example".into());
        let error = ctx
            .registry_for(&private, &RegistryAccess::Pull)
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::CredentialNotFound { .. }));
    }
}
