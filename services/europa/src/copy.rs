//! Copy one image between any two repositories.
//!
//! Between two local repositories a copy is a metadata clone: blobs are global
//! and content-addressed, so only manifest rows are written. Anything else goes
//! through the adapters, streaming each missing blob from the source straight
//! into the destination upload.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWriteExt as _, BufReader};

use crate::adapter::{BlobUpload, Registry, RegistryAccess};
use crate::context::RegistryContext;
use crate::digest::{Digest, Reference};
use crate::error::{RegistryError, RegistryResult};
use crate::repo::ContainerRepo;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Collects the parameters of a [`CopyImageBetweenRepos`].
#[derive(Debug, Default, Clone)]
pub struct CopyImageBetweenReposBuilder {
    source_repo: Option<ContainerRepo>,
    source_reference: Option<String>,
    destination_repo: Option<ContainerRepo>,
    destination_tags: Vec<String>,
}

impl CopyImageBetweenReposBuilder {
    /// Repository to copy from.
    pub fn source_repo(mut self, repo: ContainerRepo) -> Self {
        self.source_repo = Some(repo);
        self
    }

    /// Tag or digest of the image in the source repository.
    pub fn source_reference(mut self, reference: impl Into<String>) -> Self {
        self.source_reference = Some(reference.into());
        self
    }

    /// Repository to copy to.
    pub fn destination_repo(mut self, repo: ContainerRepo) -> Self {
        self.destination_repo = Some(repo);
        self
    }

    /// Add a tag for the copied image.
    ///
    /// Without any, the source reference is reused.
    pub fn destination_tag(mut self, tag: impl Into<String>) -> Self {
        self.destination_tags.push(tag.into());
        self
    }

    /// Add several tags for the copied image.
    pub fn destination_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destination_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Validate the parameters.
    pub fn build(self) -> RegistryResult<CopyImageBetweenRepos> {
        let source_repo = self
            .source_repo
            .ok_or(RegistryError::MissingParam("sourceRepo"))?;
        let destination_repo = self
            .destination_repo
            .ok_or(RegistryError::MissingParam("destinationRepo"))?;
        let source_reference: Reference = self
            .source_reference
            .ok_or(RegistryError::MissingParam("sourceReference"))?
            .parse()?;

        let mut destination_tags = Vec::with_capacity(self.destination_tags.len().max(1));
        for tag in self.destination_tags {
            let tag: Reference = tag.parse()?;
            if !destination_tags.contains(&tag) {
                destination_tags.push(tag);
            }
        }
        if destination_tags.is_empty() {
            destination_tags.push(source_reference.clone());
        }

        Ok(CopyImageBetweenRepos {
            source_repo,
            source_reference,
            destination_repo,
            destination_tags,
            started: AtomicBool::new(false),
        })
    }
}

/// A single copy of one image. Running it a second time is an error.
#[derive(Debug)]
pub struct CopyImageBetweenRepos {
    source_repo: ContainerRepo,
    source_reference: Reference,
    destination_repo: ContainerRepo,
    destination_tags: Vec<Reference>,
    started: AtomicBool,
}

impl CopyImageBetweenRepos {
    /// Start describing a copy.
    pub fn builder() -> CopyImageBetweenReposBuilder {
        CopyImageBetweenReposBuilder::default()
    }

    /// Tags the image will have in the destination.
    pub fn destination_tags(&self) -> &[Reference] {
        &self.destination_tags
    }

    /// Perform the copy, returning the manifest digest.
    #[tracing::instrument(
        skip_all,
        fields(
            source = %self.source_repo.name,
            reference = %self.source_reference,
            destination = %self.destination_repo.name,
        )
    )]
    pub async fn run(&self, ctx: &RegistryContext) -> RegistryResult<Digest> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::DuplicateRegistryOperation("copy"));
        }

        if self.source_repo.is_local_europa() && self.destination_repo.is_local_europa() {
            self.copy_local(ctx).await
        } else {
            self.copy_remote(ctx).await
        }
    }

    fn manifest_not_found(&self) -> RegistryError {
        RegistryError::ManifestNotFound {
            reference: self.source_reference.to_string(),
            repository: self.source_repo.name.clone(),
        }
    }

    /// Cross-mounting needs one account to see both repositories.
    fn mount_from(&self) -> Option<&str> {
        let shared = self.source_repo.provider == self.destination_repo.provider
            && match (&self.source_repo.cred_id, &self.destination_repo.cred_id) {
                (Some(source), Some(destination)) => source.eq_ignore_ascii_case(destination),
                (None, None) => true,
                _ => false,
            };
        shared.then_some(self.source_repo.name.as_str())
    }

    async fn copy_local(&self, ctx: &RegistryContext) -> RegistryResult<Digest> {
        let source = &self.source_repo;
        let destination = &self.destination_repo;
        if ctx
            .repos
            .get_repo(&destination.domain, &destination.id)
            .await?
            .is_none()
        {
            return Err(RegistryError::repo_id_not_found(
                &destination.domain,
                &destination.id,
            ));
        }

        let row = ctx
            .manifests
            .get_manifest(&source.domain, &source.id, self.source_reference.as_str())
            .await?
            .ok_or_else(|| self.manifest_not_found())?;

        let alias = row.alias();
        ctx.manifests
            .put(alias.retarget(&destination.domain, &destination.id, &alias.tag))
            .await?;
        for tag in &self.destination_tags {
            if tag.digest() == Some(&row.manifest_id) {
                continue;
            }
            ctx.manifests
                .put(row.retarget(&destination.domain, &destination.id, tag.as_str()))
                .await?;
        }

        tracing::debug!(digest = %row.manifest_id, "Copied manifest rows");
        Ok(row.manifest_id)
    }

    async fn copy_remote(&self, ctx: &RegistryContext) -> RegistryResult<Digest> {
        let mount_from = self.mount_from();
        let source = ctx
            .registry_for(&self.source_repo, &RegistryAccess::Pull)
            .await?;
        let destination = ctx
            .registry_for(
                &self.destination_repo,
                &RegistryAccess::Push {
                    mount_from: mount_from.map(str::to_owned),
                },
            )
            .await?;

        let manifest = source
            .get_manifest(&self.source_repo, &self.source_reference)
            .await?
            .ok_or_else(|| self.manifest_not_found())?;

        for (digest, media_type) in manifest.blob_references()? {
            let mut upload = destination
                .create_blob_upload(&self.destination_repo, &digest, mount_from)
                .await?;
            if upload.complete {
                tracing::trace!(%digest, "Destination already has blob");
                continue;
            }
            upload.media_type = media_type;
            self.transfer(source.as_ref(), destination.as_ref(), &mut upload, &digest)
                .await?;
        }

        for tag in &self.destination_tags {
            destination
                .put_manifest(&self.destination_repo, tag, &manifest)
                .await?;
        }
        Ok(manifest.digest)
    }

    /// Pipe one blob from the source download into the destination upload.
    async fn transfer(
        &self,
        source: &dyn Registry,
        destination: &dyn Registry,
        upload: &mut BlobUpload,
        digest: &Digest,
    ) -> RegistryResult<()> {
        let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let mut reader = BufReader::new(reader);

        let send = async {
            let fetched = source.get_blob(&self.source_repo, digest, &mut writer).await;
            writer.shutdown().await?;
            fetched?;
            Ok::<(), RegistryError>(())
        };
        let receive = destination.blob_upload_chunk(upload, &mut reader, None, digest);

        let ((), meta) = tokio::try_join!(send, receive)?;
        tracing::debug!(%digest, size = meta.size, "Copied blob");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::manifest::{DOCKER_MANIFEST_V2, ImageManifest};
    use crate::objects::ObjectStore;

    fn context() -> (RegistryContext, Arc<MemoryStorage>) {
        let memory = Arc::new(MemoryStorage::with_buckets(&["registry"]));
        let objects = ObjectStore::new(Storage::new(memory.clone()).bucket("registry"));
        let transport = api_client::shared_service(api_client::mock::MockService::new());
        (RegistryContext::new(objects, transport), memory)
    }

    #[test]
    fn builder_validates() {
        let repo = ContainerRepo::local("acme", "r1", "app");
        assert!(matches!(
            CopyImageBetweenRepos::builder()
                .destination_repo(repo.clone())
                .source_reference("v1")
                .build(),
            Err(RegistryError::MissingParam("sourceRepo"))
        ));
        assert!(matches!(
            CopyImageBetweenRepos::builder()
                .source_repo(repo.clone())
                .destination_repo(repo.clone())
                .source_reference("not a tag")
                .build(),
            Err(RegistryError::InvalidReference(_))
        ));

        let copy = CopyImageBetweenRepos::builder()
            .source_repo(repo.clone())
            .destination_repo(repo)
            .source_reference("v1")
            .build()
            .unwrap();
        assert_eq!(copy.destination_tags(), &["v1".parse::<Reference>().unwrap()]);
    }

    #[test]
    fn mounts_need_shared_credentials() {
        let source = ContainerRepo::remote(
            "acme",
            "a",
            "team/a",
            crate::repo::RegistryProvider::Private,
            Some("Cred"),
        );
        let mut destination = ContainerRepo::remote(
            "acme",
            "b",
            "team/b",
            crate::repo::RegistryProvider::Private,
            Some("cred"),
        );
        let copy = |destination: &ContainerRepo| {
            CopyImageBetweenRepos::builder()
                .source_repo(source.clone())
                .destination_repo(destination.clone())
                .source_reference("v1")
                .build()
                .unwrap()
        };
        assert_eq!(copy(&destination).mount_from(), Some("team/a"));

        destination.cred_id = Some("other".into());
        assert_eq!(copy(&destination).mount_from(), None);
    }

    #[tokio::test]
    async fn local_copies_only_write_rows() {
        let (ctx, memory) = context();
        let source = ContainerRepo::local("acme", "dev", "app-dev");
        let destination = ContainerRepo::local("acme", "prod", "app-prod");
        ctx.repos.save(destination.clone()).await.unwrap();

        let registry = ctx.local_registry();
        let manifest = ImageManifest::new(DOCKER_MANIFEST_V2, &b"{\"layers\": []}"[..]);
        registry
            .put_manifest(&source, &"v1".parse().unwrap(), &manifest)
            .await
            .unwrap();
        let before = memory.operations();

        let copy = CopyImageBetweenRepos::builder()
            .source_repo(source)
            .destination_repo(destination.clone())
            .source_reference("v1")
            .destination_tags(["stable", "latest"])
            .build()
            .unwrap();
        let digest = copy.run(&ctx).await.unwrap();
        assert_eq!(digest, manifest.digest);
        assert_eq!(memory.operations(), before);

        for tag in ["stable", "latest", manifest.digest.as_str()] {
            let row = ctx
                .manifests
                .get_manifest("acme", "prod", tag)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(row.manifest_id, manifest.digest);
        }

        assert!(matches!(
            copy.run(&ctx).await,
            Err(RegistryError::DuplicateRegistryOperation("copy"))
        ));
    }

    #[tokio::test]
    async fn missing_source_manifest() {
        let (ctx, _) = context();
        ctx.repos
            .save(ContainerRepo::local("acme", "prod", "app-prod"))
            .await
            .unwrap();
        let copy = CopyImageBetweenRepos::builder()
            .source_repo(ContainerRepo::local("acme", "dev", "app-dev"))
            .destination_repo(ContainerRepo::local("acme", "prod", "app-prod"))
            .source_reference("v1")
            .build()
            .unwrap();
        let error = copy.run(&ctx).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "No manifest found for reference v1 in repository app-dev"
        );
    }

    #[tokio::test]
    async fn local_copy_needs_the_destination() {
        let (ctx, _) = context();
        let source = ContainerRepo::local("acme", "dev", "app-dev");
        let manifest = ImageManifest::new(DOCKER_MANIFEST_V2, &b"{\"layers\": []}"[..]);
        ctx.local_registry()
            .put_manifest(&source, &"v1".parse().unwrap(), &manifest)
            .await
            .unwrap();

        let copy = CopyImageBetweenRepos::builder()
            .source_repo(source)
            .destination_repo(ContainerRepo::local("acme", "gone", "app-gone"))
            .source_reference("v1")
            .build()
            .unwrap();
        assert!(matches!(
            copy.run(&ctx).await,
            Err(RegistryError::ContainerRepoNotFound { .. })
        ));
        let page = ctx
            .manifests
            .list_manifests("acme", "gone", &crate::manifest::PageIterator::first(10))
            .await
            .unwrap();
        assert!(page.items.is_empty());
    }
}
