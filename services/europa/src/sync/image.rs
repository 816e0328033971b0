use serde::{Deserialize, Serialize};

use crate::context::RegistryContext;
use crate::copy::CopyImageBetweenRepos;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::repo::{ContainerRepo, RegistryProvider};

/// Bring one image into a local repository.
///
/// Without a digest the tags are removed from the destination instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSyncTask {
    /// Tenant of both repositories.
    pub domain: String,
    /// Repository the image comes from.
    pub source_repo_id: String,
    /// Local repository receiving the image.
    pub destination_repo_id: String,
    /// Tags the image has at the source.
    pub image_tags: Vec<String>,
    /// Manifest digest, absent when the tags were removed at the source.
    #[serde(default)]
    pub manifest_digest_sha: Option<Digest>,
}

impl ImageSyncTask {
    async fn repo(&self, ctx: &RegistryContext, id: &str) -> RegistryResult<ContainerRepo> {
        ctx.repos
            .get_repo(&self.domain, id)
            .await?
            .ok_or_else(|| RegistryError::repo_id_not_found(&self.domain, id))
    }

    #[tracing::instrument(
        skip_all,
        fields(
            source = %self.source_repo_id,
            destination = %self.destination_repo_id,
            digest = ?self.manifest_digest_sha,
        )
    )]
    pub(super) async fn run(&self, ctx: &RegistryContext) -> RegistryResult<()> {
        let destination = self.repo(ctx, &self.destination_repo_id).await?;
        if !destination.local || destination.provider != RegistryProvider::Europa {
            return Err(RegistryError::InvalidSyncDestination(format!(
                "Can only sync to a local repository, destination repo id {} has provider {}",
                destination.id, destination.provider
            )));
        }

        let Some(digest) = &self.manifest_digest_sha else {
            for tag in &self.image_tags {
                ctx.manifests
                    .remove(&destination.domain, &destination.id, tag)
                    .await?;
            }
            tracing::debug!(tags = ?self.image_tags, "Removed mirrored tags");
            return Ok(());
        };

        let source = self.repo(ctx, &self.source_repo_id).await?;
        CopyImageBetweenRepos::builder()
            .source_repo(source)
            .source_reference(digest.as_str())
            .destination_repo(destination)
            .destination_tags(self.image_tags.iter().map(String::as_str))
            .build()?
            .run(ctx)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::adapter::Registry;
    use crate::manifest::{DOCKER_MANIFEST_V2, ImageManifest};
    use crate::objects::ObjectStore;

    fn context() -> RegistryContext {
        let memory = Arc::new(MemoryStorage::with_buckets(&["registry"]));
        let objects = ObjectStore::new(Storage::new(memory).bucket("registry"));
        let transport = api_client::shared_service(api_client::mock::MockService::new());
        RegistryContext::new(objects, transport)
    }

    fn task(digest: Option<Digest>, destination: &str) -> ImageSyncTask {
        ImageSyncTask {
            domain: "acme".into(),
            source_repo_id: "src".into(),
            destination_repo_id: destination.into(),
            image_tags: vec!["v1".into(), "latest".into()],
            manifest_digest_sha: digest,
        }
    }

    #[tokio::test]
    async fn copies_and_removes_tags() {
        let ctx = context();
        let source = ctx
            .repos
            .save(ContainerRepo::local("acme", "src", "app"))
            .await
            .unwrap();
        ctx.repos
            .save(ContainerRepo::local_mirror("acme", "m1", "app-cache"))
            .await
            .unwrap();

        let manifest = ImageManifest::new(DOCKER_MANIFEST_V2, &b"{\"layers\": []}"[..]);
        ctx.local_registry()
            .put_manifest(&source, &"v1".parse().unwrap(), &manifest)
            .await
            .unwrap();

        task(Some(manifest.digest.clone()), "m1")
            .run(&ctx)
            .await
            .unwrap();
        for tag in ["v1", "latest"] {
            assert!(
                ctx.manifests
                    .get_manifest("acme", "m1", tag)
                    .await
                    .unwrap()
                    .is_some()
            );
        }

        task(None, "m1").run(&ctx).await.unwrap();
        assert!(
            ctx.manifests
                .get_manifest("acme", "m1", "v1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn remote_destinations_are_rejected() {
        let ctx = context();
        ctx.repos
            .save(ContainerRepo::remote(
                "acme",
                "hub",
                "library/app",
                RegistryProvider::DockerHub,
                None,
            ))
            .await
            .unwrap();

        let error = task(None, "hub").run(&ctx).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "Can only sync to a local repository, destination repo id hub has provider DOCKERHUB"
        );

        let missing = task(None, "gone").run(&ctx).await.unwrap_err();
        assert!(matches!(missing, RegistryError::ContainerRepoNotFound { .. }));
    }
}
