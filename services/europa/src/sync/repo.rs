use serde::{Deserialize, Serialize};

use super::ImageSyncTask;
use crate::context::RegistryContext;
use crate::error::{RegistryError, RegistryResult};
use crate::repo::RegistryProvider;

/// Replicate every image of a source repository into a mirror.
///
/// Used when a mirror relationship is created; later changes are picked up by
/// [`RepoMonitorTask`](super::RepoMonitorTask).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSyncTask {
    /// Tenant of both repositories.
    pub domain: String,
    /// Repository being mirrored.
    pub source_repo_id: String,
    /// Local mirror receiving its images.
    pub destination_repo_id: String,
}

impl RepoSyncTask {
    #[tracing::instrument(skip_all, fields(source = %self.source_repo_id, destination = %self.destination_repo_id))]
    pub(super) async fn run(&self, ctx: &RegistryContext) -> RegistryResult<()> {
        let destination = ctx
            .repos
            .get_repo(&self.domain, &self.destination_repo_id)
            .await?
            .ok_or_else(|| RegistryError::repo_id_not_found(&self.domain, &self.destination_repo_id))?;

        if destination.provider != RegistryProvider::Europa
            || !destination.local
            || !destination.mirror
        {
            let mut message = format!(
                "Can only sync to a local cache repository, destination repo id {} has provider {}",
                destination.id, destination.provider
            );
            if !destination.local {
                message.push_str(" and is not local");
            }
            if !destination.mirror {
                message.push_str(" and is not a cache repo");
            }
            return Err(RegistryError::InvalidSyncDestination(message));
        }

        let source = ctx
            .repos
            .get_repo(&self.domain, &self.source_repo_id)
            .await?
            .ok_or_else(|| RegistryError::repo_id_not_found(&self.domain, &self.source_repo_id))?;

        let images = ctx
            .manifests
            .list_multi_tagged(&source.domain, &source.id)
            .await?;
        tracing::debug!(images = images.len(), "Fanning out image sync tasks");
        for (digest, image_tags) in images {
            let task = ImageSyncTask {
                domain: self.domain.clone(),
                source_repo_id: source.id.clone(),
                destination_repo_id: destination.id.clone(),
                image_tags,
                manifest_digest_sha: Some(digest),
            };
            ctx.tasks.add_task(task.into()).await?;
        }
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
    use crate::repo::ContainerRepo;
    use crate::sync::{SyncTask, SyncWorker};

    fn context() -> RegistryContext {
        let memory = Arc::new(MemoryStorage::with_buckets(&["registry"]));
        let objects = ObjectStore::new(Storage::new(memory).bucket("registry"));
        let transport = api_client::shared_service(api_client::mock::MockService::new());
        RegistryContext::new(objects, transport)
    }

    fn task(destination: &str) -> RepoSyncTask {
        RepoSyncTask {
            domain: "acme".into(),
            source_repo_id: "src".into(),
            destination_repo_id: destination.into(),
        }
    }

    #[tokio::test]
    async fn destination_must_be_a_local_cache() {
        let ctx = context();
        ctx.repos
            .save(ContainerRepo::local("acme", "plain", "plain"))
            .await
            .unwrap();

        let error = task("plain").run(&ctx).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "Can only sync to a local cache repository, destination repo id plain has provider EUROPA and is not a cache repo"
        );
    }

    #[tokio::test]
    async fn fans_out_one_task_per_image() {
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

        let registry = ctx.local_registry();
        let one = ImageManifest::new(DOCKER_MANIFEST_V2, &b"{\"layers\": [], \"n\": 1}"[..]);
        let two = ImageManifest::new(DOCKER_MANIFEST_V2, &b"{\"layers\": [], \"n\": 2}"[..]);
        for (tag, manifest) in [("v1", &one), ("latest", &one), ("v2", &two)] {
            registry
                .put_manifest(&source, &tag.parse().unwrap(), manifest)
                .await
                .unwrap();
        }

        ctx.tasks.add_task(task("m1").into()).await.unwrap();
        let worker = SyncWorker::new(ctx.clone());
        let report = worker.run_pending().await.unwrap();
        assert_eq!(report.completed, 3);
        assert!(report.failed.is_empty());

        for tag in ["v1", "latest", "v2"] {
            assert!(
                ctx.manifests
                    .get_manifest("acme", "m1", tag)
                    .await
                    .unwrap()
                    .is_some()
            );
        }
        assert!(matches!(ctx.tasks.pop().await.unwrap(), None::<SyncTask>));
    }
}
