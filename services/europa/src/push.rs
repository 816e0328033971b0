//! Manifest push ingress.

use bytes::Bytes;

use crate::context::RegistryContext;
use crate::digest::{Digest, Reference};
use crate::directory::get_or_create_local_repo;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{ImageManifest, RegistryManifest};
use crate::objects::ObjectStore;
use crate::pipeline::{PipelineOutcome, PromotedImage, run_triggered_pipelines};
use crate::repo::{ContainerRepo, is_valid_local_name};

/// A manifest pushed by a client.
#[derive(Debug, Clone)]
pub struct ManifestPush<'a> {
    /// Tenant.
    pub domain: &'a str,
    /// Local repository name.
    pub name: &'a str,
    /// Tag or digest the client pushed to.
    pub reference: &'a str,
    /// Declared `Content-Type`.
    pub content_type: Option<&'a str>,
    /// Manifest bytes, exactly as received.
    pub body: Bytes,
    /// Who is pushing.
    pub uploaded_by: &'a str,
}

/// What a successful push did.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    /// The repository pushed to.
    pub repo: ContainerRepo,
    /// Digest of the manifest body.
    pub digest: Digest,
    /// Media type the manifest was stored with.
    pub media_type: String,
    /// Runs of the pipelines the push triggered.
    pub pipelines: Vec<PipelineOutcome>,
}

/// Store a pushed manifest and run the pipelines it triggers.
///
/// The body is stored once per digest. Two rows are written, the digest alias
/// first and then the pushed reference; they are not written atomically. Every
/// blob the manifest references must already be uploaded, otherwise nothing is
/// kept and [`RegistryError::BlobUnknown`] lists the missing digests.
#[tracing::instrument(skip_all, fields(domain = push.domain, name = push.name, reference = push.reference))]
pub async fn push_manifest(
    ctx: &RegistryContext,
    push: ManifestPush<'_>,
) -> RegistryResult<PushOutcome> {
    if !is_valid_local_name(push.name) {
        return Err(RegistryError::InvalidRepositoryName(push.name.to_owned()));
    }
    let reference: Reference = push.reference.parse()?;
    let manifest = ImageManifest::from_push(push.content_type, push.body)?;
    if let Some(declared) = reference.digest() {
        if declared != &manifest.digest {
            return Err(RegistryError::DigestMismatch {
                computed: manifest.digest.clone(),
                declared: declared.clone(),
            });
        }
    }

    let repo = get_or_create_local_repo(ctx.repos.as_ref(), push.domain, push.name).await?;
    if repo.mirror {
        return Err(RegistryError::Denied(format!(
            "{} is a mirror and cannot be pushed to",
            repo.name
        )));
    }

    let digests = manifest.digests()?;
    let created = ctx
        .objects
        .put_manifest(&manifest.digest, &manifest.body)
        .await?;

    let mut unknown = Vec::new();
    for digest in &digests {
        if ctx.blobs.get_blob_by_digest(digest).await?.is_none() {
            unknown.push(digest.clone());
        }
    }
    if !unknown.is_empty() {
        if created {
            ctx.objects
                .delete(&ObjectStore::manifest_key(&manifest.digest))
                .await?;
        }
        tracing::debug!(count = unknown.len(), "Manifest references unknown blobs");
        return Err(RegistryError::BlobUnknown(unknown));
    }

    let row = RegistryManifest::for_image(
        &repo.domain,
        &repo.id,
        reference.as_str(),
        &manifest,
        push.uploaded_by,
    )?;
    if !row.is_digest_alias() {
        ctx.manifests.put(row.alias()).await?;
    }
    ctx.manifests.put(row).await?;
    tracing::info!(digest = %manifest.digest, "Manifest pushed");

    let image = PromotedImage {
        repo: repo.clone(),
        tag: reference.to_string(),
        manifest_digest: manifest.digest.clone(),
    };
    let pipelines = run_triggered_pipelines(ctx, &image).await?;

    Ok(PushOutcome {
        repo,
        digest: manifest.digest,
        media_type: manifest.media_type,
        pipelines,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::adapter::Registry;
    use crate::manifest::DOCKER_MANIFEST_V2;
    use crate::pipeline::{Pipeline, PipelineComponent};

    fn context() -> (RegistryContext, Arc<MemoryStorage>) {
        let memory = Arc::new(MemoryStorage::with_buckets(&["registry"]));
        let objects = ObjectStore::new(Storage::new(memory.clone()).bucket("registry"));
        let transport = api_client::shared_service(api_client::mock::MockService::new());
        (RegistryContext::new(objects, transport), memory)
    }

    fn manifest_body(layers: &[&Digest]) -> Bytes {
        let layers: Vec<_> = layers
            .iter()
            .map(|digest| json!({"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": digest, "size": 5}))
            .collect();
        serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_V2,
            "layers": layers,
        }))
        .unwrap()
        .into()
    }

    fn push<'a>(name: &'a str, reference: &'a str, body: Bytes) -> ManifestPush<'a> {
        ManifestPush {
            domain: "acme",
            name,
            reference,
            content_type: None,
            body,
            uploaded_by: "ci",
        }
    }

    async fn upload(ctx: &RegistryContext, data: &[u8]) -> Digest {
        let registry = ctx.local_registry();
        let repo = ContainerRepo::local("acme", "scratch", "scratch");
        let digest = Digest::of(data);
        let mut upload = registry.create_blob_upload(&repo, &digest, None).await.unwrap();
        let mut reader = data;
        registry
            .blob_upload_chunk(&mut upload, &mut reader, None, &digest)
            .await
            .unwrap();
        digest
    }

    #[tokio::test]
    async fn unknown_blobs_roll_back() {
        let (ctx, memory) = context();
        let layer = Digest::of(b"layer");
        let error = push_manifest(&ctx, push("app", "v1", manifest_body(&[&layer])))
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::BlobUnknown(ref digests) if digests == &[layer.clone()]));
        assert_eq!(memory.object_count("registry").await, 0);

        upload(&ctx, b"layer").await;
        let outcome = push_manifest(&ctx, push("app", "v1", manifest_body(&[&layer])))
            .await
            .unwrap();
        assert_eq!(outcome.digest, Digest::of(&manifest_body(&[&layer])));
        assert_eq!(outcome.media_type, DOCKER_MANIFEST_V2);

        for tag in ["v1", outcome.digest.as_str()] {
            let row = ctx
                .manifests
                .get_manifest("acme", &outcome.repo.id, tag)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(row.manifest_id, outcome.digest);
            assert_eq!(row.uploaded_by, "ci");
        }
    }

    #[tokio::test]
    async fn digest_references_must_match() {
        let (ctx, _) = context();
        let body = manifest_body(&[]);
        let wrong = Digest::of(b"something else");
        let error = push_manifest(&ctx, push("app", wrong.as_str(), body.clone()))
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::DigestMismatch { .. }));

        let right = Digest::of(&body);
        let outcome = push_manifest(&ctx, push("app", right.as_str(), body))
            .await
            .unwrap();
        let (tags, _) = ctx
            .manifests
            .list_tags("acme", &outcome.repo.id, &crate::manifest::PageIterator::first(10))
            .await
            .unwrap();
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn names_and_mirrors_are_checked() {
        let (ctx, _) = context();
        assert!(matches!(
            push_manifest(&ctx, push("Bad Name", "v1", manifest_body(&[]))).await,
            Err(RegistryError::InvalidRepositoryName(_))
        ));

        ctx.repos
            .save(ContainerRepo::local_mirror("acme", "m1", "cache"))
            .await
            .unwrap();
        assert!(matches!(
            push_manifest(&ctx, push("cache", "v1", manifest_body(&[]))).await,
            Err(RegistryError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn pushes_trigger_pipelines() {
        let (ctx, _) = context();
        let dev = get_or_create_local_repo(ctx.repos.as_ref(), "acme", "app-dev")
            .await
            .unwrap();
        let prod = get_or_create_local_repo(ctx.repos.as_ref(), "acme", "app-prod")
            .await
            .unwrap();

        let mut pipeline = Pipeline::new("acme", "promote", Some(&dev.id));
        pipeline
            .add_component(PipelineComponent::copy_to_repository(&prod.id, Some("stable")), None)
            .unwrap();
        ctx.pipelines.save(pipeline).await.unwrap();

        let outcome = push_manifest(&ctx, push("app-dev", "v1", manifest_body(&[])))
            .await
            .unwrap();
        assert_eq!(outcome.pipelines.len(), 1);
        assert!(outcome.pipelines[0].completed());

        let row = ctx
            .manifests
            .get_manifest("acme", &prod.id, "stable")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.manifest_id, outcome.digest);
    }
}
