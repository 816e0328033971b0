use std::sync::Arc;

use async_trait::async_trait;
use storage_driver::{Reader, Writer};
use tokio::io::BufReader;

use super::{BlobMeta, BlobUpload, Registry};
use crate::blob::BlobTable;
use crate::digest::{Digest, DigestReader, Reference};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{ImageManifest, ManifestTable, RegistryManifest};
use crate::objects::ObjectStore;
use crate::repo::{ContainerRepo, RegistryProvider};

/// The registry's own content-addressed store.
#[derive(Debug, Clone)]
pub struct EuropaRegistry {
    manifests: Arc<dyn ManifestTable>,
    blobs: Arc<dyn BlobTable>,
    objects: ObjectStore,
}

impl EuropaRegistry {
    /// An adapter over the given tables and bucket.
    pub fn new(
        manifests: Arc<dyn ManifestTable>,
        blobs: Arc<dyn BlobTable>,
        objects: ObjectStore,
    ) -> Self {
        Self {
            manifests,
            blobs,
            objects,
        }
    }

    async fn discard(&self, blob_id: &str) -> RegistryResult<()> {
        self.objects.delete(&ObjectStore::blob_key(blob_id)).await?;
        self.blobs.forget_blob(blob_id).await?;
        Ok(())
    }
}

#[async_trait]
impl Registry for EuropaRegistry {
    fn provider(&self) -> RegistryProvider {
        RegistryProvider::Europa
    }

    #[tracing::instrument(skip(self, repo), fields(repo = %repo.name, %reference))]
    async fn get_manifest(
        &self,
        repo: &ContainerRepo,
        reference: &Reference,
    ) -> RegistryResult<Option<ImageManifest>> {
        let Some(row) = self
            .manifests
            .get_manifest(&repo.domain, &repo.id, reference.as_str())
            .await?
        else {
            return Ok(None);
        };

        let Some(body) = self.objects.get_manifest(&row.manifest_id).await? else {
            tracing::warn!(digest = %row.manifest_id, "Manifest row without a stored body");
            return Ok(None);
        };

        Ok(Some(ImageManifest {
            media_type: row.content_type,
            body,
            digest: row.manifest_id,
        }))
    }

    async fn get_blob(
        &self,
        _repo: &ContainerRepo,
        digest: &Digest,
        writer: &mut Writer<'_>,
    ) -> RegistryResult<()> {
        let blob = self
            .blobs
            .get_blob_by_digest(digest)
            .await?
            .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))?;
        self.objects
            .download(&ObjectStore::blob_key(&blob.blob_id), writer)
            .await?;
        Ok(())
    }

    async fn create_blob_upload(
        &self,
        repo: &ContainerRepo,
        digest: &Digest,
        _from_repo: Option<&str>,
    ) -> RegistryResult<BlobUpload> {
        match self.blobs.get_blob_by_digest(digest).await? {
            Some(blob) => Ok(BlobUpload::completed(repo, digest, blob.media_type)),
            None => Ok(BlobUpload::pending(repo, digest)),
        }
    }

    #[tracing::instrument(skip(self, upload, reader), fields(name = %upload.name))]
    async fn blob_upload_chunk(
        &self,
        upload: &mut BlobUpload,
        reader: &mut Reader<'_>,
        length: Option<u64>,
        digest: &Digest,
    ) -> RegistryResult<BlobMeta> {
        let blob_id = match &upload.blob_id {
            Some(blob_id) => blob_id.clone(),
            None => {
                let blob = self.blobs.new_blob(&upload.domain).await?;
                upload.blob_id = Some(blob.blob_id.clone());
                blob.blob_id
            }
        };

        let key = ObjectStore::blob_key(&blob_id);
        let mut hashed = BufReader::new(DigestReader::new(reader));
        if let Err(error) = self.objects.upload(&key, &mut hashed).await {
            self.discard(&blob_id).await?;
            return Err(error.into());
        }

        let computed = hashed.get_ref().digest();
        let size = hashed.get_ref().length();
        if &computed != digest {
            self.discard(&blob_id).await?;
            return Err(RegistryError::DigestMismatch {
                computed,
                declared: digest.clone(),
            });
        }
        if let Some(length) = length.filter(|length| *length != size) {
            tracing::warn!(length, size, "Blob length differs from the declared length");
        }

        let blob = self
            .blobs
            .finish_upload(&blob_id, digest, size, upload.media_type.as_deref())
            .await?;
        if blob.blob_id != blob_id {
            tracing::debug!(%digest, "Blob already stored, dropping the duplicate");
            self.objects.delete(&key).await?;
        }
        upload.complete = true;

        Ok(BlobMeta {
            digest: digest.clone(),
            size: blob.size,
            media_type: blob.media_type,
        })
    }

    #[tracing::instrument(skip(self, repo, manifest), fields(repo = %repo.name, %reference))]
    async fn put_manifest(
        &self,
        repo: &ContainerRepo,
        reference: &Reference,
        manifest: &ImageManifest,
    ) -> RegistryResult<Digest> {
        self.objects
            .put_manifest(&manifest.digest, &manifest.body)
            .await?;

        let row = RegistryManifest::for_image(
            &repo.domain,
            &repo.id,
            reference.as_str(),
            manifest,
            &repo.domain,
        )?;
        if !row.is_digest_alias() {
            self.manifests.put(row.alias()).await?;
        }
        self.manifests.put(row).await?;
        Ok(manifest.digest.clone())
    }

    async fn list_tags(&self, repo: &ContainerRepo) -> RegistryResult<Vec<(String, Digest)>> {
        let images = self
            .manifests
            .list_multi_tagged(&repo.domain, &repo.id)
            .await?;
        let mut tags: Vec<(String, Digest)> = images
            .into_iter()
            .flat_map(|(digest, tags)| tags.into_iter().map(move |tag| (tag, digest.clone())))
            .collect();
        tags.sort();
        Ok(tags)
    }
}
