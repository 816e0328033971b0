//! Blob rows.
//!
//! Blobs are global rather than per-repository. A row is created when an upload
//! starts and gains its digest when the upload completes; from then on it is
//! immutable.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::digest::Digest;
use crate::error::RegistryError;

/// One chunk of an upload in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryBlobPart {
    /// 1-based position of the chunk.
    pub part_num: u32,
    /// Bytes in the chunk.
    pub chunk_size: u64,
    /// Object key holding the chunk.
    pub part_id: String,
}

/// A blob row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryBlob {
    /// Identifier, also the object key suffix.
    pub blob_id: String,
    /// Set once the upload is confirmed.
    #[serde(default)]
    pub digest: Option<Digest>,
    /// Media type, when known.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Bytes stored.
    #[serde(default)]
    pub size: u64,
    /// Chunks received so far.
    #[serde(default)]
    pub parts: Vec<RegistryBlobPart>,
    /// Who started the upload.
    pub uploaded_by: String,
    /// When the upload started.
    pub upload_started: DateTime<Utc>,
}

impl RegistryBlob {
    /// Bytes received across all chunks.
    pub fn received(&self) -> u64 {
        self.parts.iter().map(|part| part.chunk_size).sum()
    }

    /// Whether the digest has been confirmed.
    pub fn is_complete(&self) -> bool {
        self.digest.is_some()
    }
}

/// Persistence contract for blob rows.
#[async_trait]
pub trait BlobTable: fmt::Debug + Send + Sync {
    /// Start a new, empty upload.
    async fn new_blob(&self, uploaded_by: &str) -> Result<RegistryBlob, RegistryError>;

    /// Look up a row by id.
    async fn get_blob(&self, blob_id: &str) -> Result<Option<RegistryBlob>, RegistryError>;

    /// Look up a confirmed row by digest.
    async fn get_blob_by_digest(
        &self,
        digest: &Digest,
    ) -> Result<Option<RegistryBlob>, RegistryError>;

    /// Record a chunk.
    async fn add_part(
        &self,
        blob_id: &str,
        part: RegistryBlobPart,
    ) -> Result<RegistryBlob, RegistryError>;

    /// Confirm an upload.
    ///
    /// When another row already holds `digest`, this row is dropped and the existing
    /// row is returned, so there is only ever one stored blob per digest. Callers
    /// compare the returned `blob_id` to decide whether their object is redundant.
    async fn finish_upload(
        &self,
        blob_id: &str,
        digest: &Digest,
        size: u64,
        media_type: Option<&str>,
    ) -> Result<RegistryBlob, RegistryError>;

    /// Drop a row.
    async fn forget_blob(&self, blob_id: &str) -> Result<Option<RegistryBlob>, RegistryError>;
}

#[derive(Debug, Default)]
struct BlobRows {
    by_id: HashMap<String, RegistryBlob>,
    by_digest: HashMap<Digest, String>,
}

/// In-process blob table.
#[derive(Debug, Default)]
pub struct MemoryBlobs {
    rows: RwLock<BlobRows>,
}

impl MemoryBlobs {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobTable for MemoryBlobs {
    async fn new_blob(&self, uploaded_by: &str) -> Result<RegistryBlob, RegistryError> {
        let blob = RegistryBlob {
            blob_id: uuid::Uuid::new_v4().to_string(),
            digest: None,
            media_type: None,
            size: 0,
            parts: Vec::new(),
            uploaded_by: uploaded_by.to_owned(),
            upload_started: Utc::now(),
        };
        let mut rows = self.rows.write().await;
        rows.by_id.insert(blob.blob_id.clone(), blob.clone());
        Ok(blob)
    }

    async fn get_blob(&self, blob_id: &str) -> Result<Option<RegistryBlob>, RegistryError> {
        Ok(self.rows.read().await.by_id.get(blob_id).cloned())
    }

    async fn get_blob_by_digest(
        &self,
        digest: &Digest,
    ) -> Result<Option<RegistryBlob>, RegistryError> {
        let rows = self.rows.read().await;
        Ok(rows
            .by_digest
            .get(digest)
            .and_then(|blob_id| rows.by_id.get(blob_id))
            .cloned())
    }

    async fn add_part(
        &self,
        blob_id: &str,
        part: RegistryBlobPart,
    ) -> Result<RegistryBlob, RegistryError> {
        let mut rows = self.rows.write().await;
        let blob = rows
            .by_id
            .get_mut(blob_id)
            .filter(|blob| !blob.is_complete())
            .ok_or_else(|| RegistryError::BlobUploadUnknown(blob_id.to_owned()))?;
        blob.parts.push(part);
        blob.size = blob.received();
        Ok(blob.clone())
    }

    async fn finish_upload(
        &self,
        blob_id: &str,
        digest: &Digest,
        size: u64,
        media_type: Option<&str>,
    ) -> Result<RegistryBlob, RegistryError> {
        let mut rows = self.rows.write().await;

        if let Some(existing) = rows.by_digest.get(digest).cloned() {
            if existing != blob_id {
                rows.by_id.remove(blob_id);
                return rows
                    .by_id
                    .get(&existing)
                    .cloned()
                    .ok_or_else(|| RegistryError::BlobUploadUnknown(existing));
            }
        }

        let blob = rows
            .by_id
            .get_mut(blob_id)
            .ok_or_else(|| RegistryError::BlobUploadUnknown(blob_id.to_owned()))?;
        blob.digest = Some(digest.clone());
        blob.size = size;
        blob.media_type = media_type.map(str::to_owned).or(blob.media_type.take());
        let blob = blob.clone();
        rows.by_digest.insert(digest.clone(), blob_id.to_owned());
        Ok(blob)
    }

    async fn forget_blob(&self, blob_id: &str) -> Result<Option<RegistryBlob>, RegistryError> {
        let mut rows = self.rows.write().await;
        let removed = rows.by_id.remove(blob_id);
        if let Some(digest) = removed.as_ref().and_then(|blob| blob.digest.as_ref()) {
            if rows.by_digest.get(digest).map(String::as_str) == Some(blob_id) {
                rows.by_digest.remove(digest);
            }
        }
        Ok(removed)
    }
}
