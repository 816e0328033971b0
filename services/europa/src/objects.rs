//! Content-addressed object layout on top of a storage bucket.

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use storage::{Metadata, StorageBucket, StorageError, StorageErrorKind};
use storage_driver::{Reader, Writer};

use crate::digest::Digest;

/// Object keys for manifests, blobs and upload chunks.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    bucket: StorageBucket,
}

fn absent<T>(result: Result<T, StorageError>) -> Result<Option<T>, StorageError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) if error.kind() == StorageErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

impl ObjectStore {
    /// Lay objects out in `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    /// `manifests/sha256/<hex>`
    pub fn manifest_key(digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("manifests/sha256/{}", digest.hex()))
    }

    /// `blobs/<blob id>`
    pub fn blob_key(blob_id: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("blobs/{blob_id}"))
    }

    /// `uploads/<blob id>/<part>`
    pub fn part_key(blob_id: &str, part_num: u32) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("uploads/{blob_id}/{part_num}"))
    }

    /// Object metadata, `None` when missing.
    pub async fn head(&self, key: &Utf8Path) -> Result<Option<Metadata>, StorageError> {
        self.bucket.head(key).await
    }

    /// Store a manifest body unless one with the same digest is already stored.
    ///
    /// Returns whether a new object was written.
    #[tracing::instrument(skip(self, body), fields(%digest))]
    pub async fn put_manifest(&self, digest: &Digest, body: &[u8]) -> Result<bool, StorageError> {
        let key = Self::manifest_key(digest);
        if self.bucket.head(&key).await?.is_some() {
            return Ok(false);
        }
        self.bucket.put_bytes(&key, body).await?;
        Ok(true)
    }

    /// A stored manifest body, `None` when missing.
    pub async fn get_manifest(&self, digest: &Digest) -> Result<Option<Bytes>, StorageError> {
        Ok(absent(self.bucket.get_bytes(&Self::manifest_key(digest)).await)?.map(Bytes::from))
    }

    /// Stream an object in.
    pub async fn upload(&self, key: &Utf8Path, reader: &mut Reader<'_>) -> Result<(), StorageError> {
        let mut reader = reader;
        self.bucket.upload(key, &mut reader).await
    }

    /// Stream an object out.
    pub async fn download(
        &self,
        key: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let mut writer = writer;
        self.bucket.download(key, &mut writer).await
    }

    /// A whole object, `None` when missing.
    pub async fn get(&self, key: &Utf8Path) -> Result<Option<Vec<u8>>, StorageError> {
        absent(self.bucket.get_bytes(key).await)
    }

    /// Write a whole object.
    pub async fn put(&self, key: &Utf8Path, data: &[u8]) -> Result<(), StorageError> {
        self.bucket.put_bytes(key, data).await
    }

    /// Delete an object; deleting a missing object succeeds.
    pub async fn delete(&self, key: &Utf8Path) -> Result<(), StorageError> {
        self.bucket.delete(key).await
    }
}
