//! Manifest documents and the manifest table.
//!
//! Every push writes two rows: one keyed by the pushed tag and one keyed by the
//! digest itself, so a pull by digest works no matter how tags move.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::digest::Digest;
use crate::error::RegistryError;

/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker image manifest, schema 1.
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media types requested when pulling from another registry.
pub const ACCEPTED_MANIFEST_TYPES: [&str; 4] =
    [DOCKER_MANIFEST_V2, DOCKER_MANIFEST_LIST, OCI_MANIFEST, OCI_INDEX];

/// Page size used when walking every row of a repository.
pub const MULTI_TAGGED_PAGE_SIZE: usize = 1000;

/// A manifest body together with its media type and digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifest {
    /// Media type the manifest was pushed with.
    pub media_type: String,
    /// The exact bytes, which hash to `digest`.
    pub body: Bytes,
    /// SHA-256 of `body`.
    pub digest: Digest,
}

impl ImageManifest {
    /// Wrap a manifest body, computing its digest.
    pub fn new(media_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            media_type: media_type.into(),
            digest: Digest::of(&body),
            body,
        }
    }

    /// Wrap a manifest body, taking the media type from the request header,
    /// then the document's `mediaType`, then the schema 1 default.
    pub fn from_push(content_type: Option<&str>, body: Bytes) -> Result<Self, RegistryError> {
        let document = Self::parse(&body)?;
        let media_type = content_type
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .or_else(|| {
                document
                    .pointer("/mediaType")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| DOCKER_MANIFEST_V1.to_owned());
        Ok(Self::new(media_type, body))
    }

    fn parse(body: &[u8]) -> Result<Value, RegistryError> {
        serde_json::from_slice(body).map_err(|err| RegistryError::InvalidManifest(err.to_string()))
    }

    /// Blobs referenced by the manifest, with the media type each descriptor declares.
    ///
    /// Schema 2 and OCI manifests contribute their config and layer digests; schema 1
    /// manifests contribute their `fsLayers` sums. Lists and indexes reference other
    /// manifests, not blobs, so they contribute nothing.
    pub fn blob_references(&self) -> Result<BTreeMap<Digest, Option<String>>, RegistryError> {
        let document = Self::parse(&self.body)?;
        let mut references: BTreeMap<Digest, Option<String>> = BTreeMap::new();

        let mut add = |descriptor: &Value, field: &str| -> Result<(), RegistryError> {
            let Some(digest) = descriptor.get(field).and_then(Value::as_str) else {
                return Err(RegistryError::InvalidManifest(format!(
                    "descriptor without {field}"
                )));
            };
            let media_type = descriptor
                .get("mediaType")
                .and_then(Value::as_str)
                .map(str::to_owned);
            references.insert(digest.parse()?, media_type);
            Ok(())
        };

        if let Some(layers) = document.pointer("/layers").and_then(Value::as_array) {
            if let Some(config) = document.pointer("/config") {
                add(config, "digest")?;
            }
            for layer in layers {
                add(layer, "digest")?;
            }
        } else if let Some(layers) = document.pointer("/fsLayers").and_then(Value::as_array) {
            for layer in layers {
                add(layer, "blobSum")?;
            }
        }

        Ok(references)
    }

    /// The referenced blob digests.
    pub fn digests(&self) -> Result<BTreeSet<Digest>, RegistryError> {
        Ok(self.blob_references()?.into_keys().collect())
    }

    /// Sum of the declared layer sizes, for schema 2 and OCI manifests.
    pub fn virtual_size(&self) -> Option<u64> {
        let document = Self::parse(&self.body).ok()?;
        document
            .pointer("/layers")?
            .as_array()?
            .iter()
            .map(|layer| layer.get("size").and_then(Value::as_u64))
            .sum()
    }
}

/// A manifest table row: a tag (or digest alias) pointing at a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryManifest {
    /// Tenant.
    pub domain: String,
    /// Owning repository id.
    pub container_repo_id: String,
    /// Tag, or the digest itself for the alias row.
    pub tag: String,
    /// Digest of the manifest body.
    pub manifest_id: Digest,
    /// Media type of the manifest body.
    pub content_type: String,
    /// Blobs referenced by the manifest.
    #[serde(default)]
    pub digests: BTreeSet<Digest>,
    /// When the row was written.
    pub push_time: DateTime<Utc>,
    /// Who wrote the row.
    pub uploaded_by: String,
    /// Sum of layer sizes, when known.
    #[serde(default)]
    pub virtual_size: Option<u64>,
}

impl RegistryManifest {
    /// Whether this is the digest-alias row.
    pub fn is_digest_alias(&self) -> bool {
        Digest::is_digest(&self.tag)
    }

    /// A row pointing `tag` in a repository at `manifest`.
    pub fn for_image(
        domain: &str,
        container_repo_id: &str,
        tag: &str,
        manifest: &ImageManifest,
        uploaded_by: &str,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            domain: domain.to_owned(),
            container_repo_id: container_repo_id.to_owned(),
            tag: tag.to_owned(),
            manifest_id: manifest.digest.clone(),
            content_type: manifest.media_type.clone(),
            digests: manifest.digests()?,
            push_time: Utc::now(),
            uploaded_by: uploaded_by.to_owned(),
            virtual_size: manifest.virtual_size(),
        })
    }

    /// The digest-alias row for this row.
    pub fn alias(&self) -> Self {
        Self {
            tag: self.manifest_id.to_string(),
            ..self.clone()
        }
    }

    /// A copy of this row under another repository and tag.
    pub fn retarget(&self, domain: &str, container_repo_id: &str, tag: &str) -> Self {
        Self {
            domain: domain.to_owned(),
            container_repo_id: container_repo_id.to_owned(),
            tag: tag.to_owned(),
            push_time: Utc::now(),
            ..self.clone()
        }
    }
}

/// Position within a paged listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageIterator {
    /// Maximum number of items per page.
    pub page_size: usize,
    /// Listing resumes after this key.
    pub marker: Option<String>,
}

impl PageIterator {
    /// The first page.
    pub fn first(page_size: usize) -> Self {
        Self {
            page_size,
            marker: None,
        }
    }

    /// The page after `marker`.
    pub fn after(page_size: usize, marker: Option<String>) -> Self {
        Self { page_size, marker }
    }
}

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items in key order.
    pub items: Vec<T>,
    /// Marker for the next page, if there is one.
    pub next: Option<String>,
}

/// Persistence contract for manifest rows.
#[async_trait]
pub trait ManifestTable: fmt::Debug + Send + Sync {
    /// Look up a row by tag (or digest alias).
    async fn get_manifest(
        &self,
        domain: &str,
        repo_id: &str,
        tag: &str,
    ) -> Result<Option<RegistryManifest>, RegistryError>;

    /// Write a row, replacing any row with the same key. Returns the replaced row.
    async fn put(
        &self,
        manifest: RegistryManifest,
    ) -> Result<Option<RegistryManifest>, RegistryError>;

    /// Delete a row. Returns the deleted row.
    async fn remove(
        &self,
        domain: &str,
        repo_id: &str,
        tag: &str,
    ) -> Result<Option<RegistryManifest>, RegistryError>;

    /// Rows of a repository in tag order.
    async fn list_manifests(
        &self,
        domain: &str,
        repo_id: &str,
        page: &PageIterator,
    ) -> Result<Page<RegistryManifest>, RegistryError>;

    /// Every tagged manifest of a repository, grouped by digest.
    ///
    /// Digest-alias rows are skipped.
    async fn list_multi_tagged(
        &self,
        domain: &str,
        repo_id: &str,
    ) -> Result<BTreeMap<Digest, Vec<String>>, RegistryError> {
        let mut images: BTreeMap<Digest, Vec<String>> = BTreeMap::new();
        let mut page = PageIterator::first(MULTI_TAGGED_PAGE_SIZE);
        loop {
            let rows = self.list_manifests(domain, repo_id, &page).await?;
            for row in rows.items.into_iter().filter(|row| !row.is_digest_alias()) {
                images.entry(row.manifest_id).or_default().push(row.tag);
            }
            match rows.next {
                Some(next) => page.marker = Some(next),
                None => break,
            }
        }
        Ok(images)
    }

    /// One page of tag names, skipping digest-alias rows.
    ///
    /// Returns the tags and whether more remain after them.
    async fn list_tags(
        &self,
        domain: &str,
        repo_id: &str,
        page: &PageIterator,
    ) -> Result<(Vec<String>, bool), RegistryError> {
        let mut tags = Vec::new();
        let mut cursor =
            PageIterator::after(page.page_size.max(1).saturating_add(1), page.marker.clone());
        loop {
            let rows = self.list_manifests(domain, repo_id, &cursor).await?;
            tags.extend(
                rows.items
                    .into_iter()
                    .filter(|row| !row.is_digest_alias())
                    .map(|row| row.tag),
            );
            if tags.len() > page.page_size {
                tags.truncate(page.page_size);
                return Ok((tags, true));
            }
            match rows.next {
                Some(next) => cursor.marker = Some(next),
                None => return Ok((tags, false)),
            }
        }
    }
}

type ManifestKey = (String, String, String);

/// In-process manifest table.
#[derive(Debug, Default)]
pub struct MemoryManifests {
    rows: RwLock<BTreeMap<ManifestKey, RegistryManifest>>,
}

impl MemoryManifests {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(domain: &str, repo_id: &str, tag: &str) -> ManifestKey {
        (
            domain.to_ascii_lowercase(),
            repo_id.to_ascii_lowercase(),
            tag.to_owned(),
        )
    }
}

#[async_trait]
impl ManifestTable for MemoryManifests {
    async fn get_manifest(
        &self,
        domain: &str,
        repo_id: &str,
        tag: &str,
    ) -> Result<Option<RegistryManifest>, RegistryError> {
        let rows = self.rows.read().await;
        Ok(rows.get(&Self::key(domain, repo_id, tag)).cloned())
    }

    async fn put(
        &self,
        manifest: RegistryManifest,
    ) -> Result<Option<RegistryManifest>, RegistryError> {
        let key = Self::key(&manifest.domain, &manifest.container_repo_id, &manifest.tag);
        let mut rows = self.rows.write().await;
        Ok(rows.insert(key, manifest))
    }

    async fn remove(
        &self,
        domain: &str,
        repo_id: &str,
        tag: &str,
    ) -> Result<Option<RegistryManifest>, RegistryError> {
        let mut rows = self.rows.write().await;
        Ok(rows.remove(&Self::key(domain, repo_id, tag)))
    }

    async fn list_manifests(
        &self,
        domain: &str,
        repo_id: &str,
        page: &PageIterator,
    ) -> Result<Page<RegistryManifest>, RegistryError> {
        let rows = self.rows.read().await;
        let (domain, repo_id, _) = Self::key(domain, repo_id, "");

        let mut items: Vec<RegistryManifest> = rows
            .iter()
            .filter(|((d, r, tag), _)| {
                *d == domain
                    && *r == repo_id
                    && page.marker.as_deref().is_none_or(|marker| tag.as_str() > marker)
            })
            .map(|(_, row)| row.clone())
            .take(page.page_size.saturating_add(1))
            .collect();

        let next = if items.len() > page.page_size {
            items.truncate(page.page_size);
            items.last().map(|row| row.tag.clone())
        } else {
            None
        };

        Ok(Page { items, next })
    }
}
