use std::collections::{HashMap, HashSet};
use std::time::Duration;

use api_client::paginate::{LinkPagination, PaginationInfo as _};
use api_client::response::{ResponseBodyExt as _, ResponseExt as _};
use api_client::{
    ApiClient, Authentication, BasicAuth, BearerAuth, RequestBuilder, Response, Transport,
};
use async_trait::async_trait;
use http::{StatusCode, header};
use http_body_util::BodyExt as _;
use secret::Secret;
use serde::Deserialize;
use storage_driver::{Reader, Writer};
use tokio::io::AsyncWriteExt as _;

use super::{BlobMeta, BlobUpload, Registry};
use crate::credentials::RegistryCred;
use crate::digest::{Digest, DigestReader, Reference};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{ACCEPTED_MANIFEST_TYPES, ImageManifest};
use crate::repo::{ContainerRepo, RegistryProvider};

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);
const PIPE_CAPACITY: usize = 64 * 1024;

/// How requests to a remote registry are authorized.
#[derive(Debug, Clone, Default)]
pub enum RegistryAuth {
    /// No credentials.
    #[default]
    Anonymous,
    /// Username and password.
    Basic(BasicAuth),
    /// A token from the registry's token service.
    Bearer(BearerAuth),
    /// A complete `Authorization` header value.
    Header(Secret),
}

impl Authentication for RegistryAuth {
    fn authenticate<B>(&self, mut req: http::Request<B>) -> http::Request<B> {
        match self {
            RegistryAuth::Anonymous => req,
            RegistryAuth::Basic(auth) => auth.authenticate(req),
            RegistryAuth::Bearer(auth) => auth.authenticate(req),
            RegistryAuth::Header(value) => {
                match value.to_header() {
                    Ok(value) => {
                        req.headers_mut().insert(header::AUTHORIZATION, value);
                    }
                    Err(_) => tracing::warn!("authorization is not a valid header value"),
                }
                req
            }
        }
    }
}

/// A registry reached over the distribution HTTP API.
#[derive(Debug, Clone)]
pub struct RemoteRegistry {
    provider: RegistryProvider,
    client: ApiClient<RegistryAuth>,
    anonymous: ApiClient<()>,
    remote_name: fn(&str) -> String,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
    /// Google's registry lists every manifest with its tags.
    #[serde(default)]
    manifest: HashMap<String, TaggedManifest>,
}

#[derive(Debug, Deserialize)]
struct TaggedManifest {
    #[serde(default)]
    tag: Vec<String>,
}

fn protocol_error(response: &Response, problem: &str) -> RegistryError {
    RegistryError::InvalidRepository(format!(
        "{problem}: {} from {}",
        response.status(),
        response.uri()
    ))
}

async fn check(response: Response, context: &str) -> RegistryResult<Response> {
    match response.error_for_status().await {
        Ok(response) => Ok(response),
        Err(error) => {
            tracing::debug!(status = %error.status, "{context} failed");
            Err(api_client::Error::from(error).into())
        }
    }
}

fn content_digest(response: &Response) -> Option<Digest> {
    response.header_str(DOCKER_CONTENT_DIGEST)?.parse().ok()
}

impl RemoteRegistry {
    /// An adapter for the registry rooted at `base` (the `/v2/` URL).
    pub fn new(
        provider: RegistryProvider,
        transport: &Transport,
        base: http::Uri,
        auth: RegistryAuth,
    ) -> Self {
        Self {
            provider,
            client: ApiClient::new_with_inner_service(base.clone(), auth, transport.clone()),
            anonymous: ApiClient::new_with_inner_service(base, (), transport.clone()),
            remote_name: str::to_owned,
        }
    }

    /// Rewrite repository names before they are used in request paths.
    pub fn with_name_mapper(mut self, remote_name: fn(&str) -> String) -> Self {
        self.remote_name = remote_name;
        self
    }

    /// The API root requests are resolved against.
    pub fn base(&self) -> http::Uri {
        self.client.base()
    }

    fn manifest_request(
        &self,
        method: http::Method,
        name: &str,
        reference: &str,
    ) -> RequestBuilder<RegistryAuth> {
        let name = (self.remote_name)(name);
        self.client
            .request(method, &format!("{name}/manifests/{reference}"))
            .header(header::ACCEPT, ACCEPTED_MANIFEST_TYPES.join(", "))
            .timeout(MANIFEST_TIMEOUT)
    }

    async fn head_manifest(&self, name: &str, tag: &str) -> RegistryResult<Option<Digest>> {
        let response = self
            .manifest_request(http::Method::HEAD, name, tag)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, "manifest head").await?;
        Ok(content_digest(&response))
    }
}

#[async_trait]
impl Registry for RemoteRegistry {
    fn provider(&self) -> RegistryProvider {
        self.provider
    }

    #[tracing::instrument(skip(self, repo), fields(repo = %repo.name, %reference))]
    async fn get_manifest(
        &self,
        repo: &ContainerRepo,
        reference: &Reference,
    ) -> RegistryResult<Option<ImageManifest>> {
        let response = self
            .manifest_request(http::Method::GET, &repo.name, reference.as_str())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, "manifest fetch").await?;
        let media_type = response
            .header_str(header::CONTENT_TYPE)
            .map(str::to_owned);
        let body = response.bytes().await.map_err(api_client::Error::ResponseBody)?;

        let manifest = match media_type {
            Some(media_type) => ImageManifest::new(media_type, body),
            None => ImageManifest::from_push(None, body)?,
        };
        if let Reference::Digest(expected) = reference {
            if &manifest.digest != expected {
                return Err(RegistryError::DigestMismatch {
                    computed: manifest.digest,
                    declared: expected.clone(),
                });
            }
        }
        Ok(Some(manifest))
    }

    #[tracing::instrument(skip(self, repo, writer), fields(repo = %repo.name))]
    async fn get_blob(
        &self,
        repo: &ContainerRepo,
        digest: &Digest,
        writer: &mut Writer<'_>,
    ) -> RegistryResult<()> {
        let mut response = self
            .client
            .get(&format!("{}/blobs/{digest}", (self.remote_name)(&repo.name)))
            .send()
            .await?;

        // Blob storage is usually behind a redirect to a signed URL which must
        // not see the registry credentials.
        if response.status().is_redirection() {
            let location = response
                .header_str(header::LOCATION)
                .map(str::to_owned)
                .ok_or_else(|| protocol_error(&response, "blob redirect without location"))?;
            tracing::trace!(%location, "Following blob redirect");
            response = self.anonymous.get(&location).send().await?;
        }

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::BlobNotFound(digest.clone()));
        }
        let response = check(response, "blob fetch").await?;

        let (_, _, mut body) = response.into_parts();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|error| RegistryError::Io(std::io::Error::other(error)))?;
            if let Ok(data) = frame.into_data() {
                writer.write_all(&data).await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, repo), fields(repo = %repo.name))]
    async fn create_blob_upload(
        &self,
        repo: &ContainerRepo,
        digest: &Digest,
        from_repo: Option<&str>,
    ) -> RegistryResult<BlobUpload> {
        let existing = self
            .client
            .head(&format!("{}/blobs/{digest}", (self.remote_name)(&repo.name)))
            .send()
            .await?;
        if existing.status().is_success() {
            let media_type = existing.header_str(header::CONTENT_TYPE).map(str::to_owned);
            return Ok(BlobUpload::completed(repo, digest, media_type));
        }

        let name = (self.remote_name)(&repo.name);
        let mut request = self.client.post(&format!("{name}/blobs/uploads/"));
        if let Some(from) = from_repo {
            let from = (self.remote_name)(from);
            request = request.query(&[("mount", digest.as_str()), ("from", from.as_str())]);
        }
        let response = check(request.send().await?, "upload start").await?;

        if response.status() == StatusCode::CREATED {
            tracing::debug!(%digest, from = from_repo, "Blob mounted");
            return Ok(BlobUpload::completed(repo, digest, None));
        }

        let location = response
            .header_str(header::LOCATION)
            .map(str::to_owned)
            .ok_or_else(|| protocol_error(&response, "upload without location"))?;
        Ok(BlobUpload {
            location: Some(location),
            ..BlobUpload::pending(repo, digest)
        })
    }

    #[tracing::instrument(skip(self, upload, reader), fields(name = %upload.name))]
    async fn blob_upload_chunk(
        &self,
        upload: &mut BlobUpload,
        reader: &mut Reader<'_>,
        length: Option<u64>,
        digest: &Digest,
    ) -> RegistryResult<BlobMeta> {
        let location = upload
            .location
            .clone()
            .ok_or_else(|| RegistryError::BlobUploadUnknown(upload.digest.to_string()))?;

        let (pipe, body) = tokio::io::duplex(PIPE_CAPACITY);
        let mut request = self
            .client
            .put(&location)
            .query(&[("digest", digest.as_str())])
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body_reader(body);
        if let Some(length) = length {
            request = request.header(header::CONTENT_LENGTH, length);
        }

        let feed = async move {
            let mut pipe = pipe;
            let mut hashed = DigestReader::new(reader);
            let copied = tokio::io::copy(&mut hashed, &mut pipe).await;
            // Closing the pipe ends the request body.
            drop(pipe);
            copied.map(|_| (hashed.digest(), hashed.length()))
        };
        let (response, fed) = tokio::join!(request.send(), feed);

        let (computed, size) = fed?;
        if &computed != digest {
            return Err(RegistryError::DigestMismatch {
                computed,
                declared: digest.clone(),
            });
        }
        check(response?, "upload finish").await?;
        upload.complete = true;

        Ok(BlobMeta {
            digest: digest.clone(),
            size,
            media_type: upload.media_type.clone(),
        })
    }

    #[tracing::instrument(skip(self, repo, manifest), fields(repo = %repo.name, %reference))]
    async fn put_manifest(
        &self,
        repo: &ContainerRepo,
        reference: &Reference,
        manifest: &ImageManifest,
    ) -> RegistryResult<Digest> {
        let response = self
            .client
            .put(&format!(
                "{}/manifests/{reference}",
                (self.remote_name)(&repo.name)
            ))
            .header(header::CONTENT_TYPE, manifest.media_type.as_str())
            .body(manifest.body.clone())
            .send()
            .await?;
        let response = check(response, "manifest push").await?;
        Ok(content_digest(&response).unwrap_or_else(|| manifest.digest.clone()))
    }

    #[tracing::instrument(skip(self, repo), fields(repo = %repo.name))]
    async fn list_tags(&self, repo: &ContainerRepo) -> RegistryResult<Vec<(String, Digest)>> {
        let mut tagged: Vec<(String, Digest)> = Vec::new();
        let mut untagged: Vec<String> = Vec::new();
        let mut endpoint = format!("{}/tags/list", (self.remote_name)(&repo.name));

        loop {
            let response = check(self.client.get(&endpoint).send().await?, "tag list").await?;
            let next = LinkPagination::from_headers(response.headers())
                .next()
                .map(str::to_owned);
            let page: TagList = response.checked_json().await?;

            let mut known = HashSet::new();
            for (digest, entry) in page.manifest {
                let Ok(digest) = digest.parse::<Digest>() else {
                    continue;
                };
                for tag in entry.tag {
                    known.insert(tag.clone());
                    tagged.push((tag, digest.clone()));
                }
            }
            untagged.extend(
                page.tags
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|tag| !known.contains(tag)),
            );

            match next {
                Some(next) => endpoint = next,
                None => break,
            }
        }

        for tag in untagged {
            match self.head_manifest(&repo.name, &tag).await? {
                Some(digest) => tagged.push((tag, digest)),
                None => tracing::debug!(%tag, "Tag has no resolvable digest"),
            }
        }
        tagged.sort();
        tagged.dedup();
        Ok(tagged)
    }
}

/// Parse a registry root, adding `https://` when no scheme is given and the
/// `/v2/` API path.
pub(super) fn api_root(endpoint: &str) -> RegistryResult<http::Uri> {
    let endpoint = endpoint.trim_end_matches('/');
    let endpoint = if endpoint.contains("://") {
        endpoint.to_owned()
    } else {
        format!("https://{endpoint}")
    };
    let root = if endpoint.ends_with("/v2") {
        format!("{endpoint}/")
    } else {
        format!("{endpoint}/v2/")
    };
    root.parse()
        .map_err(|_| RegistryError::InvalidRepository(format!("invalid registry endpoint {root}")))
}

/// A `PRIVATE` registry: the repository (or credential) endpoint with optional
/// basic auth.
pub(super) fn open_private(
    transport: &Transport,
    repo: &ContainerRepo,
    cred: Option<&RegistryCred>,
) -> RegistryResult<RemoteRegistry> {
    let endpoint = repo
        .endpoint
        .as_deref()
        .or_else(|| cred.and_then(|cred| cred.endpoint.as_deref()))
        .ok_or(RegistryError::MissingParam("endpoint"))?;

    let auth = match cred {
        Some(RegistryCred {
            username: Some(username),
            secret,
            ..
        }) => RegistryAuth::Basic(BasicAuth::new(username.clone(), secret.clone())),
        _ => RegistryAuth::Anonymous,
    };

    Ok(RemoteRegistry::new(
        RegistryProvider::Private,
        transport,
        api_root(endpoint)?,
        auth,
    ))
}
