//! Distribution API server builder and router

use std::fmt;

use axum::Router;
use axum::http::header::HeaderName;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;

use crate::context::RegistryContext;
use crate::error::{RegistryError, RegistryResult};
use crate::objects::ObjectStore;
use crate::repo::{ContainerRepo, is_valid_local_name};

mod blobs;
mod catalog;
mod manifests;
mod uploads;

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
const API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");

const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 1000;

/// Shared state of every handler.
#[derive(Debug, Clone)]
pub struct RegistryState {
    /// Stores and adapters.
    pub ctx: RegistryContext,
    /// Tenant served by this router.
    pub domain: String,
}

impl RegistryState {
    /// The local repository called `name`.
    pub(crate) async fn repo(&self, name: &str) -> RegistryResult<ContainerRepo> {
        validate_repository(name)?;
        self.ctx
            .repos
            .get_local_repo(&self.domain, name)
            .await?
            .ok_or_else(|| RegistryError::repo_name_not_found(&self.domain, name))
    }
}

/// Registry builder for configuring and creating the registry service
#[derive(Default)]
pub struct RegistryBuilder {
    storage: Option<storage::Storage>,
    bucket: Option<String>,
    transport: Option<api_client::Transport>,
    context: Option<RegistryContext>,
    domain: Option<String>,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("storage", &self.storage)
            .field("bucket", &self.bucket)
            .field("context", &self.context)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the transport used to reach other registries
    pub fn transport(mut self, transport: api_client::Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Serve an existing context instead of building one from storage
    pub fn context(mut self, ctx: RegistryContext) -> Self {
        self.context = Some(ctx);
        self
    }

    /// Set the tenant served by this router
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Build the context the router will serve
    pub fn build_context(&mut self) -> RegistryResult<RegistryContext> {
        if let Some(ctx) = &self.context {
            return Ok(ctx.clone());
        }

        let storage = self
            .storage
            .take()
            .ok_or(RegistryError::MissingParam("storage"))?;
        let bucket = self.bucket.take().unwrap_or_else(|| "registry".to_string());
        let transport = self
            .transport
            .take()
            .unwrap_or_else(api_client::default_transport);

        let ctx = RegistryContext::new(ObjectStore::new(storage.bucket(bucket)), transport);
        self.context = Some(ctx.clone());
        Ok(ctx)
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(mut self) -> RegistryResult<Router> {
        let ctx = self.build_context()?;
        let domain = self
            .domain
            .unwrap_or_else(|| "default".to_string())
            .to_ascii_lowercase();

        Ok(Router::new()
            .route("/v2/", get(api_version_check))
            .merge(blobs::router())
            .merge(uploads::router())
            .merge(manifests::router())
            .merge(catalog::router())
            .with_state(RegistryState { ctx, domain }))
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> Response {
    (
        StatusCode::OK,
        [(API_VERSION, "registry/2.0")],
        Json(json!({})),
    )
        .into_response()
}

/// `n` and `last` query parameters of the listing endpoints
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Pagination {
    n: Option<usize>,
    last: Option<String>,
}

impl Pagination {
    fn page_size(&self) -> usize {
        self.n
            .filter(|n| *n > 0)
            .map_or(DEFAULT_PAGE_SIZE, |n| n.min(MAX_PAGE_SIZE))
    }

    /// `Link` header pointing at the page after `last`
    fn next_link(&self, path: &str, last: &str) -> RegistryResult<HeaderValue> {
        let mut link = format!("<{path}?last={last}");
        if let Some(n) = self.n {
            link.push_str(&format!("&n={n}"));
        }
        link.push_str(">; rel=\"next\"");
        HeaderValue::from_str(&link).map_err(|_| RegistryError::InvalidReference(last.to_owned()))
    }
}

/// Validate repository name
fn validate_repository(name: &str) -> RegistryResult<()> {
    if !is_valid_local_name(name) {
        return Err(RegistryError::InvalidRepositoryName(name.to_string()));
    }
    Ok(())
}
