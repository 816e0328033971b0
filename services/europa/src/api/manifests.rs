//! Manifest operations for the registry

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;

use super::{DOCKER_CONTENT_DIGEST, RegistryState};
use crate::adapter::Registry;
use crate::digest::Reference;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{ImageManifest, PageIterator};
use crate::push::{ManifestPush, push_manifest};

const ROW_PAGE_SIZE: usize = 1000;

/// Router for manifest operations
pub(super) fn router() -> Router<RegistryState> {
    Router::new().route(
        "/v2/{name}/manifests/{reference}",
        get(get_manifest)
            .head(head_manifest)
            .put(put_manifest)
            .delete(delete_manifest),
    )
}

async fn load(
    state: &RegistryState,
    name: &str,
    reference: &str,
) -> RegistryResult<ImageManifest> {
    let repo = state.repo(name).await?;
    let reference: Reference = reference.parse()?;
    state
        .ctx
        .local_registry()
        .get_manifest(&repo, &reference)
        .await?
        .ok_or_else(|| RegistryError::ManifestNotFound {
            reference: reference.to_string(),
            repository: repo.name.clone(),
        })
}

/// Get a manifest
async fn get_manifest(
    State(state): State<RegistryState>,
    Path((name, reference)): Path<(String, String)>,
) -> RegistryResult<Response> {
    let manifest = load(&state, &name, &reference).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, manifest.media_type),
            (DOCKER_CONTENT_DIGEST, manifest.digest.to_string()),
        ],
        manifest.body,
    )
        .into_response())
}

/// Check if a manifest exists
async fn head_manifest(
    State(state): State<RegistryState>,
    Path((name, reference)): Path<(String, String)>,
) -> RegistryResult<Response> {
    let manifest = load(&state, &name, &reference).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, manifest.media_type),
            (DOCKER_CONTENT_DIGEST, manifest.digest.to_string()),
            (header::CONTENT_LENGTH, manifest.body.len().to_string()),
        ],
    )
        .into_response())
}

/// Put a manifest
async fn put_manifest(
    State(state): State<RegistryState>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let outcome = push_manifest(
        &state.ctx,
        ManifestPush {
            domain: &state.domain,
            name: &name,
            reference: &reference,
            content_type,
            body,
            uploaded_by: &state.domain,
        },
    )
    .await?;

    let location = format!("/v2/{}/manifests/{}", name, outcome.digest);

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (DOCKER_CONTENT_DIGEST, outcome.digest.to_string()),
        ],
    )
        .into_response())
}

/// Delete a manifest
///
/// A tag removes that tag; a digest removes every row pointing at it.
async fn delete_manifest(
    State(state): State<RegistryState>,
    Path((name, reference)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    let repo = state.repo(&name).await?;
    let reference: Reference = reference.parse()?;
    let not_found = || RegistryError::ManifestNotFound {
        reference: reference.to_string(),
        repository: repo.name.clone(),
    };
    let manifests = &state.ctx.manifests;

    let Some(digest) = reference.digest() else {
        return match manifests
            .remove(&repo.domain, &repo.id, reference.as_str())
            .await?
        {
            Some(_) => Ok(StatusCode::ACCEPTED),
            None => Err(not_found()),
        };
    };

    let mut tags = Vec::new();
    let mut page = PageIterator::first(ROW_PAGE_SIZE);
    loop {
        let rows = manifests.list_manifests(&repo.domain, &repo.id, &page).await?;
        tags.extend(
            rows.items
                .into_iter()
                .filter(|row| &row.manifest_id == digest)
                .map(|row| row.tag),
        );
        match rows.next {
            Some(next) => page.marker = Some(next),
            None => break,
        }
    }
    if tags.is_empty() {
        return Err(not_found());
    }

    for tag in &tags {
        manifests.remove(&repo.domain, &repo.id, tag).await?;
    }
    tracing::debug!(%digest, rows = tags.len(), "Deleted manifest");
    Ok(StatusCode::ACCEPTED)
}
