//! Blob operations for the registry

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use super::{DOCKER_CONTENT_DIGEST, RegistryState, validate_repository};
use crate::blob::RegistryBlob;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::objects::ObjectStore;

const OCTET_STREAM: &str = "application/octet-stream";

/// Router for blob operations
pub(super) fn router() -> Router<RegistryState> {
    Router::new().route(
        "/v2/{name}/blobs/{digest}",
        get(get_blob).head(head_blob).delete(delete_blob),
    )
}

async fn find(
    state: &RegistryState,
    name: &str,
    digest: &str,
) -> RegistryResult<(Digest, RegistryBlob)> {
    validate_repository(name)?;
    let digest: Digest = digest.parse()?;
    match state.ctx.blobs.get_blob_by_digest(&digest).await? {
        Some(blob) => Ok((digest, blob)),
        None => Err(RegistryError::BlobNotFound(digest)),
    }
}

/// Get a blob
async fn get_blob(
    State(state): State<RegistryState>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<Response> {
    let (digest, blob) = find(&state, &name, &digest).await?;
    let Some(data) = state
        .ctx
        .objects
        .get(&ObjectStore::blob_key(&blob.blob_id))
        .await?
    else {
        tracing::warn!(%digest, blob_id = %blob.blob_id, "Blob row without a stored object");
        return Err(RegistryError::BlobNotFound(digest));
    };

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                blob.media_type.unwrap_or_else(|| OCTET_STREAM.to_string()),
            ),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        data,
    )
        .into_response())
}

/// Check if a blob exists
async fn head_blob(
    State(state): State<RegistryState>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<Response> {
    let (digest, blob) = find(&state, &name, &digest).await?;

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                blob.media_type.unwrap_or_else(|| OCTET_STREAM.to_string()),
            ),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, blob.size.to_string()),
        ],
    )
        .into_response())
}

/// Delete a blob
async fn delete_blob(
    State(state): State<RegistryState>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    let (_, blob) = find(&state, &name, &digest).await?;

    state
        .ctx
        .objects
        .delete(&ObjectStore::blob_key(&blob.blob_id))
        .await?;
    state.ctx.blobs.forget_blob(&blob.blob_id).await?;
    Ok(StatusCode::ACCEPTED)
}
