//! Blob upload sessions
//!
//! A session is a blob row without a digest. `PATCH` chunks are stored as part
//! objects; the closing `PUT` concatenates them with its own body and hands the
//! result to the local adapter, which checks the digest before confirming.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{patch, post};
use bytes::Bytes;
use serde::Deserialize;

use super::{DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID, RegistryState, validate_repository};
use crate::adapter::{BlobUpload, Registry};
use crate::blob::{RegistryBlob, RegistryBlobPart};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::objects::ObjectStore;

/// Router for upload sessions
pub(super) fn router() -> Router<RegistryState> {
    Router::new()
        .route("/v2/{name}/blobs/uploads/", post(start_blob_upload))
        .route("/v2/{name}/blobs/uploads", post(start_blob_upload))
        .route(
            "/v2/{name}/blobs/uploads/{uuid}",
            patch(upload_chunk)
                .put(complete_blob_upload)
                .get(upload_status)
                .delete(cancel_blob_upload),
        )
}

#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    digest: Option<String>,
    mount: Option<String>,
    from: Option<String>,
}

fn range(received: u64) -> String {
    format!("0-{}", received.saturating_sub(1))
}

fn accepted(status: StatusCode, name: &str, uuid: &str, received: u64) -> Response {
    (
        status,
        [
            (header::LOCATION, format!("/v2/{name}/blobs/uploads/{uuid}")),
            (header::RANGE, range(received)),
            (DOCKER_UPLOAD_UUID, uuid.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

fn created(name: &str, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/blobs/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

impl RegistryState {
    async fn session(&self, uuid: &str) -> RegistryResult<RegistryBlob> {
        self.ctx
            .blobs
            .get_blob(uuid)
            .await?
            .filter(|blob| !blob.is_complete())
            .ok_or_else(|| RegistryError::BlobUploadUnknown(uuid.to_string()))
    }

    async fn remove_parts(&self, blob: &RegistryBlob) -> RegistryResult<()> {
        for part in &blob.parts {
            self.ctx
                .objects
                .delete(&ObjectStore::part_key(&blob.blob_id, part.part_num))
                .await?;
        }
        Ok(())
    }

    /// Store `data` as the blob `digest`, in the row `blob_id` when given.
    async fn store(
        &self,
        name: &str,
        digest: &Digest,
        blob_id: Option<String>,
        data: &[u8],
    ) -> RegistryResult<()> {
        let mut upload = BlobUpload {
            domain: self.domain.clone(),
            name: name.to_string(),
            digest: digest.clone(),
            complete: false,
            media_type: None,
            location: None,
            blob_id,
        };
        let mut reader = data;
        self.ctx
            .local_registry()
            .blob_upload_chunk(&mut upload, &mut reader, Some(data.len() as u64), digest)
            .await?;
        Ok(())
    }
}

/// Start a blob upload session
///
/// Also handles cross-repository mounts and single-request uploads.
async fn start_blob_upload(
    State(state): State<RegistryState>,
    Path(name): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_repository(&name)?;

    if let Some(mount) = &query.mount {
        let digest: Digest = mount.parse()?;
        if state.ctx.blobs.get_blob_by_digest(&digest).await?.is_some() {
            tracing::debug!(%digest, from = ?query.from, "Mounted blob");
            return Ok(created(&name, &digest));
        }
    }

    if let Some(digest) = &query.digest {
        let digest: Digest = digest.parse()?;
        state.store(&name, &digest, None, &body).await?;
        return Ok(created(&name, &digest));
    }

    let blob = state.ctx.blobs.new_blob(&state.domain).await?;
    Ok(accepted(StatusCode::ACCEPTED, &name, &blob.blob_id, 0))
}

/// Append a chunk to an upload
async fn upload_chunk(
    State(state): State<RegistryState>,
    Path((name, uuid)): Path<(String, String)>,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let blob = state.session(&uuid).await?;

    let part_num = u32::try_from(blob.parts.len() + 1)
        .map_err(|_| RegistryError::BlobUploadUnknown(uuid.clone()))?;
    state
        .ctx
        .objects
        .put(&ObjectStore::part_key(&uuid, part_num), &body)
        .await?;
    let blob = state
        .ctx
        .blobs
        .add_part(
            &uuid,
            RegistryBlobPart {
                part_num,
                chunk_size: body.len() as u64,
                part_id: uuid::Uuid::new_v4().to_string(),
            },
        )
        .await?;

    Ok(accepted(StatusCode::ACCEPTED, &name, &uuid, blob.received()))
}

/// Complete a blob upload
async fn complete_blob_upload(
    State(state): State<RegistryState>,
    Path((name, uuid)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let digest: Digest = query
        .digest
        .ok_or(RegistryError::MissingParam("digest"))?
        .parse()?;
    let blob = state.session(&uuid).await?;

    let mut data = Vec::with_capacity(blob.received() as usize + body.len());
    for part in &blob.parts {
        let chunk = state
            .ctx
            .objects
            .get(&ObjectStore::part_key(&uuid, part.part_num))
            .await?
            .ok_or_else(|| RegistryError::BlobUploadUnknown(uuid.clone()))?;
        data.extend_from_slice(&chunk);
    }
    data.extend_from_slice(&body);

    let stored = state.store(&name, &digest, Some(uuid.clone()), &data).await;
    state.remove_parts(&blob).await?;
    stored?;

    Ok(created(&name, &digest))
}

/// Report how much of an upload has been received
async fn upload_status(
    State(state): State<RegistryState>,
    Path((name, uuid)): Path<(String, String)>,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let blob = state.session(&uuid).await?;
    Ok(accepted(StatusCode::NO_CONTENT, &name, &uuid, blob.received()))
}

/// Cancel a blob upload
async fn cancel_blob_upload(
    State(state): State<RegistryState>,
    Path((name, uuid)): Path<(String, String)>,
) -> RegistryResult<StatusCode> {
    validate_repository(&name)?;
    let blob = state.session(&uuid).await?;
    state.remove_parts(&blob).await?;
    state.ctx.blobs.forget_blob(&uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}
