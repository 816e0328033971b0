//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::digest::Digest;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

fn repo_not_found(domain: &str, name: &Option<String>, id: &Option<String>) -> String {
    let mut message = format!("No container repository found with domain {domain}");
    if let Some(name) = name {
        message.push_str(&format!(" and name {name}"));
    }
    if let Some(id) = id {
        message.push_str(&format!(" and id {id}"));
    }
    message
}

fn joined(digests: &[Digest]) -> String {
    digests
        .iter()
        .map(Digest::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The repository is not in the directory.
    #[error("{}", repo_not_found(.domain, .name, .id))]
    ContainerRepoNotFound {
        /// Tenant domain searched.
        domain: String,
        /// Repository name, when the lookup was by name.
        name: Option<String>,
        /// Repository id, when the lookup was by id.
        id: Option<String>,
    },

    /// No manifest row (or stored manifest body) exists for the reference.
    #[error("No manifest found for reference {reference} in repository {repository}")]
    ManifestNotFound {
        /// Tag or digest requested.
        reference: String,
        /// Repository name.
        repository: String,
    },

    /// The repository provider has no adapter.
    #[error("Could not find registry for repo {repository} with provider {provider}")]
    RegistryNotFound {
        /// Repository name.
        repository: String,
        /// Provider name.
        provider: String,
    },

    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// A pushed manifest references blobs which were never uploaded.
    #[error("Unknown blob(s) referenced by manifest: {}", joined(.0))]
    BlobUnknown(Vec<Digest>),

    /// The upload session does not exist or is already complete.
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    /// Digest mismatch
    #[error("Computed digest={computed}, but declared digest={declared}")]
    DigestMismatch {
        /// Digest of the bytes received.
        computed: Digest,
        /// Digest the client claimed.
        declared: Digest,
    },

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Neither a valid tag nor a valid digest.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepositoryName(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A required parameter was not supplied.
    #[error("Missing parameter {0}")]
    MissingParam(&'static str),

    /// A sync task targets a repository which cannot receive replicated images.
    #[error("{0}")]
    InvalidSyncDestination(String),

    /// A repository could not be saved.
    #[error("invalid repository: {0}")]
    InvalidRepository(String),

    /// The pipeline does not exist.
    #[error("No pipeline found with domain {domain} and id {id}")]
    PipelineNotFound {
        /// Tenant domain.
        domain: String,
        /// Pipeline id.
        id: String,
    },

    /// The component id is not part of the pipeline.
    #[error("The specified PipelineComponent is not in the specified Pipeline")]
    PipelineComponentNotFound,

    /// The stored credential does not exist.
    #[error("No credential found with domain {domain} and id {id}")]
    CredentialNotFound {
        /// Tenant domain.
        domain: String,
        /// Credential id.
        id: String,
    },

    /// The stored credential cannot be used.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// A one-shot operation was run twice.
    #[error("Cannot perform {0} operation again")]
    DuplicateRegistryOperation(&'static str),

    /// The remote registry rejected the credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The caller may not perform the operation.
    #[error("denied: {0}")]
    Denied(String),

    /// A remote registry request failed.
    #[error("remote registry: {0}")]
    Remote(#[source] api_client::Error),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document did not decode.
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<api_client::Error> for RegistryError {
    fn from(error: api_client::Error) -> Self {
        match error.status() {
            Some(StatusCode::UNAUTHORIZED) => RegistryError::Unauthorized(error.to_string()),
            Some(StatusCode::FORBIDDEN) => RegistryError::Denied(error.to_string()),
            _ => RegistryError::Remote(error),
        }
    }
}

impl RegistryError {
    /// Build a [`RegistryError::ContainerRepoNotFound`] for a lookup by id.
    pub fn repo_id_not_found(domain: &str, id: &str) -> Self {
        RegistryError::ContainerRepoNotFound {
            domain: domain.to_owned(),
            name: None,
            id: Some(id.to_owned()),
        }
    }

    /// Build a [`RegistryError::ContainerRepoNotFound`] for a lookup by name.
    pub fn repo_name_not_found(domain: &str, name: &str) -> Self {
        RegistryError::ContainerRepoNotFound {
            domain: domain.to_owned(),
            name: Some(name.to_owned()),
            id: None,
        }
    }

    /// Whether this error means "it is not there".
    pub fn is_not_found(&self) -> bool {
        self.status_code() == StatusCode::NOT_FOUND
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::ContainerRepoNotFound { .. }
            | RegistryError::ManifestNotFound { .. }
            | RegistryError::BlobNotFound(_)
            | RegistryError::BlobUploadUnknown(_)
            | RegistryError::PipelineNotFound { .. }
            | RegistryError::CredentialNotFound { .. } => StatusCode::NOT_FOUND,
            RegistryError::RegistryNotFound { .. }
            | RegistryError::BlobUnknown(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::InvalidDigest(_)
            | RegistryError::InvalidReference(_)
            | RegistryError::InvalidRepositoryName(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::MissingParam(_)
            | RegistryError::InvalidSyncDestination(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::PipelineComponentNotFound
            | RegistryError::InvalidCredential(_) => StatusCode::BAD_REQUEST,
            RegistryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RegistryError::Denied(_) => StatusCode::FORBIDDEN,
            RegistryError::Remote(_) => StatusCode::BAD_GATEWAY,
            RegistryError::DuplicateRegistryOperation(_)
            | RegistryError::Storage(_)
            | RegistryError::Io(_)
            | RegistryError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::ContainerRepoNotFound { .. } => "NAME_UNKNOWN",
            RegistryError::ManifestNotFound { .. } => "MANIFEST_UNKNOWN",
            RegistryError::RegistryNotFound { .. } => "UNSUPPORTED",
            RegistryError::BlobNotFound(_) | RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::DigestMismatch { .. } | RegistryError::InvalidDigest(_) => {
                "DIGEST_INVALID"
            }
            RegistryError::InvalidReference(_) => "TAG_INVALID",
            RegistryError::InvalidRepositoryName(_) => "NAME_INVALID",
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::MissingParam(_) => "MISSING_PARAMETER",
            RegistryError::InvalidSyncDestination(_) => "INVALID_SYNC_DESTINATION",
            RegistryError::InvalidRepository(_) => "INVALID_REPOSITORY",
            RegistryError::PipelineNotFound { .. } => "PIPELINE_UNKNOWN",
            RegistryError::PipelineComponentNotFound => "PIPELINE_COMPONENT_UNKNOWN",
            RegistryError::CredentialNotFound { .. } => "CREDENTIAL_UNKNOWN",
            RegistryError::InvalidCredential(_) => "CREDENTIAL_INVALID",
            RegistryError::Unauthorized(_) => "UNAUTHORIZED",
            RegistryError::Denied(_) => "DENIED",
            RegistryError::DuplicateRegistryOperation(_)
            | RegistryError::Remote(_)
            | RegistryError::Storage(_)
            | RegistryError::Io(_)
            | RegistryError::Json(_) => "UNKNOWN",
        }
    }

    fn detail(&self) -> Value {
        match self {
            RegistryError::BlobUnknown(digests) => Value::Array(
                digests
                    .iter()
                    .map(|digest| Value::String(digest.to_string()))
                    .collect(),
            ),
            RegistryError::BlobNotFound(digest) => Value::String(digest.to_string()),
            _ => Value::Null,
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    detail: Value,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
                detail: self.detail(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
