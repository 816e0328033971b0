//! Amazon ECR.
//!
//! Token issuance belongs to AWS, so it is delegated to an [`EcrAuthorizer`];
//! the adapter only turns the authorization into Basic auth against the proxy
//! endpoint.

use std::fmt;

use api_client::Transport;
use async_trait::async_trait;
use secret::Secret;

use super::remote::{RegistryAuth, RemoteRegistry};
use crate::credentials::RegistryCred;
use crate::error::RegistryResult;
use crate::repo::{ContainerRepo, RegistryProvider};

/// A registry authorization token and where to use it.
#[derive(Debug, Clone)]
pub struct EcrAuthorization {
    /// Base64 `user:password`, used verbatim as Basic credentials.
    pub token: Secret,
    /// Registry host, e.g. `https://123456789012.dkr.ecr.us-west-2.amazonaws.com`.
    pub proxy_endpoint: String,
}

/// Exchanges an AWS key pair for an ECR authorization token.
#[async_trait]
pub trait EcrAuthorizer: fmt::Debug + Send + Sync {
    /// Authorize `cred` for the registry `registry_id` in `region`.
    async fn authorize(
        &self,
        cred: &RegistryCred,
        registry_id: Option<&str>,
        region: Option<&str>,
    ) -> RegistryResult<EcrAuthorization>;
}

#[tracing::instrument(skip_all, fields(repo = %repo.name, cred = %cred.id))]
pub(super) async fn open(
    transport: &Transport,
    authorizer: &dyn EcrAuthorizer,
    repo: &ContainerRepo,
    cred: &RegistryCred,
) -> RegistryResult<RemoteRegistry> {
    let region = repo.region.as_deref().or(cred.region.as_deref());
    let authorization = authorizer
        .authorize(cred, repo.registry_id.as_deref(), region)
        .await?;
    tracing::debug!(endpoint = %authorization.proxy_endpoint, "Received ECR authorization");

    let header = format!("Basic {}", authorization.token.revealed());
    Ok(RemoteRegistry::new(
        RegistryProvider::Ecr,
        transport,
        super::remote::api_root(&authorization.proxy_endpoint)?,
        RegistryAuth::Header(header.into()),
    ))
}
