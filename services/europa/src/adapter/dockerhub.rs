//! Docker Hub: a short-lived bearer token per repository scope.

use api_client::{ApiClient, BasicAuth, BearerAuth, Transport};
use serde::Deserialize;

use super::remote::{RegistryAuth, RemoteRegistry};
use super::{ProviderEndpoints, RegistryAccess};
use crate::credentials::RegistryCred;
use crate::error::{RegistryError, RegistryResult};
use crate::repo::{ContainerRepo, RegistryProvider};

const SERVICE: &str = "registry.docker.io";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Official images live under `library/`.
pub(super) fn repository_name(name: &str) -> String {
    if name.contains('/') {
        name.to_owned()
    } else {
        format!("library/{name}")
    }
}

fn scopes(name: &str, access: &RegistryAccess) -> Vec<String> {
    let actions = if access.is_push() { "pull,push" } else { "pull" };
    let mut scopes = vec![format!("repository:{}:{actions}", repository_name(name))];
    if let Some(from) = access.mount_from() {
        scopes.push(format!("repository:{}:pull", repository_name(from)));
    }
    scopes
}

#[tracing::instrument(skip_all, fields(repo = %repo.name))]
pub(super) async fn open(
    transport: &Transport,
    endpoints: &ProviderEndpoints,
    repo: &ContainerRepo,
    cred: Option<&RegistryCred>,
    access: &RegistryAccess,
) -> RegistryResult<RemoteRegistry> {
    let auth_url: http::Uri = endpoints.dockerhub_auth.parse().map_err(|_| {
        RegistryError::InvalidRepository(format!(
            "invalid token endpoint {}",
            endpoints.dockerhub_auth
        ))
    })?;

    let login = match cred {
        Some(cred) => {
            let username = cred
                .username
                .clone()
                .ok_or(RegistryError::MissingParam("username"))?;
            RegistryAuth::Basic(BasicAuth::new(username, Some(cred.require_secret()?.clone())))
        }
        None => RegistryAuth::Anonymous,
    };
    let auth = ApiClient::new_with_inner_service(auth_url, login, transport.clone());

    let mut query = vec![("service", SERVICE.to_owned())];
    query.extend(
        scopes(&repo.name, access)
            .into_iter()
            .map(|scope| ("scope", scope)),
    );
    let response: TokenResponse = auth
        .get(&endpoints.dockerhub_auth)
        .query(&query)
        .send()
        .await?
        .checked_json()
        .await?;
    let token = response
        .token
        .or(response.access_token)
        .ok_or_else(|| RegistryError::Unauthorized("token service returned no token".into()))?;
    tracing::debug!("Received Docker Hub token");

    let base = super::remote::api_root(&endpoints.dockerhub_registry)?;
    Ok(RemoteRegistry::new(
        RegistryProvider::DockerHub,
        transport,
        base,
        RegistryAuth::Bearer(BearerAuth::new(token)),
    )
    .with_name_mapper(repository_name))
}
