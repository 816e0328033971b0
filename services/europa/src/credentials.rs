//! Stored credentials for remote registries.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use secret::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::repo::RegistryProvider;

/// Credentials for one remote registry account.
///
/// What `key` and `secret` hold depends on the provider:
///
/// | provider    | `username`      | `key`          | `secret`                     |
/// |-------------|-----------------|----------------|------------------------------|
/// | `DOCKERHUB` | account name    |                | password or access token     |
/// | `GCR`       |                 |                | service account key (JSON)   |
/// | `ECR`       |                 | access key id  | secret access key            |
/// | `PRIVATE`   | account name    |                | password                     |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCred {
    /// Tenant.
    pub domain: String,
    /// Identifier within the tenant.
    pub id: String,
    /// Provider the credential is for.
    pub provider: RegistryProvider,
    /// Provider region.
    #[serde(default)]
    pub region: Option<String>,
    /// Account name.
    #[serde(default)]
    pub username: Option<String>,
    /// Public half of a key pair.
    #[serde(default)]
    pub key: Option<Secret>,
    /// Password, token or private key material.
    #[serde(default)]
    pub secret: Option<Secret>,
    /// Registry host, for `PRIVATE` credentials.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl RegistryCred {
    /// A credential with no material attached.
    pub fn new(domain: &str, id: &str, provider: RegistryProvider) -> Self {
        Self {
            domain: domain.to_ascii_lowercase(),
            id: id.to_ascii_lowercase(),
            provider,
            region: None,
            username: None,
            key: None,
            secret: None,
            endpoint: None,
        }
    }

    /// Attach an account name and password.
    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<Secret>) -> Self {
        self.username = Some(username.into());
        self.secret = Some(password.into());
        self
    }

    /// The secret, or `InvalidCredential` when the credential has none.
    pub fn require_secret(&self) -> Result<&Secret, RegistryError> {
        self.secret.as_ref().ok_or_else(|| {
            RegistryError::InvalidCredential(format!("credential {} has no secret", self.id))
        })
    }
}

/// Persistence contract for credentials.
#[async_trait]
pub trait CredentialStore: fmt::Debug + Send + Sync {
    /// Look up a credential.
    async fn get_cred(&self, domain: &str, id: &str) -> Result<Option<RegistryCred>, RegistryError>;

    /// Create or replace a credential.
    async fn save(&self, cred: RegistryCred) -> Result<(), RegistryError>;

    /// Every credential of a tenant, in id order.
    async fn list_creds(&self, domain: &str) -> Result<Vec<RegistryCred>, RegistryError>;
}

/// In-process credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    creds: RwLock<BTreeMap<(String, String), RegistryCred>>,
}

impl MemoryCredentials {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    async fn get_cred(&self, domain: &str, id: &str) -> Result<Option<RegistryCred>, RegistryError> {
        let key = (domain.to_ascii_lowercase(), id.to_ascii_lowercase());
        Ok(self.creds.read().await.get(&key).cloned())
    }

    async fn save(&self, mut cred: RegistryCred) -> Result<(), RegistryError> {
        cred.domain = cred.domain.to_ascii_lowercase();
        cred.id = cred.id.to_ascii_lowercase();
        if cred.id.is_empty() {
            return Err(RegistryError::MissingParam("id"));
        }
        let key = (cred.domain.clone(), cred.id.clone());
        self.creds.write().await.insert(key, cred);
        Ok(())
    }

    async fn list_creds(&self, domain: &str) -> Result<Vec<RegistryCred>, RegistryError> {
        let domain = domain.to_ascii_lowercase();
        Ok(self
            .creds
            .read()
            .await
            .values()
            .filter(|cred| cred.domain == domain)
            .cloned()
            .collect())
    }
}
