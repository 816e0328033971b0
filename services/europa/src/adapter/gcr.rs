//! Google Container Registry: service-account JWT exchanged for an access token.

use std::collections::HashMap;
use std::fmt;

use api_client::{ApiClient, BasicAuth, Transport};
use chrono::{DateTime, Duration, Utc};
use jaws::claims::{Claims, RegisteredClaims};
use jaws::crypto::rsa;
use jaws::token::Token;
use parking_lot::Mutex;
use rsa::pkcs8::DecodePrivateKey;
use rsa::sha2::Sha256;
use secret::Secret;
use serde::{Deserialize, Serialize};

use super::ProviderEndpoints;
use super::remote::{RegistryAuth, RemoteRegistry};
use crate::credentials::RegistryCred;
use crate::error::{RegistryError, RegistryResult};
use crate::repo::{ContainerRepo, RegistryProvider};

const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECONDS: i64 = 3600;
const EXPIRY_MARGIN_SECONDS: i64 = 60;

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".into()
}

/// The JSON key file Google issues for a service account.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Service account identity, the JWT issuer.
    pub client_email: String,
    /// PKCS#8 PEM private key.
    pub private_key: Secret,
    /// OAuth token endpoint, also the JWT audience.
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    /// Read the key from a credential's secret.
    pub fn from_cred(cred: &RegistryCred) -> RegistryResult<Self> {
        serde_json::from_str(cred.require_secret()?.revealed()).map_err(|err| {
            RegistryError::InvalidCredential(format!("service account key for {}: {err}", cred.id))
        })
    }

    fn invalid(&self, err: impl fmt::Display) -> RegistryError {
        RegistryError::InvalidCredential(format!("service account {}: {err}", self.client_email))
    }

    /// A signed JWT asserting this identity.
    pub fn assertion(&self, now: DateTime<Utc>) -> RegistryResult<Secret> {
        let key = rsa::RsaPrivateKey::from_pkcs8_pem(self.private_key.revealed())
            .map_err(|err| self.invalid(err))?;

        let claims: Claims<GoogleClaims<'_>, &str> = Claims {
            registered: RegisteredClaims {
                issuer: Some(&self.client_email),
                issued_at: Some(now),
                expiration: Some(now + Duration::seconds(ASSERTION_LIFETIME_SECONDS)),
                ..Default::default()
            },
            claims: GoogleClaims {
                scope: SCOPE,
                aud: &self.token_uri,
            },
        };

        let jwt = Token::compact((), claims);
        let signing_key: rsa::pkcs1v15::SigningKey<Sha256> = rsa::pkcs1v15::SigningKey::new(key);
        let token = jwt
            .sign::<rsa::pkcs1v15::SigningKey<Sha256>, rsa::pkcs1v15::Signature>(&signing_key)
            .map_err(|err| self.invalid(err))?;
        Ok(token.rendered().map_err(|err| self.invalid(err))?.into())
    }
}

#[derive(Debug, Serialize)]
struct GoogleClaims<'a> {
    scope: &'a str,
    aud: &'a str,
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
pub(super) struct TokenCache {
    secret: Secret,
    expires: DateTime<Utc>,
}

impl TokenCache {
    fn is_expired(&self) -> bool {
        self.expires < Utc::now()
    }
}

/// `us`, `eu` and `asia` select a regional host.
fn host(region: Option<&str>) -> String {
    match region.map(str::to_ascii_lowercase).as_deref() {
        Some(region) if region.ends_with("gcr.io") => region.to_owned(),
        Some(region @ ("us" | "eu" | "asia")) => format!("{region}.gcr.io"),
        _ => "gcr.io".into(),
    }
}

async fn access_token(
    transport: &Transport,
    key: &ServiceAccountKey,
) -> RegistryResult<TokenCache> {
    let now = Utc::now();
    let assertion = key.assertion(now)?;
    let token_uri: http::Uri = key.token_uri.parse().map_err(|_| {
        RegistryError::InvalidCredential(format!("invalid token uri {}", key.token_uri))
    })?;

    let client = ApiClient::new_with_inner_service(token_uri, (), transport.clone());
    let token: AccessToken = client
        .post(&key.token_uri)
        .form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.revealed())])
        .send()
        .await?
        .checked_json()
        .await?;

    let lifetime = token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECONDS) - EXPIRY_MARGIN_SECONDS;
    Ok(TokenCache {
        secret: token.access_token.into(),
        expires: now + Duration::seconds(lifetime),
    })
}

#[tracing::instrument(skip_all, fields(repo = %repo.name, cred = %cred.id))]
pub(super) async fn open(
    transport: &Transport,
    endpoints: &ProviderEndpoints,
    tokens: &Mutex<HashMap<String, TokenCache>>,
    repo: &ContainerRepo,
    cred: &RegistryCred,
) -> RegistryResult<RemoteRegistry> {
    let cache_key = format!("{}/{}", cred.domain, cred.id);
    let cached = tokens
        .lock()
        .get(&cache_key)
        .filter(|token| !token.is_expired())
        .cloned();

    let token = match cached {
        Some(token) => token,
        None => {
            let key = ServiceAccountKey::from_cred(cred)?;
            let token = access_token(transport, &key).await?;
            tracing::debug!(account = %key.client_email, "Received GCR access token");
            tokens.lock().insert(cache_key, token.clone());
            token
        }
    };

    let region = repo.region.as_deref().or(cred.region.as_deref());
    let base = super::remote::api_root(&format!(
        "{}://{}",
        endpoints.gcr_scheme,
        host(region)
    ))?;
    Ok(RemoteRegistry::new(
        RegistryProvider::Gcr,
        transport,
        base,
        RegistryAuth::Basic(BasicAuth::new("oauth2accesstoken", Some(token.secret))),
    ))
}
