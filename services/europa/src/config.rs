//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use storage::StorageConfig;

use crate::api::RegistryBuilder;
use crate::error::RegistryResult;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_domain() -> String {
    "default".into()
}

fn default_bucket() -> String {
    "registry".into()
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory {
        bucket: default_bucket(),
    }
}

/// Configuration for the `registry-server` binary.
///
/// ```toml
/// listen = "0.0.0.0:5000"
/// domain = "acme"
/// bucket = "registry"
/// sync-interval-seconds = 300
///
/// [storage]
/// driver = "local"
/// path = "/var/lib/europa"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Address the HTTP server binds.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Tenant served.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Object store for manifests and blobs.
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    /// Bucket within the object store.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// How often mirrored repositories are polled. Polling is off when unset.
    #[serde(default)]
    pub sync_interval_seconds: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            domain: default_domain(),
            storage: default_storage(),
            bucket: default_bucket(),
            sync_interval_seconds: None,
        }
    }
}

impl RegistryConfig {
    /// Poll period for mirror monitors.
    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_seconds
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
    }

    /// A builder for the configured registry.
    pub fn builder(&self) -> RegistryResult<RegistryBuilder> {
        let storage = self.storage.clone().build()?;
        Ok(RegistryBuilder::new()
            .storage(storage)
            .bucket(self.bucket.clone())
            .domain(self.domain.clone()))
    }
}
