//! Repository descriptors.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

static LOCAL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.-]+$").expect("name pattern must compile"));

static REMOTE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_.-]+(/[a-zA-Z0-9_.-]+)*$").expect("name pattern must compile")
});

/// Whether `name` may be used for a repository stored in this registry.
pub fn is_valid_local_name(name: &str) -> bool {
    LOCAL_NAME.is_match(name)
}

/// Whether `name` may be used for a repository hosted by another registry.
pub fn is_valid_remote_name(name: &str) -> bool {
    REMOTE_NAME.is_match(name)
}

/// Where a repository's content lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryProvider {
    /// Stored by this registry.
    Europa,
    /// Amazon Elastic Container Registry.
    Ecr,
    /// Google Container Registry.
    Gcr,
    /// Docker Hub.
    #[serde(rename = "DOCKERHUB")]
    DockerHub,
    /// Any other registry speaking the distribution API.
    Private,
}

impl RegistryProvider {
    /// The provider name used in messages and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryProvider::Europa => "EUROPA",
            RegistryProvider::Ecr => "ECR",
            RegistryProvider::Gcr => "GCR",
            RegistryProvider::DockerHub => "DOCKERHUB",
            RegistryProvider::Private => "PRIVATE",
        }
    }
}

impl fmt::Display for RegistryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryProvider {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EUROPA" | "LOCAL" => Ok(RegistryProvider::Europa),
            "ECR" => Ok(RegistryProvider::Ecr),
            "GCR" => Ok(RegistryProvider::Gcr),
            "DOCKERHUB" => Ok(RegistryProvider::DockerHub),
            "PRIVATE" => Ok(RegistryProvider::Private),
            _ => Err(RegistryError::InvalidRepository(format!(
                "unknown provider {s}"
            ))),
        }
    }
}

/// A repository known to the registry, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRepo {
    /// Tenant the repository belongs to.
    pub domain: String,
    /// Stable identifier within the tenant.
    pub id: String,
    /// Repository name, as used in image references.
    pub name: String,
    /// Credential used to reach a remote repository.
    #[serde(default)]
    pub cred_id: Option<String>,
    /// Provider region (GCR host prefix, ECR region).
    #[serde(default)]
    pub region: Option<String>,
    /// Which backend holds the content.
    pub provider: RegistryProvider,
    /// ECR account id.
    #[serde(default)]
    pub registry_id: Option<String>,
    /// Host of a `PRIVATE` registry or of this registry.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Content is stored by this registry.
    #[serde(default)]
    pub local: bool,
    /// Content is derived by replication only.
    #[serde(default)]
    pub mirror: bool,
    /// Anonymous pulls are allowed.
    #[serde(default)]
    pub public_repo: bool,
    /// Last completed repo monitor run.
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Optimistic lock counter for the repo monitor.
    #[serde(default)]
    pub sync_count: u64,
    /// Mirrors which replicate this repository.
    #[serde(default)]
    pub sync_destination_container_repo_ids: BTreeSet<String>,
}

impl ContainerRepo {
    /// A repository stored by this registry.
    pub fn local(domain: &str, id: &str, name: &str) -> Self {
        Self {
            domain: domain.to_ascii_lowercase(),
            id: id.to_ascii_lowercase(),
            name: name.to_owned(),
            cred_id: None,
            region: None,
            provider: RegistryProvider::Europa,
            registry_id: None,
            endpoint: None,
            local: true,
            mirror: false,
            public_repo: false,
            last_sync_time: None,
            sync_count: 0,
            sync_destination_container_repo_ids: BTreeSet::new(),
        }
    }

    /// A local repository which only receives replicated content.
    pub fn local_mirror(domain: &str, id: &str, name: &str) -> Self {
        Self {
            mirror: true,
            ..Self::local(domain, id, name)
        }
    }

    /// A repository hosted by another registry.
    pub fn remote(
        domain: &str,
        id: &str,
        name: &str,
        provider: RegistryProvider,
        cred_id: Option<&str>,
    ) -> Self {
        Self {
            provider,
            cred_id: cred_id.map(str::to_owned),
            local: false,
            ..Self::local(domain, id, name)
        }
    }

    /// Whether the repository is held by the local backend.
    pub fn is_local_europa(&self) -> bool {
        self.local && self.provider == RegistryProvider::Europa
    }

    /// Check the fields a saved repository must have.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.domain.trim().is_empty() {
            return Err(RegistryError::MissingParam("domain"));
        }
        if self.id.trim().is_empty() {
            return Err(RegistryError::MissingParam("id"));
        }
        if self.name.trim().is_empty() {
            return Err(RegistryError::MissingParam("name"));
        }

        let valid = if self.local {
            is_valid_local_name(&self.name)
        } else {
            is_valid_remote_name(&self.name)
        };
        if !valid {
            return Err(RegistryError::InvalidRepositoryName(self.name.clone()));
        }

        if self.mirror && !self.local {
            return Err(RegistryError::InvalidRepository(format!(
                "mirror repository {} must be local",
                self.name
            )));
        }
        Ok(())
    }

    /// The command a user runs to pull from this repository.
    pub fn pull_command(&self) -> Option<String> {
        match self.provider {
            RegistryProvider::Gcr => Some(format!(
                "gcloud docker -- pull {}/{}",
                self.region.as_deref().unwrap_or("gcr.io"),
                self.name
            )),
            RegistryProvider::Ecr => Some(format!(
                "docker pull {}.dkr.ecr.{}.amazonaws.com/{}",
                self.registry_id.as_deref()?,
                self.region.as_deref()?,
                self.name
            )),
            RegistryProvider::DockerHub => Some(format!("docker pull {}", self.name)),
            RegistryProvider::Private | RegistryProvider::Europa => self
                .endpoint
                .as_deref()
                .map(|endpoint| format!("docker pull {endpoint}/{}", self.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_names() {
        assert!(is_valid_local_name("app-server_1.0"));
        assert!(!is_valid_local_name("team/app"));
        assert!(!is_valid_local_name(""));
        assert!(is_valid_remote_name("library/ubuntu"));
        assert!(!is_valid_remote_name("library//ubuntu"));
    }

    #[test]
    fn mirrors_must_be_local() {
        let mut repo = ContainerRepo::local_mirror("acme", "m1", "mirror");
        assert!(repo.validate().is_ok());

        repo.local = false;
        assert!(matches!(
            repo.validate(),
            Err(RegistryError::InvalidRepository(_))
        ));
    }

    #[test]
    fn ids_and_domains_are_lowercased() {
        let repo = ContainerRepo::local("ACME", "Repo-1", "App");
        assert_eq!(repo.domain, "acme");
        assert_eq!(repo.id, "repo-1");
        assert_eq!(repo.name, "App");
    }

    #[test]
    fn pull_commands() {
        let mut hub = ContainerRepo::remote(
            "acme",
            "h",
            "library/ubuntu",
            RegistryProvider::DockerHub,
            None,
        );
        assert_eq!(hub.pull_command().unwrap(), "docker pull library/ubuntu");

        hub.provider = RegistryProvider::Ecr;
        assert_eq!(hub.pull_command(), None);
        hub.registry_id = Some("123456789012".into());
        hub.region = Some("us-west-2".into());
        assert_eq!(
            hub.pull_command().unwrap(),
            "docker pull 123456789012.dkr.ecr.us-west-2.amazonaws.com/library/ubuntu"
        );

        let mut local = ContainerRepo::local("acme", "l", "app");
        assert_eq!(local.pull_command(), None);
        local.endpoint = Some("registry.acme.test".into());
        assert_eq!(
            local.pull_command().unwrap(),
            "docker pull registry.acme.test/app"
        );
    }

    #[test]
    fn provider_serde() {
        let json = serde_json::to_string(&RegistryProvider::DockerHub).unwrap();
        assert_eq!(json, "\"DOCKERHUB\"");
        let provider: RegistryProvider = serde_json::from_str("\"EUROPA\"").unwrap();
        assert_eq!(provider, RegistryProvider::Europa);
        assert_eq!("gcr".parse::<RegistryProvider>().unwrap(), RegistryProvider::Gcr);
    }
}
