//! The repository directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::manifest::{Page, PageIterator};
use crate::repo::{ContainerRepo, RegistryProvider, is_valid_local_name};

/// Outcome of checking a proposed local repository name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NameValidity {
    /// The name does not match the grammar.
    Invalid,
    /// A local repository already has the name.
    Exists,
    /// The name may be used.
    Valid,
}

/// Persistence contract for repositories.
#[async_trait]
pub trait RepoDirectory: fmt::Debug + Send + Sync {
    /// Create or replace a repository.
    async fn save(&self, repo: ContainerRepo) -> Result<ContainerRepo, RegistryError>;

    /// Look up a repository by id.
    async fn get_repo(&self, domain: &str, id: &str)
    -> Result<Option<ContainerRepo>, RegistryError>;

    /// Look up a local repository by name.
    async fn get_local_repo(
        &self,
        domain: &str,
        name: &str,
    ) -> Result<Option<ContainerRepo>, RegistryError>;

    /// Delete a repository, returning it.
    async fn delete_repo(
        &self,
        domain: &str,
        id: &str,
    ) -> Result<Option<ContainerRepo>, RegistryError>;

    /// Every repository of a tenant, in id order.
    async fn list_repos(
        &self,
        domain: &str,
        page: &PageIterator,
    ) -> Result<Page<ContainerRepo>, RegistryError>;

    /// Local repositories of a tenant in name order; the marker is a name.
    async fn list_local_repos(
        &self,
        domain: &str,
        page: &PageIterator,
    ) -> Result<Page<ContainerRepo>, RegistryError>;

    /// Repositories using a credential.
    async fn list_repos_by_cred(
        &self,
        domain: &str,
        cred_id: &str,
    ) -> Result<Vec<ContainerRepo>, RegistryError>;

    /// Repositories of a provider, optionally in one region.
    async fn list_repos_by_provider(
        &self,
        domain: &str,
        provider: RegistryProvider,
        region: Option<&str>,
    ) -> Result<Vec<ContainerRepo>, RegistryError>;

    /// Record a completed repo monitor run.
    async fn set_last_sync_time(
        &self,
        domain: &str,
        id: &str,
        time: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// Start mirroring into `destination_id`.
    async fn add_sync_destination(
        &self,
        domain: &str,
        id: &str,
        destination_id: &str,
    ) -> Result<(), RegistryError>;

    /// Stop mirroring into `destination_id`.
    async fn remove_sync_destination(
        &self,
        domain: &str,
        id: &str,
        destination_id: &str,
    ) -> Result<(), RegistryError>;

    /// Replace the set of mirror destinations.
    async fn set_sync_destinations(
        &self,
        domain: &str,
        id: &str,
        destinations: BTreeSet<String>,
    ) -> Result<(), RegistryError>;

    /// Compare-and-swap the sync counter from `current` to `current + 1`.
    ///
    /// A `current` of zero also matches a repository which has never synced. Returns
    /// `false` when another writer got there first.
    async fn increment_sync_count(
        &self,
        domain: &str,
        id: &str,
        current: u64,
    ) -> Result<bool, RegistryError>;

    /// Check proposed local repository names.
    async fn validate_local_names(
        &self,
        domain: &str,
        names: &[String],
    ) -> Result<BTreeMap<String, NameValidity>, RegistryError> {
        let mut result = BTreeMap::new();
        for name in names {
            let validity = if !is_valid_local_name(name) {
                NameValidity::Invalid
            } else if self.get_local_repo(domain, name).await?.is_some() {
                NameValidity::Exists
            } else {
                NameValidity::Valid
            };
            result.insert(name.clone(), validity);
        }
        Ok(result)
    }
}

/// Find a local repository by name, creating it on first use.
#[tracing::instrument(skip(directory))]
pub async fn get_or_create_local_repo(
    directory: &dyn RepoDirectory,
    domain: &str,
    name: &str,
) -> Result<ContainerRepo, RegistryError> {
    if let Some(repo) = directory.get_local_repo(domain, name).await? {
        return Ok(repo);
    }

    let repo = ContainerRepo::local(domain, &uuid::Uuid::new_v4().to_string(), name);
    tracing::info!(domain, name, id = %repo.id, "Creating local repository");
    if let Err(error) = directory.save(repo).await {
        // A concurrent push may have created it first.
        if let Some(existing) = directory.get_local_repo(domain, name).await? {
            tracing::debug!(
                domain,
                name,
                id = %existing.id,
                "Local repository created concurrently"
            );
            return Ok(existing);
        }
        return Err(error);
    }

    directory
        .get_local_repo(domain, name)
        .await?
        .ok_or_else(|| RegistryError::repo_name_not_found(domain, name))
}

type RepoKey = (String, String);

/// In-process repository directory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    repos: RwLock<BTreeMap<RepoKey, ContainerRepo>>,
}

impl MemoryDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(domain: &str, id: &str) -> RepoKey {
        (domain.to_ascii_lowercase(), id.to_ascii_lowercase())
    }

    async fn update<F>(&self, domain: &str, id: &str, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut ContainerRepo) + Send,
    {
        let mut repos = self.repos.write().await;
        let repo = repos
            .get_mut(&Self::key(domain, id))
            .ok_or_else(|| RegistryError::repo_id_not_found(domain, id))?;
        f(repo);
        Ok(())
    }

    fn page(
        mut repos: Vec<ContainerRepo>,
        page: &PageIterator,
        marker: fn(&ContainerRepo) -> &str,
    ) -> Page<ContainerRepo> {
        let next = if repos.len() > page.page_size {
            repos.truncate(page.page_size);
            repos.last().map(|repo| marker(repo).to_owned())
        } else {
            None
        };
        Page { items: repos, next }
    }
}

#[async_trait]
impl RepoDirectory for MemoryDirectory {
    async fn save(&self, mut repo: ContainerRepo) -> Result<ContainerRepo, RegistryError> {
        repo.domain = repo.domain.to_ascii_lowercase();
        repo.id = repo.id.to_ascii_lowercase();
        repo.validate()?;

        let mut repos = self.repos.write().await;

        for destination in &repo.sync_destination_container_repo_ids {
            match repos.get(&Self::key(&repo.domain, destination)) {
                Some(target) if target.local && target.mirror => {}
                Some(target) => {
                    return Err(RegistryError::InvalidRepository(format!(
                        "sync destination {} is not a local mirror",
                        target.id
                    )));
                }
                None => return Err(RegistryError::repo_id_not_found(&repo.domain, destination)),
            }
        }

        if repo.local {
            let taken = repos.values().any(|other| {
                other.local
                    && other.domain == repo.domain
                    && other.name == repo.name
                    && other.id != repo.id
            });
            if taken {
                return Err(RegistryError::InvalidRepository(format!(
                    "a local repository named {} already exists",
                    repo.name
                )));
            }
        }

        // The sync counter only moves through `increment_sync_count`.
        if let Some(stored) = repos.get(&Self::key(&repo.domain, &repo.id)) {
            repo.sync_count = stored.sync_count;
        }

        repos.insert(Self::key(&repo.domain, &repo.id), repo.clone());
        Ok(repo)
    }

    async fn get_repo(
        &self,
        domain: &str,
        id: &str,
    ) -> Result<Option<ContainerRepo>, RegistryError> {
        Ok(self.repos.read().await.get(&Self::key(domain, id)).cloned())
    }

    async fn get_local_repo(
        &self,
        domain: &str,
        name: &str,
    ) -> Result<Option<ContainerRepo>, RegistryError> {
        let domain = domain.to_ascii_lowercase();
        Ok(self
            .repos
            .read()
            .await
            .values()
            .find(|repo| repo.local && repo.domain == domain && repo.name == name)
            .cloned())
    }

    async fn delete_repo(
        &self,
        domain: &str,
        id: &str,
    ) -> Result<Option<ContainerRepo>, RegistryError> {
        Ok(self.repos.write().await.remove(&Self::key(domain, id)))
    }

    async fn list_repos(
        &self,
        domain: &str,
        page: &PageIterator,
    ) -> Result<Page<ContainerRepo>, RegistryError> {
        let domain = domain.to_ascii_lowercase();
        let repos: Vec<ContainerRepo> = self
            .repos
            .read()
            .await
            .values()
            .filter(|repo| {
                repo.domain == domain
                    && page.marker.as_deref().is_none_or(|marker| repo.id.as_str() > marker)
            })
            .take(page.page_size.saturating_add(1))
            .cloned()
            .collect();
        Ok(Self::page(repos, page, |repo| repo.id.as_str()))
    }

    async fn list_local_repos(
        &self,
        domain: &str,
        page: &PageIterator,
    ) -> Result<Page<ContainerRepo>, RegistryError> {
        let domain = domain.to_ascii_lowercase();
        let mut repos: Vec<ContainerRepo> = self
            .repos
            .read()
            .await
            .values()
            .filter(|repo| {
                repo.local
                    && repo.domain == domain
                    && page.marker.as_deref().is_none_or(|marker| repo.name.as_str() > marker)
            })
            .cloned()
            .collect();
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        repos.truncate(page.page_size.saturating_add(1));
        Ok(Self::page(repos, page, |repo| repo.name.as_str()))
    }

    async fn list_repos_by_cred(
        &self,
        domain: &str,
        cred_id: &str,
    ) -> Result<Vec<ContainerRepo>, RegistryError> {
        let domain = domain.to_ascii_lowercase();
        Ok(self
            .repos
            .read()
            .await
            .values()
            .filter(|repo| {
                repo.domain == domain
                    && repo
                        .cred_id
                        .as_deref()
                        .is_some_and(|id| id.eq_ignore_ascii_case(cred_id))
            })
            .cloned()
            .collect())
    }

    async fn list_repos_by_provider(
        &self,
        domain: &str,
        provider: RegistryProvider,
        region: Option<&str>,
    ) -> Result<Vec<ContainerRepo>, RegistryError> {
        let domain = domain.to_ascii_lowercase();
        Ok(self
            .repos
            .read()
            .await
            .values()
            .filter(|repo| {
                repo.domain == domain
                    && repo.provider == provider
                    && region.is_none_or(|region| repo.region.as_deref() == Some(region))
            })
            .cloned()
            .collect())
    }

    async fn set_last_sync_time(
        &self,
        domain: &str,
        id: &str,
        time: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        self.update(domain, id, |repo| repo.last_sync_time = Some(time))
            .await
    }

    async fn add_sync_destination(
        &self,
        domain: &str,
        id: &str,
        destination_id: &str,
    ) -> Result<(), RegistryError> {
        let destination = self
            .get_repo(domain, destination_id)
            .await?
            .ok_or_else(|| RegistryError::repo_id_not_found(domain, destination_id))?;
        if !(destination.local && destination.mirror) {
            return Err(RegistryError::InvalidRepository(format!(
                "sync destination {destination_id} is not a local mirror"
            )));
        }

        let destination_id = destination.id;
        self.update(domain, id, move |repo| {
            repo.sync_destination_container_repo_ids
                .insert(destination_id);
        })
        .await
    }

    async fn remove_sync_destination(
        &self,
        domain: &str,
        id: &str,
        destination_id: &str,
    ) -> Result<(), RegistryError> {
        let destination_id = destination_id.to_ascii_lowercase();
        self.update(domain, id, move |repo| {
            repo.sync_destination_container_repo_ids
                .remove(&destination_id);
        })
        .await
    }

    async fn set_sync_destinations(
        &self,
        domain: &str,
        id: &str,
        destinations: BTreeSet<String>,
    ) -> Result<(), RegistryError> {
        self.update(domain, id, move |repo| {
            repo.sync_destination_container_repo_ids = destinations;
        })
        .await
    }

    async fn increment_sync_count(
        &self,
        domain: &str,
        id: &str,
        current: u64,
    ) -> Result<bool, RegistryError> {
        let mut repos = self.repos.write().await;
        let Some(repo) = repos.get_mut(&Self::key(domain, id)) else {
            return Ok(false);
        };
        if repo.sync_count != current {
            return Ok(false);
        }
        repo.sync_count = current + 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn sync_count_is_compare_and_swap() {
        let directory = MemoryDirectory::new();
        directory
            .save(ContainerRepo::remote(
                "acme",
                "s1",
                "library/ubuntu",
                RegistryProvider::DockerHub,
                None,
            ))
            .await
            .unwrap();

        assert!(directory.increment_sync_count("acme", "s1", 0).await.unwrap());
        assert!(!directory.increment_sync_count("acme", "s1", 0).await.unwrap());
        assert!(directory.increment_sync_count("acme", "s1", 1).await.unwrap());

        let repo = directory.get_repo("acme", "s1").await.unwrap().unwrap();
        assert_eq!(repo.sync_count, 2);
    }

    #[tokio::test]
    async fn destinations_must_be_local_mirrors() {
        let directory = MemoryDirectory::new();
        directory
            .save(ContainerRepo::local("acme", "plain", "plain"))
            .await
            .unwrap();
        directory
            .save(ContainerRepo::local_mirror("acme", "m1", "mirror"))
            .await
            .unwrap();

        let mut source = ContainerRepo::remote(
            "acme",
            "s1",
            "library/ubuntu",
            RegistryProvider::DockerHub,
            None,
        );
        source.sync_destination_container_repo_ids.insert("plain".into());
        assert!(matches!(
            directory.save(source.clone()).await,
            Err(RegistryError::InvalidRepository(_))
        ));

        source.sync_destination_container_repo_ids = BTreeSet::from(["m1".to_owned()]);
        directory.save(source).await.unwrap();

        assert!(directory.add_sync_destination("acme", "s1", "plain").await.is_err());
        assert!(directory.add_sync_destination("acme", "s1", "gone").await.is_err());
    }

    #[tokio::test]
    async fn lazily_creates_local_repos() {
        let directory = MemoryDirectory::new();
        let created = get_or_create_local_repo(&directory, "acme", "app").await.unwrap();
        let again = get_or_create_local_repo(&directory, "ACME", "app").await.unwrap();
        assert_eq!(created.id, again.id);
        assert!(again.is_local_europa());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_creates_one_repo() {
        let directory = Arc::new(MemoryDirectory::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let directory = directory.clone();
            handles.push(tokio::spawn(async move {
                get_or_create_local_repo(directory.as_ref(), "acme", "app").await
            }));
        }

        let mut ids = BTreeSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), 1);

        let page = directory
            .list_local_repos("acme", &PageIterator::first(10))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn save_keeps_the_stored_sync_count() {
        let directory = MemoryDirectory::new();
        let source = directory
            .save(ContainerRepo::remote(
                "acme",
                "s1",
                "library/ubuntu",
                RegistryProvider::DockerHub,
                None,
            ))
            .await
            .unwrap();
        assert!(directory.increment_sync_count("acme", "s1", 0).await.unwrap());

        let mut stale = source;
        stale.public_repo = true;
        let saved = directory.save(stale).await.unwrap();
        assert_eq!(saved.sync_count, 1);

        let repo = directory.get_repo("acme", "s1").await.unwrap().unwrap();
        assert_eq!(repo.sync_count, 1);
        assert!(repo.public_repo);
        assert!(!directory.increment_sync_count("acme", "s1", 0).await.unwrap());
    }

    #[tokio::test]
    async fn catalog_is_in_name_order() {
        let directory = MemoryDirectory::new();
        for (id, name) in [("1", "zeta"), ("2", "alpha"), ("3", "mid")] {
            directory
                .save(ContainerRepo::local("acme", id, name))
                .await
                .unwrap();
        }

        let page = directory
            .list_local_repos("acme", &PageIterator::first(2))
            .await
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|repo| repo.name.as_str()).collect();
        assert_eq!(names, ["alpha", "mid"]);
        assert_eq!(page.next.as_deref(), Some("mid"));
    }

    #[tokio::test]
    async fn validates_names() {
        let directory = MemoryDirectory::new();
        directory
            .save(ContainerRepo::local("acme", "1", "taken"))
            .await
            .unwrap();

        let result = directory
            .validate_local_names(
                "acme",
                &["taken".to_owned(), "new-one".to_owned(), "bad/name".to_owned()],
            )
            .await
            .unwrap();
        assert_eq!(result["taken"], NameValidity::Exists);
        assert_eq!(result["new-one"], NameValidity::Valid);
        assert_eq!(result["bad/name"], NameValidity::Invalid);
    }

    #[tokio::test]
    async fn secondary_lookups() {
        let directory = MemoryDirectory::new();
        let mut eu = ContainerRepo::remote("acme", "g1", "proj/app", RegistryProvider::Gcr, Some("SA"));
        eu.region = Some("eu".into());
        let us = ContainerRepo::remote("acme", "g2", "proj/web", RegistryProvider::Gcr, Some("other"));
        for repo in [eu, us, ContainerRepo::local("acme", "l1", "app")] {
            directory.save(repo).await.unwrap();
        }

        let by_cred = directory.list_repos_by_cred("ACME", "sa").await.unwrap();
        assert_eq!(by_cred.len(), 1);
        assert_eq!(by_cred[0].id, "g1");

        let gcr = directory
            .list_repos_by_provider("acme", RegistryProvider::Gcr, None)
            .await
            .unwrap();
        assert_eq!(gcr.len(), 2);
        let regional = directory
            .list_repos_by_provider("acme", RegistryProvider::Gcr, Some("eu"))
            .await
            .unwrap();
        assert_eq!(regional.len(), 1);
        assert_eq!(regional[0].id, "g1");
    }

    #[tokio::test]
    async fn destinations_can_be_removed() {
        let directory = MemoryDirectory::new();
        directory
            .save(ContainerRepo::local_mirror("acme", "m1", "mirror"))
            .await
            .unwrap();
        directory
            .save(ContainerRepo::remote(
                "acme",
                "s1",
                "library/ubuntu",
                RegistryProvider::DockerHub,
                None,
            ))
            .await
            .unwrap();

        directory.add_sync_destination("acme", "s1", "M1").await.unwrap();
        let repo = directory.get_repo("acme", "s1").await.unwrap().unwrap();
        assert!(repo.sync_destination_container_repo_ids.contains("m1"));

        directory.remove_sync_destination("acme", "s1", "M1").await.unwrap();
        let repo = directory.get_repo("acme", "s1").await.unwrap().unwrap();
        assert!(repo.sync_destination_container_repo_ids.is_empty());
    }
}
