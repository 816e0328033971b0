use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::ImageSyncTask;
use crate::adapter::RegistryAccess;
use crate::context::RegistryContext;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{PageIterator, RegistryManifest};
use crate::repo::ContainerRepo;

const UPSTREAM_CONTENT_TYPE: &str = "application/octet-stream";
const WATCHED_PAGE_SIZE: usize = 100;

/// The authoritative tag set of a watched repository.
#[async_trait]
pub trait UpstreamImages: fmt::Debug + Send + Sync {
    /// Every tag with the digest it points at.
    async fn list_images(
        &self,
        ctx: &RegistryContext,
        repo: &ContainerRepo,
    ) -> RegistryResult<Vec<(String, Digest)>>;
}

/// Asks the repository's own adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdapterImages;

#[async_trait]
impl UpstreamImages for AdapterImages {
    async fn list_images(
        &self,
        ctx: &RegistryContext,
        repo: &ContainerRepo,
    ) -> RegistryResult<Vec<(String, Digest)>> {
        let registry = ctx.registry_for(repo, &RegistryAccess::Pull).await?;
        registry.list_tags(repo).await
    }
}

/// Differences between the upstream tag set and the one last recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoChanges {
    /// New or moved tags, grouped by the digest they now point at.
    pub updated: BTreeMap<Digest, Vec<String>>,
    /// Tags which no longer exist upstream.
    pub removed: Vec<String>,
}

impl RepoChanges {
    /// Nothing changed.
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Result of a monitor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Another run holds the repository.
    Skipped,
    /// This run compared and recorded the tag set.
    Synced {
        /// What changed.
        changes: RepoChanges,
        /// Sync tasks enqueued.
        tasks: usize,
    },
}

/// Polls one watched repository and queues replication of its changes.
///
/// Any number of hosts may run a monitor for the same repository; the compare
/// and swap on the repository's sync count lets exactly one of them proceed.
#[derive(Debug, Clone)]
pub struct RepoMonitorTask {
    domain: String,
    repo_id: String,
    sync_count: u64,
    upstream: Arc<dyn UpstreamImages>,
}

impl RepoMonitorTask {
    /// A monitor for `repo`, as last read from the directory.
    pub fn new(repo: &ContainerRepo) -> Self {
        Self {
            domain: repo.domain.clone(),
            repo_id: repo.id.clone(),
            sync_count: repo.sync_count,
            upstream: Arc::new(AdapterImages),
        }
    }

    /// Read the upstream tag set from somewhere else.
    pub fn with_upstream(mut self, upstream: Arc<dyn UpstreamImages>) -> Self {
        self.upstream = upstream;
        self
    }

    /// Monitors for every repository of `domain` with mirror destinations.
    pub async fn watched(ctx: &RegistryContext, domain: &str) -> RegistryResult<Vec<Self>> {
        let mut monitors = Vec::new();
        let mut page = PageIterator::first(WATCHED_PAGE_SIZE);
        loop {
            let repos = ctx.repos.list_repos(domain, &page).await?;
            monitors.extend(
                repos
                    .items
                    .iter()
                    .filter(|repo| !repo.sync_destination_container_repo_ids.is_empty())
                    .map(Self::new),
            );
            match repos.next {
                Some(next) => page.marker = Some(next),
                None => return Ok(monitors),
            }
        }
    }

    /// Take the repository lock, then compare and record its tags.
    #[tracing::instrument(skip_all, fields(domain = %self.domain, repo = %self.repo_id))]
    pub async fn run(&self, ctx: &RegistryContext) -> RegistryResult<MonitorOutcome> {
        let acquired = ctx
            .repos
            .increment_sync_count(&self.domain, &self.repo_id, self.sync_count)
            .await?;
        if !acquired {
            tracing::debug!(sync_count = self.sync_count, "Failed to acquire lock");
            return Ok(MonitorOutcome::Skipped);
        }

        let repo = ctx
            .repos
            .get_repo(&self.domain, &self.repo_id)
            .await?
            .ok_or_else(|| RegistryError::repo_id_not_found(&self.domain, &self.repo_id))?;

        let upstream = self.upstream.list_images(ctx, &repo).await?;
        let recorded = ctx
            .manifests
            .list_multi_tagged(&repo.domain, &repo.id)
            .await?;
        let changes = Self::find_changes(&recorded, upstream);
        let tasks = Self::save_changes(ctx, &repo, &changes).await?;
        tracing::info!(
            updated = changes.updated.len(),
            removed = changes.removed.len(),
            tasks,
            "Repository synced"
        );
        Ok(MonitorOutcome::Synced { changes, tasks })
    }

    /// Compare the upstream tags with the recorded ones.
    ///
    /// `recorded` groups tags by digest and holds no digest-alias rows.
    pub fn find_changes(
        recorded: &BTreeMap<Digest, Vec<String>>,
        upstream: Vec<(String, Digest)>,
    ) -> RepoChanges {
        let mut known: BTreeMap<&str, &Digest> = recorded
            .iter()
            .flat_map(|(digest, tags)| tags.iter().map(move |tag| (tag.as_str(), digest)))
            .collect();

        let mut changes = RepoChanges::default();
        let mut seen = BTreeSet::new();
        for (tag, digest) in upstream {
            if Digest::is_digest(&tag) || !seen.insert(tag.clone()) {
                continue;
            }
            if known.remove(tag.as_str()) == Some(&digest) {
                continue;
            }
            changes.updated.entry(digest).or_default().push(tag);
        }
        changes.removed = known.into_keys().map(str::to_owned).collect();
        changes
    }

    /// Record `changes` and queue them for every live mirror of `repo`.
    ///
    /// Mirror destinations which no longer exist are dropped from the repository.
    /// Returns the number of tasks enqueued.
    pub async fn save_changes(
        ctx: &RegistryContext,
        repo: &ContainerRepo,
        changes: &RepoChanges,
    ) -> RegistryResult<usize> {
        for tag in &changes.removed {
            ctx.manifests.remove(&repo.domain, &repo.id, tag).await?;
        }
        for (digest, tags) in &changes.updated {
            for tag in tags {
                ctx.manifests
                    .put(RegistryManifest {
                        domain: repo.domain.clone(),
                        container_repo_id: repo.id.clone(),
                        tag: tag.clone(),
                        manifest_id: digest.clone(),
                        content_type: UPSTREAM_CONTENT_TYPE.to_owned(),
                        digests: BTreeSet::new(),
                        push_time: Utc::now(),
                        uploaded_by: repo.domain.clone(),
                        virtual_size: None,
                    })
                    .await?;
            }
        }
        ctx.repos
            .set_last_sync_time(&repo.domain, &repo.id, Utc::now())
            .await?;

        let mut active = BTreeSet::new();
        let mut tasks = 0;
        for destination_id in &repo.sync_destination_container_repo_ids {
            let Some(destination) = ctx.repos.get_repo(&repo.domain, destination_id).await? else {
                tracing::info!(destination = %destination_id, "Dropping deleted mirror destination");
                continue;
            };
            active.insert(destination.id.clone());

            let task = |image_tags: Vec<String>, manifest_digest_sha: Option<Digest>| ImageSyncTask {
                domain: repo.domain.clone(),
                source_repo_id: repo.id.clone(),
                destination_repo_id: destination.id.clone(),
                image_tags,
                manifest_digest_sha,
            };
            for (digest, tags) in &changes.updated {
                if ctx
                    .tasks
                    .add_task(task(tags.clone(), Some(digest.clone())).into())
                    .await?
                {
                    tasks += 1;
                }
            }
            if !changes.removed.is_empty()
                && ctx
                    .tasks
                    .add_task(task(changes.removed.clone(), None).into())
                    .await?
            {
                tasks += 1;
            }
        }

        if active != repo.sync_destination_container_repo_ids {
            ctx.repos
                .set_sync_destinations(&repo.domain, &repo.id, active)
                .await?;
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_real_deltas_survive() {
        let d1 = Digest::of(b"one");
        let d2 = Digest::of(b"two");
        let d3 = Digest::of(b"three");
        let recorded = BTreeMap::from([
            (d1.clone(), vec!["v0".to_owned(), "v1".to_owned()]),
            (d2.clone(), vec!["latest".to_owned()]),
        ]);
        let upstream = vec![
            ("v1".to_owned(), d1.clone()),
            ("latest".to_owned(), d3.clone()),
            ("v2".to_owned(), d3.clone()),
            (d3.to_string(), d3.clone()),
        ];

        let changes = RepoMonitorTask::find_changes(&recorded, upstream);
        assert_eq!(changes.removed, ["v0"]);
        assert_eq!(
            changes.updated,
            BTreeMap::from([(d3, vec!["latest".to_owned(), "v2".to_owned()])])
        );
    }

    #[test]
    fn unchanged_tags_produce_nothing() {
        let d1 = Digest::of(b"one");
        let recorded = BTreeMap::from([(d1.clone(), vec!["v1".to_owned()])]);
        let changes = RepoMonitorTask::find_changes(&recorded, vec![("v1".to_owned(), d1)]);
        assert!(changes.is_empty());
    }
}
