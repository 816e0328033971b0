//! Mirror replication.
//!
//! [`RepoMonitorTask`] watches a source repository and turns tag changes into
//! [`SyncTask`]s on a [`TaskQueue`]. Tasks are plain data so a durable queue can
//! ship them to other hosts; [`SyncWorker`] drains the in-process queue.

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::context::RegistryContext;
use crate::error::RegistryResult;

mod image;
mod monitor;
mod repo;

pub use self::image::ImageSyncTask;
pub use self::monitor::{
    AdapterImages, MonitorOutcome, RepoChanges, RepoMonitorTask, UpstreamImages,
};
pub use self::repo::RepoSyncTask;

/// A unit of replication work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entityType")]
pub enum SyncTask {
    /// Bring one image (or its removal) into a mirror.
    #[serde(rename = "sync:image")]
    Image(ImageSyncTask),
    /// Fan out every image of a source repository into a mirror.
    #[serde(rename = "sync:repo")]
    Repo(RepoSyncTask),
}

impl SyncTask {
    /// Tasks sharing a lock id must not run concurrently.
    pub fn lock_id(&self) -> String {
        let (domain, destination) = match self {
            SyncTask::Image(task) => (&task.domain, &task.destination_repo_id),
            SyncTask::Repo(task) => (&task.domain, &task.destination_repo_id),
        };
        format!("{domain}/{destination}")
    }

    /// Serialize for a durable queue.
    pub fn to_state(&self) -> RegistryResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restore a task serialized with [`SyncTask::to_state`].
    pub fn from_state(state: &str) -> RegistryResult<Self> {
        Ok(serde_json::from_str(state)?)
    }

    /// Perform the task.
    pub async fn run(&self, ctx: &RegistryContext) -> RegistryResult<()> {
        match self {
            SyncTask::Image(task) => task.run(ctx).await,
            SyncTask::Repo(task) => task.run(ctx).await,
        }
    }
}

impl From<ImageSyncTask> for SyncTask {
    fn from(task: ImageSyncTask) -> Self {
        SyncTask::Image(task)
    }
}

impl From<RepoSyncTask> for SyncTask {
    fn from(task: RepoSyncTask) -> Self {
        SyncTask::Repo(task)
    }
}

/// Where sync tasks wait to be run.
#[async_trait]
pub trait TaskQueue: fmt::Debug + Send + Sync {
    /// Enqueue a task. Returns `false` when an identical task is already waiting.
    async fn add_task(&self, task: SyncTask) -> RegistryResult<bool>;

    /// Take the oldest task.
    async fn pop(&self) -> RegistryResult<Option<SyncTask>>;

    /// Number of waiting tasks.
    async fn pending(&self) -> RegistryResult<usize>;
}

/// A FIFO queue held in process memory.
#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    tasks: Mutex<VecDeque<SyncTask>>,
}

impl MemoryTaskQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn add_task(&self, task: SyncTask) -> RegistryResult<bool> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains(&task) {
            return Ok(false);
        }
        tasks.push_back(task);
        Ok(true)
    }

    async fn pop(&self) -> RegistryResult<Option<SyncTask>> {
        Ok(self.tasks.lock().await.pop_front())
    }

    async fn pending(&self) -> RegistryResult<usize> {
        Ok(self.tasks.lock().await.len())
    }
}

/// Totals from one drain of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Tasks which finished.
    pub completed: usize,
    /// Lock ids and errors of tasks which failed.
    pub failed: Vec<(String, String)>,
}

/// Runs queued sync tasks one at a time.
#[derive(Debug, Clone)]
pub struct SyncWorker {
    ctx: RegistryContext,
}

impl SyncWorker {
    /// A worker draining `ctx.tasks`.
    pub fn new(ctx: RegistryContext) -> Self {
        Self { ctx }
    }

    /// Run tasks until the queue is empty, including any the tasks enqueue.
    ///
    /// A failed task is logged and dropped.
    #[tracing::instrument(skip_all)]
    pub async fn run_pending(&self) -> RegistryResult<SyncReport> {
        let mut report = SyncReport::default();
        while let Some(task) = self.ctx.tasks.pop().await? {
            let lock_id = task.lock_id();
            match task.run(&self.ctx).await {
                Ok(()) => report.completed += 1,
                Err(error) => {
                    tracing::warn!(%lock_id, %error, "Sync task failed");
                    report.failed.push((lock_id, error.to_string()));
                }
            }
        }
        Ok(report)
    }
}
