use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::app::queue::InProcessQueue;
use crate::app::runner::CheckRunner;
use crate::model::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    CheckPage { page_id: PageId },
}

impl Job {
    pub fn page_id(&self) -> PageId {
        match self {
            Job::CheckPage { page_id } => *page_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Queued,
    /// A job for the same page is already queued or running.
    AlreadyInFlight,
}

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: Job) -> anyhow::Result<DispatchOutcome>;
}

#[derive(Clone)]
pub struct InProcessJobDispatcher {
    queue: InProcessQueue,
    runner: Arc<CheckRunner>,
}

impl InProcessJobDispatcher {
    pub fn new(queue: InProcessQueue, runner: Arc<CheckRunner>) -> Self {
        Self { queue, runner }
    }
}

#[async_trait]
impl JobDispatcher for InProcessJobDispatcher {
    async fn dispatch(&self, job: Job) -> anyhow::Result<DispatchOutcome> {
        let page_id = job.page_id();
        let runner = Arc::clone(&self.runner);
        let accepted = self.queue.spawn_exclusive(page_id, async move {
            match job {
                Job::CheckPage { page_id } => runner.run_job(page_id).await,
            }
        });

        if !accepted {
            tracing::debug!(page_id, "check already in flight; not dispatching");
            return Ok(DispatchOutcome::AlreadyInFlight);
        }
        Ok(DispatchOutcome::Queued)
    }
}
