use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::model::PageId;

/// Runs page jobs on the tokio runtime with a concurrency cap and at most
/// one queued-or-running job per page.
#[derive(Debug, Clone)]
pub struct InProcessQueue {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<PageId>>>,
}

impl InProcessQueue {
    pub fn new(max_concurrency: usize) -> Self {
        let permits = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_in_flight(&self, key: PageId) -> bool {
        lock(&self.in_flight).contains(&key)
    }

    /// Spawns `fut` unless a job for `key` is already queued or running.
    /// Returns whether the job was accepted.
    pub fn spawn_exclusive<F>(&self, key: PageId, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !lock(&self.in_flight).insert(key) {
            return false;
        }
        let guard = InFlightGuard {
            key,
            in_flight: Arc::clone(&self.in_flight),
        };

        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = semaphore.acquire_owned().await else {
                tracing::error!(key, "in-process queue semaphore is closed; dropping job");
                return;
            };
            fut.await;
        });
        true
    }
}

struct InFlightGuard {
    key: PageId,
    in_flight: Arc<Mutex<HashSet<PageId>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.key);
    }
}

fn lock(set: &Mutex<HashSet<PageId>>) -> std::sync::MutexGuard<'_, HashSet<PageId>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
