use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::app::dispatcher::{DispatchOutcome, Job, JobDispatcher};
use crate::model::Frequency;
use crate::store::Store;

/// A page is due when it was never checked or its interval has elapsed.
pub fn is_due(
    frequency: Frequency,
    last_checked_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match last_checked_at {
        None => true,
        Some(last) => now >= last + frequency.interval(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub total: usize,
    pub scheduled: usize,
    pub skipped: usize,
    pub in_flight: usize,
    pub failed: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn JobDispatcher>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn JobDispatcher>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            interval,
        }
    }

    /// Dispatches every active page that is due at `now`. Pages that are not
    /// due are left for a later tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<TickSummary> {
        let pages = self
            .store
            .list_active_pages()
            .await
            .context("load active pages")?;

        let mut summary = TickSummary {
            total: pages.len(),
            ..TickSummary::default()
        };
        for page in pages {
            if !is_due(page.frequency, page.last_checked_at, now) {
                summary.skipped += 1;
                continue;
            }
            match self
                .dispatcher
                .dispatch(Job::CheckPage { page_id: page.id })
                .await
            {
                Ok(DispatchOutcome::Queued) => summary.scheduled += 1,
                Ok(DispatchOutcome::AlreadyInFlight) => summary.in_flight += 1,
                Err(err) => {
                    tracing::error!(page_id = page.id, ?err, "dispatch failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Ticks until `shutdown` resolves. Checks still running at that point
    /// are abandoned.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(interval_secs = self.interval.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(summary) => tracing::info!(
                            total = summary.total,
                            scheduled = summary.scheduled,
                            skipped = summary.skipped,
                            in_flight = summary.in_flight,
                            failed = summary.failed,
                            "scheduler tick"
                        ),
                        Err(err) => tracing::error!(?err, "scheduler tick failed"),
                    }
                }
            }
        }
    }
}
