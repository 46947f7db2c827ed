use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;

use crate::app::check_lock::CheckLocks;
use crate::config::Config;
use crate::detect::{ChangeDetector, DetectState};
use crate::download::Downloader;
use crate::fetch::{Fetcher, build_client};
use crate::model::{ChangeId, MonitoredPage, PageId};
use crate::notify::{ChangeEvent, LogNotifier, Notifier, NotifierSet, WebhookNotifier};
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("page not found: {0}")]
    PageNotFound(PageId),
    #[error("a check of page {0} is already running")]
    InProgress(PageId),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Skipped,
    NoContent,
    Unchanged,
    Changed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub page_id: PageId,
    pub page_name: Option<String>,
    pub url: String,
    pub status: CheckStatus,
    pub changed: bool,
    pub change_id: Option<ChangeId>,
    pub files_found: usize,
    pub files_downloaded: usize,
    pub notifications: BTreeMap<String, bool>,
}

/// Runs one page check end to end: detect, extract, download, notify.
pub struct CheckRunner {
    store: Arc<dyn Store>,
    detector: ChangeDetector,
    downloader: Downloader,
    notifiers: NotifierSet,
    check_locks: Option<CheckLocks>,
}

impl CheckRunner {
    pub fn new(
        store: Arc<dyn Store>,
        detector: ChangeDetector,
        downloader: Downloader,
        notifiers: NotifierSet,
    ) -> Self {
        Self {
            store,
            detector,
            downloader,
            notifiers,
            check_locks: None,
        }
    }

    /// Serializes checks of a page across every process using `locks`.
    pub fn with_check_locks(mut self, locks: CheckLocks) -> Self {
        self.check_locks = Some(locks);
        self
    }

    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let client = build_client(&config.user_agent, config.fetch_timeout())
            .context("build http client")?;
        let fetcher = Fetcher::with_client(client.clone());
        let downloader = Downloader::new(
            client.clone(),
            config.download_dir(),
            config.max_concurrent_downloads,
        );

        let mut channels: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if let Some(url) = &config.webhook_url {
            channels.push(Arc::new(WebhookNotifier::new(client, url.clone())));
        }

        Ok(Self::new(
            store,
            ChangeDetector::new(fetcher),
            downloader,
            NotifierSet::new(channels),
        )
        .with_check_locks(CheckLocks::new(config.data_dir.join("locks"))))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Entry point for dispatched jobs; failures end up in the log only.
    pub async fn run_job(&self, page_id: PageId) {
        match self.check_page(page_id).await {
            Ok(outcome) => {
                tracing::debug!(page_id, status = ?outcome.status, "check finished");
            }
            Err(CheckError::InProgress(_)) => {
                tracing::info!(page_id, "page is being checked by another process; skipping");
            }
            Err(err) => {
                tracing::error!(page_id, ?err, "check failed");
            }
        }
    }

    pub async fn check_page(&self, page_id: PageId) -> Result<CheckOutcome, CheckError> {
        let mut page = self.load_page(page_id).await?;
        let _lock = match &self.check_locks {
            Some(locks) if page.is_active => {
                let lock = locks
                    .try_lock(page_id)
                    .context("lock page for check")?
                    .ok_or(CheckError::InProgress(page_id))?;
                // Pick up any check committed before the lock was taken.
                page = self.load_page(page_id).await?;
                Some(lock)
            }
            _ => None,
        };

        let mut outcome = CheckOutcome {
            page_id,
            page_name: page.name.clone(),
            url: page.url.clone(),
            status: CheckStatus::Skipped,
            changed: false,
            change_id: None,
            files_found: 0,
            files_downloaded: 0,
            notifications: BTreeMap::new(),
        };
        if !page.is_active {
            tracing::info!(page_id, "page is not active; skipping check");
            return Ok(outcome);
        }

        let detection = self
            .detector
            .check(self.store.as_ref(), &page)
            .await
            .context("detect change")?;
        outcome.status = match detection.state {
            DetectState::NoContent => CheckStatus::NoContent,
            DetectState::Unchanged => CheckStatus::Unchanged,
            DetectState::Changed => CheckStatus::Changed,
        };
        outcome.changed = detection.changed();

        let Some(change) = detection.change else {
            return Ok(outcome);
        };
        outcome.change_id = Some(change.id);
        outcome.files_found = detection.file_links.len();

        let files = self
            .downloader
            .fetch_all(
                self.store.as_ref(),
                &page,
                Some(&change),
                &detection.file_links,
            )
            .await
            .context("download files")?;
        outcome.files_downloaded = files.len();

        let event = ChangeEvent {
            page: &page,
            change: &change,
            files: &files,
        };
        outcome.notifications = self.notifiers.notify_all(&event).await;

        Ok(outcome)
    }

    async fn load_page(&self, page_id: PageId) -> Result<MonitoredPage, CheckError> {
        let page = self
            .store
            .get_page(page_id)
            .await
            .context("load page")?
            .ok_or(CheckError::PageNotFound(page_id))?;
        Ok(page)
    }
}
