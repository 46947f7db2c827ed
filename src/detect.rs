use anyhow::Context as _;
use chrono::Utc;
use url::Url;

use crate::fetch::Fetcher;
use crate::fingerprint::fingerprint;
use crate::links::{FileLink, find_files};
use crate::model::{CHANGE_TYPE_CONTENT_CHANGED, ChangeDetails, MonitoredPage, PageChange};
use crate::store::{CheckCommit, NewChange, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectState {
    /// Fetch failed or the server returned no body (including 304).
    NoContent,
    Unchanged,
    Changed,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub state: DetectState,
    pub change: Option<PageChange>,
    pub file_links: Vec<FileLink>,
}

impl Detection {
    pub fn changed(&self) -> bool {
        self.state == DetectState::Changed
    }

    fn quiet(state: DetectState) -> Self {
        Self {
            state,
            change: None,
            file_links: Vec::new(),
        }
    }
}

pub struct ChangeDetector {
    fetcher: Fetcher,
}

impl ChangeDetector {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    /// Runs one check of `page` and commits its check-state as a single unit
    /// of work. A commit failure fails the check.
    pub async fn check(
        &self,
        store: &dyn Store,
        page: &MonitoredPage,
    ) -> anyhow::Result<Detection> {
        let fetched = match self.fetcher.fetch(&page.url, &page.validators()).await {
            Ok(fetched) => Some(fetched),
            Err(err) => {
                tracing::warn!(page_id = page.id, url = %page.url, %err, "fetch failed");
                None
            }
        };
        let checked_at = Utc::now();

        let Some((fetched, body)) = fetched.and_then(|mut f| f.body.take().map(|body| (f, body)))
        else {
            store
                .commit_check(CheckCommit {
                    page_id: page.id,
                    checked_at,
                    etag: None,
                    last_modified: None,
                    change: None,
                })
                .await
                .context("commit check")?;
            return Ok(Detection::quiet(DetectState::NoContent));
        };

        let new_hash = fingerprint(&body, page.css_selector.as_deref());
        let etag = fetched.etag().map(str::to_owned);
        let last_modified = fetched.last_modified().map(str::to_owned);

        if page.last_content_hash.as_deref() == Some(new_hash.as_str()) {
            store
                .commit_check(CheckCommit {
                    page_id: page.id,
                    checked_at,
                    etag,
                    last_modified,
                    change: None,
                })
                .await
                .context("commit check")?;
            tracing::debug!(page_id = page.id, "content unchanged");
            return Ok(Detection::quiet(DetectState::Unchanged));
        }

        let details = ChangeDetails {
            previous_hash: page.last_content_hash.clone(),
            new_hash: new_hash.clone(),
        };
        let details = serde_json::to_string(&details).context("serialize change details")?;
        let change = store
            .commit_check(CheckCommit {
                page_id: page.id,
                checked_at,
                etag,
                last_modified,
                change: Some(NewChange {
                    content_hash: new_hash.clone(),
                    change_type: CHANGE_TYPE_CONTENT_CHANGED.to_owned(),
                    details: Some(details),
                }),
            })
            .await
            .context("commit check")?
            .ok_or_else(|| anyhow::anyhow!("store did not record change for page {}", page.id))?;

        let base_url =
            Url::parse(&page.url).with_context(|| format!("parse page url: {}", page.url))?;
        let file_links = find_files(&body, &base_url);
        tracing::info!(
            page_id = page.id,
            change_id = change.id,
            hash = %new_hash,
            files = file_links.len(),
            "content changed"
        );

        Ok(Detection {
            state: DetectState::Changed,
            change: Some(change),
            file_links,
        })
    }
}
