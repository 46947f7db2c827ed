use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;

use crate::model::{DownloadedFile, MonitoredPage, PageChange};

/// One detected change with the files recorded for it.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChangeEvent<'a> {
    pub page: &'a MonitoredPage,
    pub change: &'a PageChange,
    pub files: &'a [DownloadedFile],
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &str;
    async fn notify(&self, event: &ChangeEvent<'_>) -> anyhow::Result<bool>;
}

/// Sends an event to every channel; a failing channel reports `false` and
/// does not affect the others.
#[derive(Clone, Default)]
pub struct NotifierSet {
    channels: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self { channels }
    }

    pub async fn notify_all(&self, event: &ChangeEvent<'_>) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for channel in &self.channels {
            let ok = match channel.notify(event).await {
                Ok(ok) => ok,
                Err(err) => {
                    tracing::warn!(
                        channel = channel.channel(),
                        change_id = event.change.id,
                        ?err,
                        "notification failed"
                    );
                    false
                }
            };
            results.insert(channel.channel().to_owned(), ok);
        }
        results
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &ChangeEvent<'_>) -> anyhow::Result<bool> {
        tracing::info!(
            page_id = event.page.id,
            page = event.page.label(),
            change_id = event.change.id,
            files = event.files.len(),
            "page changed"
        );
        for file in event.files {
            tracing::info!(
                change_id = event.change.id,
                url = %file.original_url,
                path = %file.stored_path,
                size = file.file_size,
                "downloaded file"
            );
        }
        Ok(true)
    }
}

/// Posts the event as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &ChangeEvent<'_>) -> anyhow::Result<bool> {
        let resp = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("POST {}", self.url))?;
        if !resp.status().is_success() {
            tracing::warn!(url = %self.url, status = resp.status().as_u16(), "webhook rejected event");
            return Ok(false);
        }
        Ok(true)
    }
}
