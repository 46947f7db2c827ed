use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use url::Url;

use crate::fingerprint::sha256_hex;
use crate::links::FileLink;
use crate::model::{ChangeId, DownloadedFile, MonitoredPage, NewDownloadedFile, PageChange};
use crate::store::Store;

const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    root: PathBuf,
    max_concurrency: usize,
}

#[derive(Debug)]
enum Outcome {
    Stored(NewDownloadedFile),
    /// Same bytes as a file already recorded or claimed earlier in the batch.
    DuplicateContent { url: String, hash: String },
}

type ClaimedHashes = Arc<Mutex<HashSet<String>>>;

impl Downloader {
    pub fn new(client: reqwest::Client, root: impl Into<PathBuf>, max_concurrency: usize) -> Self {
        Self {
            client,
            root: root.into(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Downloads every link not yet recorded for `page` and records the
    /// survivors in one transaction. Returns exactly the recorded rows.
    ///
    /// A failed download only shows up as a missing row; nothing is retried.
    pub async fn fetch_all(
        &self,
        store: &dyn Store,
        page: &MonitoredPage,
        change: Option<&PageChange>,
        links: &[FileLink],
    ) -> anyhow::Result<Vec<DownloadedFile>> {
        if links.is_empty() {
            return Ok(Vec::new());
        }

        let keys = store
            .file_keys(page.id)
            .await
            .context("load recorded file keys")?;
        let claimed: ClaimedHashes = Arc::new(Mutex::new(keys.hashes));
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let page_dir = self.root.join(page_dir_name(page));
        let change_id = change.map(|c| c.id);

        let mut tasks = JoinSet::new();
        let mut requested = 0_usize;
        for (index, link) in links.iter().enumerate() {
            if keys.urls.contains(&link.url) {
                tracing::debug!(page_id = page.id, url = %link.url, "file url already recorded; skipping");
                continue;
            }
            requested += 1;

            let client = self.client.clone();
            let link = link.clone();
            let page_dir = page_dir.clone();
            let claimed = Arc::clone(&claimed);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let result = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .context("download limiter closed")?;
                    download_one(&client, &link, &page_dir, change_id, &claimed).await
                }
                .await;
                (index, link.url, result)
            });
        }

        let mut stored: Vec<(usize, NewDownloadedFile)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, url, result) = joined.context("join download task")?;
            match result {
                Ok(Outcome::Stored(file)) => stored.push((index, file)),
                Ok(Outcome::DuplicateContent { url, hash }) => {
                    tracing::debug!(page_id = page.id, %url, %hash, "same content already recorded; discarding");
                }
                Err(err) => {
                    tracing::warn!(page_id = page.id, %url, ?err, "download failed");
                }
            }
        }
        stored.sort_by_key(|(index, _)| *index);

        let new_files: Vec<NewDownloadedFile> = stored.into_iter().map(|(_, file)| file).collect();
        let recorded = store
            .insert_files(page.id, new_files)
            .await
            .context("record downloaded files")?;

        tracing::info!(
            page_id = page.id,
            candidates = links.len(),
            requested,
            recorded = recorded.len(),
            "downloads finished"
        );
        Ok(recorded)
    }
}

async fn download_one(
    client: &reqwest::Client,
    link: &FileLink,
    page_dir: &Path,
    change_id: Option<ChangeId>,
    claimed: &ClaimedHashes,
) -> anyhow::Result<Outcome> {
    let url = Url::parse(&link.url).with_context(|| format!("parse file url: {}", link.url))?;
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {}", link.url))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("GET {} returned {status}", link.url);
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("read body: {}", link.url))?;
    let hash = sha256_hex(&bytes);

    if !claim_hash(claimed, &hash) {
        return Ok(Outcome::DuplicateContent {
            url: link.url.clone(),
            hash,
        });
    }

    let downloaded_at = Utc::now();
    let stored_path = match write_new_file(page_dir, &link.filename, downloaded_at, &bytes).await
    {
        Ok(path) => path,
        Err(err) => {
            release_hash(claimed, &hash);
            return Err(err);
        }
    };

    Ok(Outcome::Stored(NewDownloadedFile {
        change_id,
        original_url: link.url.clone(),
        original_filename: link.filename.clone(),
        stored_path: stored_path.to_string_lossy().to_string(),
        file_size: bytes.len() as u64,
        content_type,
        content_hash: Some(hash),
        downloaded_at,
    }))
}

fn claim_hash(claimed: &ClaimedHashes, hash: &str) -> bool {
    let mut set = claimed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    set.insert(hash.to_owned())
}

fn release_hash(claimed: &ClaimedHashes, hash: &str) {
    let mut set = claimed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    set.remove(hash);
}

/// Writes `bytes` under `{page_dir}/{YYYY-MM-DD}/{stem}_{timestamp}{ext}`,
/// never replacing an existing file.
async fn write_new_file(
    page_dir: &Path,
    filename: &str,
    now: DateTime<Utc>,
    bytes: &[u8],
) -> anyhow::Result<PathBuf> {
    let dir = page_dir.join(now.format("%Y-%m-%d").to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("create download dir: {}", dir.display()))?;

    let base_name = stored_file_name(filename, now);
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            base_name.clone()
        } else {
            with_counter(&base_name, attempt)
        };
        let path = dir.join(name);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        let mut file = match file {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("create file: {}", path.display()));
            }
        };
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        if let Err(err) = written {
            drop(file);
            if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), ?remove_err, "remove partial download");
            }
            return Err(err).with_context(|| format!("write file: {}", path.display()));
        }
        return Ok(path);
    }

    anyhow::bail!(
        "no free file name for {base_name} in {} after {MAX_NAME_ATTEMPTS} attempts",
        dir.display()
    )
}

pub fn stored_file_name(filename: &str, now: DateTime<Utc>) -> String {
    let filename = if filename.is_empty() {
        "download"
    } else {
        filename
    };
    let (stem, ext) = split_extension(filename);
    let timestamp = now.format("%Y%m%d_%H%M%S_%6f");
    format!("{stem}_{timestamp}{ext}")
}

fn with_counter(name: &str, counter: u32) -> String {
    let (stem, ext) = split_extension(name);
    format!("{stem}-{counter}{ext}")
}

/// Splits `name` into stem and extension (with its dot). A leading dot is
/// part of the stem.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Directory for a page's downloads: the sanitized page name, or the host
/// with dots replaced when the page has no name.
pub fn page_dir_name(page: &MonitoredPage) -> String {
    if let Some(name) = page.name.as_deref().filter(|n| !n.trim().is_empty()) {
        return sanitize_name(name);
    }
    let host = Url::parse(&page.url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
        .unwrap_or_else(|| "unknown_host".to_owned());
    host.replace('.', "_")
}

pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
