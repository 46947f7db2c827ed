use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use fs2::FileExt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::model::{
    ChangeId, DownloadedFile, FileId, MonitoredPage, NewDownloadedFile, NewPage, PageChange,
    PageId, PageUpdate,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("page not found: {0}")]
    PageNotFound(PageId),
    #[error("a page with url {0} already exists")]
    DuplicateUrl(String),
    #[error("file already recorded for page {page_id}: {key}")]
    DuplicateFile { page_id: PageId, key: String },
    #[error("invalid page: {0}")]
    Invalid(String),
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// Everything a single check writes, committed as one unit of work.
#[derive(Debug, Clone)]
pub struct CheckCommit {
    pub page_id: PageId,
    pub checked_at: DateTime<Utc>,
    /// `None` leaves the cached validator untouched.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub change: Option<NewChange>,
}

#[derive(Debug, Clone)]
pub struct NewChange {
    pub content_hash: String,
    pub change_type: String,
    pub details: Option<String>,
}

/// URL and content-hash keys of every file already recorded for a page.
#[derive(Debug, Clone, Default)]
pub struct FileKeys {
    pub urls: HashSet<String>,
    pub hashes: HashSet<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_page(&self, page: NewPage) -> Result<MonitoredPage, StoreError>;
    async fn get_page(&self, page_id: PageId) -> Result<Option<MonitoredPage>, StoreError>;
    async fn list_pages(&self) -> Result<Vec<MonitoredPage>, StoreError>;
    async fn list_active_pages(&self) -> Result<Vec<MonitoredPage>, StoreError>;
    async fn update_page(
        &self,
        page_id: PageId,
        update: PageUpdate,
    ) -> Result<MonitoredPage, StoreError>;
    /// Removes the page with its changes and files. Returns the removed page.
    async fn delete_page(&self, page_id: PageId) -> Result<MonitoredPage, StoreError>;

    async fn commit_check(&self, commit: CheckCommit) -> Result<Option<PageChange>, StoreError>;

    async fn list_changes(&self, page_id: PageId) -> Result<Vec<PageChange>, StoreError>;
    async fn list_files(&self, page_id: PageId) -> Result<Vec<DownloadedFile>, StoreError>;
    async fn get_file(&self, file_id: FileId) -> Result<Option<DownloadedFile>, StoreError>;
    async fn file_keys(&self, page_id: PageId) -> Result<FileKeys, StoreError>;
    async fn insert_files(
        &self,
        page_id: PageId,
        files: Vec<NewDownloadedFile>,
    ) -> Result<Vec<DownloadedFile>, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Database {
    next_page_id: PageId,
    next_change_id: ChangeId,
    next_file_id: FileId,
    pages: BTreeMap<PageId, MonitoredPage>,
    changes: BTreeMap<ChangeId, PageChange>,
    files: BTreeMap<FileId, DownloadedFile>,
}

impl Database {
    fn page(&self, page_id: PageId) -> Result<&MonitoredPage, StoreError> {
        self.pages
            .get(&page_id)
            .ok_or(StoreError::PageNotFound(page_id))
    }

    fn page_mut(&mut self, page_id: PageId) -> Result<&mut MonitoredPage, StoreError> {
        self.pages
            .get_mut(&page_id)
            .ok_or(StoreError::PageNotFound(page_id))
    }

    fn ensure_url_free(&self, url: &str, except: Option<PageId>) -> Result<(), StoreError> {
        let taken = self
            .pages
            .values()
            .any(|page| page.url == url && Some(page.id) != except);
        if taken {
            return Err(StoreError::DuplicateUrl(url.to_owned()));
        }
        Ok(())
    }

    fn create_page(&mut self, new: NewPage) -> Result<MonitoredPage, StoreError> {
        let url = validate_page_url(&new.url)?;
        self.ensure_url_free(&url, None)?;

        self.next_page_id += 1;
        let page = MonitoredPage {
            id: self.next_page_id,
            name: new.name,
            url,
            css_selector: normalize_selector(new.css_selector),
            frequency: new.frequency,
            is_active: new.is_active,
            last_checked_at: None,
            last_changed_at: None,
            last_content_hash: None,
            last_etag: None,
            last_modified: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.pages.insert(page.id, page.clone());
        Ok(page)
    }

    fn update_page(
        &mut self,
        page_id: PageId,
        update: PageUpdate,
    ) -> Result<MonitoredPage, StoreError> {
        let url = update.url.as_deref().map(validate_page_url).transpose()?;
        if let Some(url) = &url {
            self.ensure_url_free(url, Some(page_id))?;
        }

        let page = self.page_mut(page_id)?;
        if let Some(name) = update.name {
            page.name = Some(name);
        }
        if let Some(url) = url {
            page.url = url;
        }
        if let Some(selector) = update.css_selector {
            page.css_selector = normalize_selector(selector);
        }
        if let Some(frequency) = update.frequency {
            page.frequency = frequency;
        }
        if let Some(is_active) = update.is_active {
            page.is_active = is_active;
        }
        page.updated_at = Some(Utc::now());
        Ok(page.clone())
    }

    fn delete_page(&mut self, page_id: PageId) -> Result<MonitoredPage, StoreError> {
        let page = self
            .pages
            .remove(&page_id)
            .ok_or(StoreError::PageNotFound(page_id))?;
        self.changes.retain(|_, change| change.page_id != page_id);
        self.files.retain(|_, file| file.page_id != page_id);
        Ok(page)
    }

    fn commit_check(&mut self, commit: CheckCommit) -> Result<Option<PageChange>, StoreError> {
        let page = self.page_mut(commit.page_id)?;
        page.last_checked_at = Some(commit.checked_at);
        if let Some(etag) = commit.etag {
            page.last_etag = Some(etag);
        }
        if let Some(last_modified) = commit.last_modified {
            page.last_modified = Some(last_modified);
        }

        let Some(new_change) = commit.change else {
            return Ok(None);
        };
        page.last_content_hash = Some(new_change.content_hash);
        page.last_changed_at = Some(commit.checked_at);

        self.next_change_id += 1;
        let change = PageChange {
            id: self.next_change_id,
            page_id: commit.page_id,
            detected_at: commit.checked_at,
            change_type: new_change.change_type,
            details: new_change.details,
        };
        self.changes.insert(change.id, change.clone());
        Ok(Some(change))
    }

    fn file_keys(&self, page_id: PageId) -> FileKeys {
        let mut keys = FileKeys::default();
        for file in self.files.values().filter(|file| file.page_id == page_id) {
            keys.urls.insert(file.original_url.clone());
            if let Some(hash) = &file.content_hash {
                keys.hashes.insert(hash.clone());
            }
        }
        keys
    }

    fn insert_files(
        &mut self,
        page_id: PageId,
        files: Vec<NewDownloadedFile>,
    ) -> Result<Vec<DownloadedFile>, StoreError> {
        self.page(page_id)?;
        let mut keys = self.file_keys(page_id);

        let mut inserted = Vec::with_capacity(files.len());
        for new in files {
            if !keys.urls.insert(new.original_url.clone()) {
                return Err(StoreError::DuplicateFile {
                    page_id,
                    key: new.original_url,
                });
            }
            if let Some(hash) = &new.content_hash {
                if !keys.hashes.insert(hash.clone()) {
                    return Err(StoreError::DuplicateFile {
                        page_id,
                        key: hash.clone(),
                    });
                }
            }

            self.next_file_id += 1;
            let file = DownloadedFile {
                id: self.next_file_id,
                page_id,
                change_id: new.change_id,
                original_url: new.original_url,
                original_filename: new.original_filename,
                stored_path: new.stored_path,
                file_size: new.file_size,
                content_type: new.content_type,
                content_hash: new.content_hash,
                downloaded_at: new.downloaded_at,
            };
            self.files.insert(file.id, file.clone());
            inserted.push(file);
        }
        Ok(inserted)
    }
}

fn validate_page_url(raw: &str) -> Result<String, StoreError> {
    let url = url::Url::parse(raw.trim())
        .map_err(|err| StoreError::Invalid(format!("url {raw:?}: {err}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(StoreError::Invalid(format!("url must be http/https: {url}")));
    }
    Ok(url.to_string())
}

fn normalize_selector(selector: Option<String>) -> Option<String> {
    selector
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// Store backed by a JSON snapshot file that several processes may share
/// (the `watch` daemon alongside one-shot CLI commands).
///
/// Every read reloads the snapshot under a shared lock. Every unit of work
/// takes an exclusive lock, reloads, applies the change to a copy, writes the
/// copy and only then replaces the cached state, so a failed write leaves
/// nothing behind. [`JsonStore::in_memory`] skips the file and the locks.
#[derive(Debug)]
pub struct JsonStore {
    path: Option<PathBuf>,
    db: Mutex<Database>,
}

impl JsonStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let db = {
            let _lock = SnapshotLock::acquire(&path, LockMode::Shared).await?;
            load(&path).await?
        };
        Ok(Self {
            path: Some(path),
            db: Mutex::new(db),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            db: Mutex::new(Database::default()),
        }
    }

    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("pagewatch.json")
    }

    async fn read<T>(&self, f: impl FnOnce(&Database) -> T) -> Result<T, StoreError> {
        let mut db = self.db.lock().await;
        if let Some(path) = &self.path {
            let _lock = SnapshotLock::acquire(path, LockMode::Shared).await?;
            *db = load(path).await?;
        }
        Ok(f(&db))
    }

    async fn transact<T>(
        &self,
        f: impl FnOnce(&mut Database) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut live = self.db.lock().await;
        let _lock = match &self.path {
            Some(path) => {
                let lock = SnapshotLock::acquire(path, LockMode::Exclusive).await?;
                *live = load(path).await?;
                Some(lock)
            }
            None => None,
        };

        let mut next = live.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            write_json_atomic(path, &next)
                .await
                .with_context(|| format!("write: {}", path.display()))?;
        }
        *live = next;
        Ok(out)
    }
}

#[async_trait]
impl Store for JsonStore {
    async fn create_page(&self, page: NewPage) -> Result<MonitoredPage, StoreError> {
        self.transact(|db| db.create_page(page)).await
    }

    async fn get_page(&self, page_id: PageId) -> Result<Option<MonitoredPage>, StoreError> {
        self.read(|db| db.pages.get(&page_id).cloned()).await
    }

    async fn list_pages(&self) -> Result<Vec<MonitoredPage>, StoreError> {
        self.read(|db| db.pages.values().cloned().collect()).await
    }

    async fn list_active_pages(&self) -> Result<Vec<MonitoredPage>, StoreError> {
        self.read(|db| {
            db.pages
                .values()
                .filter(|page| page.is_active)
                .cloned()
                .collect()
        })
        .await
    }

    async fn update_page(
        &self,
        page_id: PageId,
        update: PageUpdate,
    ) -> Result<MonitoredPage, StoreError> {
        self.transact(|db| db.update_page(page_id, update)).await
    }

    async fn delete_page(&self, page_id: PageId) -> Result<MonitoredPage, StoreError> {
        self.transact(|db| db.delete_page(page_id)).await
    }

    async fn commit_check(&self, commit: CheckCommit) -> Result<Option<PageChange>, StoreError> {
        self.transact(|db| db.commit_check(commit)).await
    }

    async fn list_changes(&self, page_id: PageId) -> Result<Vec<PageChange>, StoreError> {
        self.read(|db| -> Result<Vec<PageChange>, StoreError> {
            db.page(page_id)?;
            Ok(db
                .changes
                .values()
                .filter(|change| change.page_id == page_id)
                .cloned()
                .collect())
        })
        .await?
    }

    async fn list_files(&self, page_id: PageId) -> Result<Vec<DownloadedFile>, StoreError> {
        self.read(|db| -> Result<Vec<DownloadedFile>, StoreError> {
            db.page(page_id)?;
            Ok(db
                .files
                .values()
                .filter(|file| file.page_id == page_id)
                .cloned()
                .collect())
        })
        .await?
    }

    async fn get_file(&self, file_id: FileId) -> Result<Option<DownloadedFile>, StoreError> {
        self.read(|db| db.files.get(&file_id).cloned()).await
    }

    async fn file_keys(&self, page_id: PageId) -> Result<FileKeys, StoreError> {
        self.read(|db| db.file_keys(page_id)).await
    }

    async fn insert_files(
        &self,
        page_id: PageId,
        files: Vec<NewDownloadedFile>,
    ) -> Result<Vec<DownloadedFile>, StoreError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        self.transact(|db| db.insert_files(page_id, files)).await
    }
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock on `<snapshot>.lock`, released when dropped.
struct SnapshotLock {
    _file: std::fs::File,
}

impl SnapshotLock {
    async fn acquire(snapshot: &Path, mode: LockMode) -> anyhow::Result<Self> {
        let lock_path = snapshot.with_extension("lock");
        tokio::task::spawn_blocking(move || -> anyhow::Result<Self> {
            if let Some(parent) = lock_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create data dir: {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .with_context(|| format!("open lock: {}", lock_path.display()))?;
            match mode {
                LockMode::Shared => FileExt::lock_shared(&file),
                LockMode::Exclusive => FileExt::lock_exclusive(&file),
            }
            .with_context(|| format!("lock {mode:?}: {}", lock_path.display()))?;
            Ok(Self { _file: file })
        })
        .await
        .context("join lock task")?
    }
}

async fn load(path: &Path) -> anyhow::Result<Database> {
    let db = read_json(path)
        .await
        .with_context(|| format!("read: {}", path.display()))?
        .unwrap_or_default();
    Ok(db)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

/// Staging file for a snapshot write. Writers hold the exclusive lock, so one
/// fixed name per snapshot is enough.
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = staging_path(path);
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
