use std::path::{Path, PathBuf};

use anyhow::Context as _;
use fs2::FileExt;

use crate::model::PageId;

/// Per-page lock files under one directory, so a `check` started from the CLI
/// and the `watch` daemon never run the same page at once.
#[derive(Debug, Clone)]
pub struct CheckLocks {
    dir: PathBuf,
}

/// Held for the duration of one check; dropping it releases the page.
#[derive(Debug)]
pub struct CheckLockGuard {
    _file: std::fs::File,
}

impl CheckLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns `None` when another check of `page_id` holds the lock.
    pub fn try_lock(&self, page_id: PageId) -> anyhow::Result<Option<CheckLockGuard>> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create lock dir: {}", self.dir.display()))?;
        let path = self.dir.join(format!("page-{page_id}.lock"));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock: {}", path.display()))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(CheckLockGuard { _file: file })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err).with_context(|| format!("lock: {}", path.display())),
        }
    }
}
