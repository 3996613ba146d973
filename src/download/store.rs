// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted store for the download collection.
//!
//! The collection is read and replaced as a whole. [`JsonFileStore`] writes
//! via temp file + atomic rename while holding an exclusive lock on a
//! sibling `.lock` file, so a crash never leaves a half-written list and two
//! processes never interleave writes.
//!
//! The per-write lock does not stop one process from replacing a collection
//! another process changed since it loaded. A process that keeps a registry
//! open across writes claims the file first with [`InstanceLock`] (see
//! [`JsonFileStore::with_instance_lock`]); a second claimant fails fast.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::Download;
use crate::error::StorageError;
use crate::locks::{resilient_read, resilient_write};

/// Default timeout for acquiring file locks (5 seconds)
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Current on-disk format version
const STATE_VERSION: u32 = 1;

/// Whole-collection persistence contract.
#[async_trait]
pub trait DownloadStore: Send + Sync {
    /// Read the full collection. A store that was never written is empty.
    async fn load(&self) -> Result<Vec<Download>, StorageError>;

    /// Replace the full collection.
    async fn save(&self, downloads: &[Download]) -> Result<(), StorageError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StateFileRef<'a> {
    version: u32,
    last_saved: DateTime<Utc>,
    downloads: &'a [Download],
}

/// Accepted on-disk layouts: the versioned document, or the bare array the
/// mobile app stored.
#[derive(Deserialize)]
#[serde(untagged)]
enum StateFile {
    Versioned {
        #[serde(default)]
        version: u32,
        downloads: Vec<Download>,
    },
    Legacy(Vec<Download>),
}

impl StateFile {
    fn into_downloads(self) -> Vec<Download> {
        match self {
            StateFile::Versioned { version, downloads } => {
                if version > STATE_VERSION {
                    tracing::warn!(
                        "STORE_VERSION_NEWER | version={} supported={}",
                        version,
                        STATE_VERSION
                    );
                }
                downloads
            }
            StateFile::Legacy(downloads) => downloads,
        }
    }
}

/// Exclusive claim on a download list for the lifetime of one owner.
///
/// Backed by an OS lock on `<stem>.owner.lock` next to the list, so it is
/// released when the handle drops or the process exits.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    _file: File,
}

impl InstanceLock {
    /// Claim the list at `store_path` without waiting.
    pub fn try_acquire(store_path: &Path) -> Result<Self, StorageError> {
        let path = store_path.with_extension("owner.lock");
        let file = JsonFileStore::open_lock_file(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!("INSTANCE_LOCKED | path={:?}", path);
                Ok(Self { path, _file: file })
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                tracing::debug!("INSTANCE_IN_USE | path={:?}", path);
                Err(StorageError::InUse { path })
            }
            Err(e) => Err(JsonFileStore::io_error(&path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// JSON file store with atomic writes and cross-process file locking.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_timeout: Duration,
    instance: Option<Arc<InstanceLock>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
            instance: None,
        }
    }

    /// Claim the list for this store, failing with [`StorageError::InUse`]
    /// while another owner holds it. The claim lives as long as the store.
    pub fn with_instance_lock(mut self) -> Result<Self, StorageError> {
        self.instance = Some(Arc::new(InstanceLock::try_acquire(&self.path)?));
        Ok(self)
    }

    /// Whether this store holds the instance claim on its list.
    pub fn is_owner(&self) -> bool {
        self.instance.is_some()
    }

    /// Override the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    fn io_error(path: &Path, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn open_lock_file(path: &Path) -> Result<File, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_error(parent, e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Self::io_error(path, e))
    }

    /// Acquire an exclusive lock with timeout.
    ///
    /// Returns the locked file handle; the lock is released when it drops.
    fn acquire_exclusive_lock_with_timeout(
        path: &Path,
        timeout: Duration,
    ) -> Result<File, StorageError> {
        let lock_file = Self::open_lock_file(path)?;
        let start = Instant::now();

        loop {
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(StorageError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(Self::io_error(path, e)),
            }
        }
    }

    /// Acquire a shared lock with timeout.
    fn acquire_shared_lock_with_timeout(
        path: &Path,
        timeout: Duration,
    ) -> Result<File, StorageError> {
        let lock_file = Self::open_lock_file(path)?;
        let start = Instant::now();

        loop {
            match FileExt::try_lock_shared(&lock_file) {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(StorageError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(Self::io_error(path, e)),
            }
        }
    }

    fn load_blocking(path: &Path, timeout: Duration) -> Result<Vec<Download>, StorageError> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let _lock_guard = Self::acquire_shared_lock_with_timeout(&Self::lock_path(path), timeout)?;

        let content = fs::read_to_string(path).map_err(|e| Self::io_error(path, e))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let state: StateFile =
            serde_json::from_str(&content).map_err(|source| StorageError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(state.into_downloads())
    }

    fn save_blocking(path: &Path, content: &[u8], timeout: Duration) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_error(parent, e))?;
        }

        // Held through the rename so readers never see the swap half-done
        let _lock_guard =
            Self::acquire_exclusive_lock_with_timeout(&Self::lock_path(path), timeout)?;

        let temp_path = path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| Self::io_error(&temp_path, e))?;

            temp_file
                .write_all(content)
                .map_err(|e| Self::io_error(&temp_path, e))?;
            temp_file
                .sync_all()
                .map_err(|e| Self::io_error(&temp_path, e))?;
        }

        fs::rename(&temp_path, path).map_err(|e| Self::io_error(path, e))?;
        Ok(())
    }
}

#[async_trait]
impl DownloadStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<Download>, StorageError> {
        let path = self.path.clone();
        let timeout = self.lock_timeout;
        let downloads = tokio::task::spawn_blocking(move || Self::load_blocking(&path, timeout))
            .await
            .map_err(|e| StorageError::Join(e.to_string()))??;

        tracing::debug!(
            "STORE_LOADED | path={:?} downloads={}",
            self.path,
            downloads.len()
        );
        Ok(downloads)
    }

    async fn save(&self, downloads: &[Download]) -> Result<(), StorageError> {
        let document = StateFileRef {
            version: STATE_VERSION,
            last_saved: Utc::now(),
            downloads,
        };
        let content = serde_json::to_vec_pretty(&document).map_err(StorageError::Serialize)?;

        let path = self.path.clone();
        let timeout = self.lock_timeout;
        tokio::task::spawn_blocking(move || Self::save_blocking(&path, &content, timeout))
            .await
            .map_err(|e| StorageError::Join(e.to_string()))??;

        tracing::debug!(
            "STORE_SAVED | path={:?} downloads={}",
            self.path,
            downloads.len()
        );
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    downloads: RwLock<Vec<Download>>,
    fail_next_save: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing collection, as if loaded from a previous run.
    pub fn with_downloads(downloads: Vec<Download>) -> Self {
        Self {
            downloads: RwLock::new(downloads),
            ..Self::default()
        }
    }

    /// Make the next `save` fail with a storage error.
    pub fn fail_next_save(&self) {
        self.fail_next_save.store(true, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The last successfully saved collection.
    pub fn snapshot(&self) -> Vec<Download> {
        resilient_read(&self.downloads).clone()
    }
}

#[async_trait]
impl DownloadStore for MemoryStore {
    async fn load(&self) -> Result<Vec<Download>, StorageError> {
        Ok(self.snapshot())
    }

    async fn save(&self, downloads: &[Download]) -> Result<(), StorageError> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Io {
                path: PathBuf::from("memory"),
                source: std::io::Error::other("save rejected"),
            });
        }
        *resilient_write(&self.downloads) = downloads.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
