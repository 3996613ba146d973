// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download registry: keyed CRUD over the persisted store with change
//! notification.
//!
//! Every mutation runs as one critical section under a single async mutex:
//! read-modify-write, persist the whole collection, then notify. Two updates
//! for different ids can therefore never overwrite each other's persisted
//! snapshot, and subscribers only ever observe state that reached the store.
//! When persisting fails the in-memory change is rolled back.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use indexmap::IndexMap;
use tokio::sync::Mutex;

use super::store::DownloadStore;
use super::types::{generate_id, Download, DownloadFilter, DownloadId, DownloadPatch};
use crate::error::{RegistryError, StorageError};
use crate::locks::{resilient_read, resilient_write};

type CollectionListener = Arc<dyn Fn(&[Download]) + Send + Sync>;
type RecordListener = Arc<dyn Fn(&Download) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_key: u64,
    all: IndexMap<u64, CollectionListener>,
    by_id: HashMap<DownloadId, IndexMap<u64, RecordListener>>,
}

impl Listeners {
    fn next_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }
}

#[derive(Debug, Clone)]
enum Target {
    All,
    One(DownloadId),
}

/// Handle owning one registered callback.
///
/// The callback is removed when the handle is dropped or
/// [`unsubscribe`](Subscription::unsubscribe) is called. Handles for a
/// deleted download are already detached and dropping them is a no-op.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    key: u64,
    target: Target,
    listeners: Weak<RwLock<Listeners>>,
}

impl Subscription {
    /// Cancel the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(listeners) = self.listeners.upgrade() else {
            return;
        };
        let mut listeners = resilient_write(&listeners);
        match &self.target {
            Target::All => {
                listeners.all.shift_remove(&self.key);
            }
            Target::One(id) => {
                if let Some(entries) = listeners.by_id.get_mut(id) {
                    entries.shift_remove(&self.key);
                    if entries.is_empty() {
                        listeners.by_id.remove(id);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("target", &self.target)
            .finish()
    }
}

/// Keyed, persisted, observable collection of download records.
pub struct DownloadRegistry {
    store: Arc<dyn DownloadStore>,
    downloads: Mutex<IndexMap<DownloadId, Download>>,
    listeners: Arc<RwLock<Listeners>>,
}

impl DownloadRegistry {
    /// Load the collection from the store and build the registry.
    pub async fn open(store: Arc<dyn DownloadStore>) -> Result<Self, StorageError> {
        let loaded = store.load().await?;
        let mut downloads = IndexMap::with_capacity(loaded.len());
        for download in loaded {
            if downloads.contains_key(&download.id) {
                tracing::warn!("REGISTRY_DUPLICATE_ID | id={} keeping last record", download.id);
            }
            downloads.insert(download.id.clone(), download);
        }

        tracing::info!("REGISTRY_OPENED | downloads={}", downloads.len());

        Ok(Self {
            store,
            downloads: Mutex::new(downloads),
            listeners: Arc::new(RwLock::new(Listeners::default())),
        })
    }

    /// Snapshot of every record, in creation order.
    pub async fn get_all(&self) -> Vec<Download> {
        self.downloads.lock().await.values().cloned().collect()
    }

    /// Records matching every field set in `filter`.
    pub async fn get_all_by_filter(&self, filter: &DownloadFilter) -> Vec<Download> {
        self.downloads
            .lock()
            .await
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect()
    }

    /// Look up one record. Absence is not an error.
    pub async fn get(&self, id: &str) -> Option<Download> {
        self.downloads.lock().await.get(id).cloned()
    }

    /// Create a record with a fresh id; patch fields override the defaults.
    pub async fn create(&self, patch: DownloadPatch) -> Result<Download, RegistryError> {
        let mut downloads = self.downloads.lock().await;

        let mut id = generate_id();
        while downloads.contains_key(&id) {
            id = generate_id();
        }

        let mut download = Download::new(id.clone(), patch.source.clone().unwrap_or_default());
        download.apply(&patch);
        download.created_at = download.updated_at;

        downloads.insert(id.clone(), download.clone());
        if let Err(e) = self.persist(&downloads).await {
            downloads.shift_remove(&id);
            return Err(e.into());
        }

        tracing::debug!("REGISTRY_CREATED | id={} source={}", id, download.source);
        self.notify(&downloads, Some(&download));
        Ok(download)
    }

    /// Shallow-merge `patch` into the record with `id`.
    pub async fn update(&self, id: &str, patch: DownloadPatch) -> Result<Download, RegistryError> {
        self.modify(id, |download| {
            download.apply(&patch);
            true
        })
        .await?
        .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Conditionally mutate the record with `id` inside the critical section.
    ///
    /// `mutate` returns whether it changed anything. Unchanged records are
    /// neither persisted nor notified and `Ok(None)` is returned.
    pub async fn modify<F>(&self, id: &str, mutate: F) -> Result<Option<Download>, RegistryError>
    where
        F: FnOnce(&mut Download) -> bool,
    {
        let mut downloads = self.downloads.lock().await;

        let Some(record) = downloads.get_mut(id) else {
            return Err(RegistryError::NotFound(id.to_string()));
        };

        let previous = record.clone();
        if !mutate(record) {
            *record = previous;
            return Ok(None);
        }
        record.id = previous.id.clone();
        record.source = previous.source.clone();
        record.updated_at = chrono::Utc::now();
        let updated = record.clone();

        if let Err(e) = self.persist(&downloads).await {
            if let Some(record) = downloads.get_mut(id) {
                *record = previous;
            }
            return Err(e.into());
        }

        self.notify(&downloads, Some(&updated));
        Ok(Some(updated))
    }

    /// Remove the record and release every per-id subscription for it.
    pub async fn delete(&self, id: &str) -> Result<Download, RegistryError> {
        let mut downloads = self.downloads.lock().await;

        let Some((index, key, removed)) = downloads.shift_remove_full(id) else {
            return Err(RegistryError::NotFound(id.to_string()));
        };

        if let Err(e) = self.persist(&downloads).await {
            downloads.shift_insert(index, key, removed);
            return Err(e.into());
        }

        resilient_write(&self.listeners).by_id.remove(id);

        tracing::debug!("REGISTRY_DELETED | id={}", id);
        self.notify(&downloads, None);
        Ok(removed)
    }

    /// Register a callback for the whole collection.
    ///
    /// Invoked immediately with the current snapshot, then after every
    /// create, update and delete.
    pub async fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[Download]) + Send + Sync + 'static,
    {
        // Held so no mutation slips between the snapshot and registration
        let downloads = self.downloads.lock().await;

        let callback: CollectionListener = Arc::new(callback);
        let key = {
            let mut listeners = resilient_write(&self.listeners);
            let key = listeners.next_key();
            listeners.all.insert(key, Arc::clone(&callback));
            key
        };

        let snapshot: Vec<Download> = downloads.values().cloned().collect();
        callback(snapshot.as_slice());

        Subscription {
            key,
            target: Target::All,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Register a callback for a single record.
    ///
    /// Invoked immediately only if the record exists, then after each
    /// mutation of that record. Never invoked for an absent id.
    pub async fn subscribe_one<F>(&self, id: &str, callback: F) -> Subscription
    where
        F: Fn(&Download) + Send + Sync + 'static,
    {
        let downloads = self.downloads.lock().await;

        let callback: RecordListener = Arc::new(callback);
        let key = {
            let mut listeners = resilient_write(&self.listeners);
            let key = listeners.next_key();
            listeners
                .by_id
                .entry(id.to_string())
                .or_default()
                .insert(key, Arc::clone(&callback));
            key
        };

        if let Some(download) = downloads.get(id) {
            callback(download);
        }

        Subscription {
            key,
            target: Target::One(id.to_string()),
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of live subscriptions (collection plus per-record).
    pub fn subscriber_count(&self) -> usize {
        let listeners = resilient_read(&self.listeners);
        listeners.all.len() + listeners.by_id.values().map(|l| l.len()).sum::<usize>()
    }

    async fn persist(&self, downloads: &IndexMap<DownloadId, Download>) -> Result<(), StorageError> {
        let snapshot: Vec<Download> = downloads.values().cloned().collect();
        self.store.save(&snapshot).await.map_err(|e| {
            tracing::error!("REGISTRY_PERSIST_FAILED | error={}", e);
            e
        })
    }

    /// Fan out after a persisted mutation. Callbacks are cloned out of the
    /// lock first so a callback may drop its own subscription.
    fn notify(&self, downloads: &IndexMap<DownloadId, Download>, changed: Option<&Download>) {
        let (all, record) = {
            let listeners = resilient_read(&self.listeners);
            let all: Vec<CollectionListener> = listeners.all.values().cloned().collect();
            let record: Vec<RecordListener> = changed
                .and_then(|d| listeners.by_id.get(&d.id))
                .map(|entries| entries.values().cloned().collect())
                .unwrap_or_default();
            (all, record)
        };

        if !all.is_empty() {
            let snapshot: Vec<Download> = downloads.values().cloned().collect();
            for listener in &all {
                listener(snapshot.as_slice());
            }
        }

        if let Some(download) = changed {
            for listener in &record {
                listener(download);
            }
        }
    }
}

impl std::fmt::Debug for DownloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadRegistry")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}
