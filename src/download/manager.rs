// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download lifecycle controller.
//!
//! Translates user intents into engine commands plus registry mutations, and
//! engine events into registry mutations. Event handlers use
//! [`DownloadRegistry::modify`] so the "only if not terminal / only if newer"
//! checks run inside the registry's critical section.

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::content::{list_content, ContentFile};
use super::registry::DownloadRegistry;
use super::types::{Download, DownloadFilter, DownloadPatch, DownloadStatus, PLACEHOLDER_NAME};
use crate::engine::{EngineEvent, EventStream, TorrentEngine};
use crate::error::{EngineError, ManagerError, RegistryError};

/// Highest progress a download may show before the engine reports completion.
const MAX_RUNNING_PROGRESS: u8 = 99;

/// Lifecycle controller over a registry and a torrent engine.
pub struct DownloadManager {
    registry: Arc<DownloadRegistry>,
    engine: Arc<dyn TorrentEngine>,
}

impl DownloadManager {
    pub fn new(registry: Arc<DownloadRegistry>, engine: Arc<dyn TorrentEngine>) -> Self {
        Self { registry, engine }
    }

    /// The registry this manager mutates; use it for queries and subscriptions.
    pub fn registry(&self) -> &Arc<DownloadRegistry> {
        &self.registry
    }

    /// Create a download for `source` and hand it to the engine.
    ///
    /// If the engine rejects the command the record is kept in `ERROR` with
    /// the detail and the engine error is returned.
    pub async fn add(&self, source: &str) -> Result<Download, ManagerError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(ManagerError::EmptySource);
        }

        let download = self
            .registry
            .create(
                DownloadPatch::new()
                    .source(source)
                    .name(PLACEHOLDER_NAME)
                    .status(DownloadStatus::Downloading)
                    .progress(0),
            )
            .await?;

        tracing::info!("DOWNLOAD_ADDED | id={} source={}", download.id, source);

        if let Err(e) = self.engine.add(&download.id, source).await {
            tracing::warn!("DOWNLOAD_ADD_REJECTED | id={} error={}", download.id, e);
            self.mark_error(&download.id, &e).await?;
            return Err(e.into());
        }

        Ok(download)
    }

    /// Pause a `DOWNLOADING` download.
    ///
    /// The record is marked `PAUSED` even when the engine command fails; the
    /// engine error is still returned.
    pub async fn pause(&self, id: &str) -> Result<Download, ManagerError> {
        let current = self.require(id).await?;
        if current.status != DownloadStatus::Downloading {
            return Err(invalid(id, "pause", current.status));
        }

        let engine_result = self.engine.pause(id).await;
        let paused = self.mark_paused(id).await?;
        tracing::info!("DOWNLOAD_PAUSED | id={}", id);

        match engine_result {
            Ok(()) => Ok(paused),
            Err(e) => {
                tracing::warn!("DOWNLOAD_PAUSE_ENGINE_FAILED | id={} error={}", id, e);
                Err(e.into())
            }
        }
    }

    /// Resume a `PAUSED` download, re-adding it when the engine lost the session.
    pub async fn resume(&self, id: &str) -> Result<Download, ManagerError> {
        let current = self.require(id).await?;
        if current.status != DownloadStatus::Paused {
            return Err(invalid(id, "resume", current.status));
        }

        match self.engine.resume(id).await {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) => {
                tracing::info!("DOWNLOAD_RESUME_READD | id={} session lost", id);
                if let Err(e) = self.engine.add(id, &current.source).await {
                    tracing::warn!("DOWNLOAD_RESUME_FAILED | id={} error={}", id, e);
                    self.mark_error(id, &e).await?;
                    return Err(e.into());
                }
            }
            Err(e) => {
                tracing::warn!("DOWNLOAD_RESUME_FAILED | id={} error={}", id, e);
                return Err(e.into());
            }
        }

        let resumed = self
            .transition(id, |d| {
                if d.status != DownloadStatus::Paused {
                    return false;
                }
                d.status = DownloadStatus::Downloading;
                d.error = None;
                true
            })
            .await?;
        tracing::info!("DOWNLOAD_RESUMED | id={}", id);
        Ok(resumed)
    }

    /// Re-acquire a download from its stored source.
    ///
    /// Allowed from `DOWNLOADING`, `PAUSED` and `ERROR`.
    pub async fn restart(&self, id: &str) -> Result<Download, ManagerError> {
        let current = self.require(id).await?;
        if current.status == DownloadStatus::Completed {
            return Err(invalid(id, "restart", current.status));
        }

        if let Err(e) = self.engine.add(id, &current.source).await {
            tracing::warn!("DOWNLOAD_RESTART_FAILED | id={} error={}", id, e);
            self.mark_error(id, &e).await?;
            return Err(e.into());
        }

        let restarted = self
            .transition(id, |d| {
                if d.status == DownloadStatus::Completed {
                    return false;
                }
                d.status = DownloadStatus::Downloading;
                d.error = None;
                true
            })
            .await?;
        tracing::info!("DOWNLOAD_RESTARTED | id={}", id);
        Ok(restarted)
    }

    /// Stop the engine session, delete content, and delete the record.
    ///
    /// The record is deleted whatever the engine reports; an engine failure
    /// is returned afterwards.
    pub async fn remove(&self, id: &str) -> Result<Download, ManagerError> {
        let current = self.require(id).await?;

        let mut engine_result = self.engine.remove(id, current.location.as_deref()).await;
        if let Err(e) = &engine_result {
            tracing::warn!("DOWNLOAD_REMOVE_ENGINE_FAILED | id={} error={}", id, e);
        }

        let removed = self.registry.delete(id).await?;
        tracing::info!("DOWNLOAD_REMOVED | id={}", id);

        // Metadata that landed before the delete names content the first call missed
        if let Some(location) = removed.location.as_deref() {
            if removed.location != current.location {
                tracing::info!("DOWNLOAD_REMOVE_LATE_LOCATION | id={} location={}", id, location);
                let late = self.engine.remove(id, Some(location)).await;
                if let Err(e) = &late {
                    tracing::warn!("DOWNLOAD_REMOVE_ENGINE_FAILED | id={} error={}", id, e);
                }
                engine_result = engine_result.and(late);
            }
        }

        engine_result?;
        Ok(removed)
    }

    /// Startup reconciliation: every `DOWNLOADING` record left by a previous
    /// run becomes `PAUSED`. Returns how many were paused.
    pub async fn pause_unfinished_downloads(&self) -> Result<usize, ManagerError> {
        let unfinished = self
            .registry
            .get_all_by_filter(&DownloadFilter::new().status(DownloadStatus::Downloading))
            .await;

        let mut paused = 0;
        for download in unfinished {
            match self.engine.pause(&download.id).await {
                Ok(()) => {}
                Err(EngineError::NotFound(_)) => {
                    tracing::debug!("RECONCILE_NO_SESSION | id={}", download.id);
                }
                Err(e) => {
                    tracing::warn!("RECONCILE_ENGINE_FAILED | id={} error={}", download.id, e);
                }
            }

            match self.registry.modify(&download.id, pause_if_downloading).await {
                Ok(Some(_)) => paused += 1,
                Ok(None) | Err(RegistryError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if paused > 0 {
            tracing::info!("RECONCILE_COMPLETE | paused={}", paused);
        }
        Ok(paused)
    }

    /// Files of a download, classified and sorted for playback.
    pub async fn content(&self, id: &str) -> Result<Vec<ContentFile>, ManagerError> {
        let download = self.require(id).await?;
        let location = download
            .location
            .ok_or_else(|| ManagerError::NoLocation(id.to_string()))?;

        let root = std::path::PathBuf::from(location);
        let listing_root = root.clone();
        tokio::task::spawn_blocking(move || list_content(&listing_root))
            .await
            .map_err(|e| ManagerError::Io {
                path: root.clone(),
                source: std::io::Error::other(e.to_string()),
            })?
            .map_err(|source| ManagerError::Io { path: root, source })
    }

    /// Apply one engine event. Never fails: problems are logged.
    pub async fn handle_event(&self, event: EngineEvent) {
        let kind = event.kind();
        let id = event.id().to_string();

        let result = match event {
            EngineEvent::MetadataReceived {
                name,
                location,
                total_size,
                ..
            } => {
                self.registry
                    .modify(&id, |d| {
                        if !matches!(d.status, DownloadStatus::Downloading | DownloadStatus::Paused) {
                            return false;
                        }
                        d.name = name;
                        d.location = Some(location);
                        d.total_size = total_size;
                        true
                    })
                    .await
            }
            EngineEvent::Progress {
                downloaded_size,
                download_rate,
                peers,
                seeders,
                progress,
                ..
            } => {
                let progress = progress.min(MAX_RUNNING_PROGRESS);
                self.registry
                    .modify(&id, |d| {
                        if d.status != DownloadStatus::Downloading || progress < d.progress {
                            return false;
                        }
                        d.progress = progress;
                        d.downloaded_size = downloaded_size.max(d.downloaded_size);
                        d.download_rate = download_rate;
                        d.peers = peers;
                        d.seeders = seeders;
                        true
                    })
                    .await
            }
            EngineEvent::Completed { .. } => {
                self.registry
                    .modify(&id, |d| {
                        if !matches!(d.status, DownloadStatus::Downloading | DownloadStatus::Paused) {
                            return false;
                        }
                        d.status = DownloadStatus::Completed;
                        d.progress = 100;
                        if d.total_size > 0 {
                            d.downloaded_size = d.total_size;
                        } else {
                            d.total_size = d.downloaded_size;
                        }
                        d.reset_transfer_stats();
                        d.error = None;
                        true
                    })
                    .await
            }
            EngineEvent::Failed { error, .. } => {
                tracing::error!("DOWNLOAD_ENGINE_FAILURE | id={} error={}", id, error);
                self.registry
                    .modify(&id, |d| {
                        if d.status == DownloadStatus::Completed {
                            return false;
                        }
                        d.status = DownloadStatus::Error;
                        d.reset_transfer_stats();
                        d.error = Some(error);
                        true
                    })
                    .await
            }
        };

        match result {
            Ok(Some(download)) => match kind {
                "progress" => tracing::debug!(
                    "DOWNLOAD_PROGRESS | id={} progress={} rate={}",
                    id,
                    download.progress,
                    download.download_rate
                ),
                _ => tracing::info!(
                    "DOWNLOAD_EVENT_APPLIED | id={} event={} status={}",
                    id,
                    kind,
                    download.status
                ),
            },
            Ok(None) => {
                tracing::debug!("DOWNLOAD_EVENT_IGNORED | id={} event={}", id, kind);
            }
            Err(RegistryError::NotFound(_)) => {
                tracing::warn!("DOWNLOAD_EVENT_UNKNOWN_ID | id={} event={}", id, kind);
            }
            Err(RegistryError::Storage(e)) => {
                tracing::error!("DOWNLOAD_EVENT_PERSIST_FAILED | id={} event={} error={}", id, kind, e);
            }
        }
    }

    /// Consume `events` until every sender is gone.
    pub async fn run_event_loop(&self, mut events: EventStream) {
        tracing::debug!("EVENT_LOOP_STARTED");
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        tracing::debug!("EVENT_LOOP_STOPPED");
    }

    /// Spawn the single dispatcher task for engine events.
    pub fn spawn_event_loop(self: &Arc<Self>, events: EventStream) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_event_loop(events).await })
    }

    async fn require(&self, id: &str) -> Result<Download, ManagerError> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    /// Run a conditional mutation, returning the current record if it was a no-op.
    async fn transition<F>(&self, id: &str, mutate: F) -> Result<Download, ManagerError>
    where
        F: FnOnce(&mut Download) -> bool,
    {
        match self.registry.modify(id, mutate).await? {
            Some(download) => Ok(download),
            None => self.require(id).await,
        }
    }

    async fn mark_paused(&self, id: &str) -> Result<Download, ManagerError> {
        self.transition(id, pause_if_downloading).await
    }

    async fn mark_error(&self, id: &str, error: &EngineError) -> Result<(), ManagerError> {
        let detail = error.to_string();
        self.transition(id, |d| {
            if d.status == DownloadStatus::Completed {
                return false;
            }
            d.status = DownloadStatus::Error;
            d.reset_transfer_stats();
            d.error = Some(detail);
            true
        })
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn pause_if_downloading(download: &mut Download) -> bool {
    if download.status != DownloadStatus::Downloading {
        return false;
    }
    download.status = DownloadStatus::Paused;
    download.reset_transfer_stats();
    true
}

fn invalid(id: &str, action: &'static str, status: DownloadStatus) -> ManagerError {
    ManagerError::InvalidTransition {
        id: id.to_string(),
        action,
        status,
    }
}
