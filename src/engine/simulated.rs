// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process engine that fabricates payload bytes on disk.
//!
//! Each session is a tokio task that reports metadata parsed from the magnet
//! link, appends zero bytes to `<download_dir>/<name>/<name>.mp4` at a fixed
//! rate, and emits throttled progress until the exact length (`xl`) is
//! reached. A partially written payload is picked up again on `add`, so a
//! resume after a process restart continues where it left off.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{EngineEvent, EventSink, MagnetLink, ProgressThrottle, TorrentEngine, DEFAULT_PROGRESS_INTERVAL};
use crate::download::types::DownloadId;
use crate::error::EngineError;
use crate::locks::{resilient_read, resilient_write};

/// Default transfer rate: 4 MiB/s.
pub const DEFAULT_RATE_BPS: u64 = 4 * 1024 * 1024;

/// Payload size used when the magnet link carries no `xl`.
pub const DEFAULT_TOTAL_SIZE: u64 = 32 * 1024 * 1024;

const TICK: Duration = Duration::from_millis(100);
const WRITE_BUFFER: usize = 64 * 1024;

const SUBTITLE_STUB: &str = "1\n00:00:01,000 --> 00:00:04,000\n[simulated]\n";

struct Session {
    paused: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Session {
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Parameters for one transfer task.
struct Transfer {
    id: DownloadId,
    name: String,
    location: PathBuf,
    total_size: u64,
    rate_bps: u64,
    progress_interval: Duration,
    sink: EventSink,
}

/// Engine implementation used by the CLI and tests.
pub struct SimulatedEngine {
    download_dir: PathBuf,
    sink: EventSink,
    rate_bps: u64,
    progress_interval: Duration,
    default_total_size: u64,
    sessions: Arc<RwLock<HashMap<DownloadId, Session>>>,
}

impl SimulatedEngine {
    /// Create an engine writing under `download_dir` and reporting to `sink`.
    pub fn new(download_dir: impl Into<PathBuf>, sink: EventSink) -> Self {
        Self {
            download_dir: download_dir.into(),
            sink,
            rate_bps: DEFAULT_RATE_BPS,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            default_total_size: DEFAULT_TOTAL_SIZE,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bytes per second written for each session.
    pub fn with_rate(mut self, rate_bps: u64) -> Self {
        self.rate_bps = rate_bps.max(1);
        self
    }

    /// Minimum spacing of progress events.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Payload size for magnet links without `xl`.
    pub fn with_default_total_size(mut self, size: u64) -> Self {
        self.default_total_size = size;
        self
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Number of sessions whose task is still running.
    pub fn active_sessions(&self) -> usize {
        resilient_read(&self.sessions)
            .values()
            .filter(|s| s.is_live())
            .count()
    }

    /// Only paths strictly inside the download directory may be deleted.
    fn is_managed_path(&self, location: &Path) -> bool {
        location != self.download_dir
            && location.starts_with(&self.download_dir)
            && !location.components().any(|c| matches!(c, Component::ParentDir))
    }

    fn set_paused(&self, id: &str, paused: bool) -> Result<(), EngineError> {
        let sessions = resilient_read(&self.sessions);
        let session = sessions
            .get(id)
            .filter(|s| s.is_live())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        session
            .paused
            .send(paused)
            .map_err(|_| EngineError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl TorrentEngine for SimulatedEngine {
    async fn add(&self, id: &str, source: &str) -> Result<(), EngineError> {
        let magnet = MagnetLink::parse(source)?;
        let name = sanitize_name(&magnet.name());
        let location = self.download_dir.join(&name);

        let (paused_tx, paused_rx) = watch::channel(false);
        let transfer = Transfer {
            id: id.to_string(),
            name,
            location,
            total_size: magnet.exact_length.unwrap_or(self.default_total_size),
            rate_bps: self.rate_bps,
            progress_interval: self.progress_interval,
            sink: self.sink.clone(),
        };

        tracing::info!(
            "ENGINE_ADD | id={} name={} size={} trackers={}",
            id,
            transfer.name,
            transfer.total_size,
            magnet.trackers.len()
        );

        let task = tokio::spawn(run_transfer(transfer, paused_rx));
        let previous = resilient_write(&self.sessions).insert(
            id.to_string(),
            Session {
                paused: paused_tx,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<(), EngineError> {
        self.set_paused(id, true)?;
        tracing::debug!("ENGINE_PAUSE | id={}", id);
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<(), EngineError> {
        self.set_paused(id, false)?;
        tracing::debug!("ENGINE_RESUME | id={}", id);
        Ok(())
    }

    async fn remove(&self, id: &str, location: Option<&str>) -> Result<(), EngineError> {
        let session = resilient_write(&self.sessions).remove(id);
        if let Some(session) = session {
            session.task.abort();
        }

        let Some(location) = location else {
            return Ok(());
        };
        let path = PathBuf::from(location);
        if !self.is_managed_path(&path) {
            return Err(EngineError::Fatal(format!(
                "refusing to delete {} outside {}",
                path.display(),
                self.download_dir.display()
            )));
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::info!("ENGINE_CONTENT_DELETED | id={} path={}", id, path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("ENGINE_CONTENT_ABSENT | id={} path={}", id, path.display());
                Ok(())
            }
            Err(e) => Err(EngineError::Transient(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        for (_, session) in resilient_write(&self.sessions).drain() {
            session.task.abort();
        }
    }
}

/// Turn a display name into a single safe path component.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

async fn run_transfer(transfer: Transfer, paused: watch::Receiver<bool>) {
    if let Err(e) = transfer_payload(&transfer, paused).await {
        tracing::warn!("ENGINE_TRANSFER_FAILED | id={} error={}", transfer.id, e);
        transfer
            .sink
            .send(EngineEvent::Failed {
                id: transfer.id.clone(),
                error: e.to_string(),
            })
            .await;
    }
}

async fn transfer_payload(
    transfer: &Transfer,
    mut paused: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let sink = &transfer.sink;
    let id = &transfer.id;

    sink.send(EngineEvent::MetadataReceived {
        id: id.clone(),
        name: transfer.name.clone(),
        location: transfer.location.to_string_lossy().into_owned(),
        total_size: transfer.total_size,
    })
    .await;

    tokio::fs::create_dir_all(&transfer.location).await?;

    let subtitle = transfer.location.join(format!("{}.srt", transfer.name));
    if tokio::fs::metadata(&subtitle).await.is_err() {
        tokio::fs::write(&subtitle, SUBTITLE_STUB).await?;
    }

    let payload = transfer.location.join(format!("{}.mp4", transfer.name));
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&payload)
        .await?;
    let mut downloaded = file.metadata().await?.len().min(transfer.total_size);

    let per_tick = (transfer.rate_bps / (1000 / TICK.as_millis() as u64)).max(1);
    let buffer = vec![0u8; WRITE_BUFFER.min(per_tick as usize)];
    let mut throttle = ProgressThrottle::new(transfer.progress_interval);

    while downloaded < transfer.total_size {
        if *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                return Ok(());
            }
            continue;
        }

        tokio::select! {
            changed = paused.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                continue;
            }
            _ = tokio::time::sleep(TICK) => {}
        }

        let mut remaining = per_tick.min(transfer.total_size - downloaded);
        while remaining > 0 {
            let n = remaining.min(buffer.len() as u64) as usize;
            file.write_all(&buffer[..n]).await?;
            remaining -= n as u64;
            downloaded += n as u64;
        }

        let progress = percent(downloaded, transfer.total_size);
        if downloaded < transfer.total_size && throttle.should_emit(id, progress) {
            let (peers, seeders) = {
                let mut rng = rand::thread_rng();
                let peers = rng.gen_range(4..32);
                (peers, rng.gen_range(1..=peers))
            };
            sink.send(EngineEvent::Progress {
                id: id.clone(),
                downloaded_size: downloaded,
                download_rate: transfer.rate_bps,
                peers,
                seeders,
                progress,
            })
            .await;
        }
    }

    file.flush().await?;
    file.sync_all().await?;

    tracing::info!("ENGINE_COMPLETE | id={} bytes={}", id, downloaded);
    sink.send(EngineEvent::Completed { id: id.clone() }).await;
    Ok(())
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.saturating_mul(100)) / total).min(100) as u8
}
