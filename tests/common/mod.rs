// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;

use torstream::{
    Download, DownloadManager, DownloadRegistry, DownloadStatus, DownloadStore, EngineError,
    TorrentEngine,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine double that tracks sessions and records every command.
///
/// `pause`/`resume` return `NotFound` for ids without a session, like a real
/// engine after a process restart.
#[derive(Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<String>>,
    sessions: Mutex<HashSet<String>>,
    failures: Mutex<HashMap<&'static str, EngineError>>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Drop the session for `id` as if the engine process had restarted.
    pub fn forget(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().contains(id)
    }

    pub fn fail(&self, command: &'static str, error: EngineError) {
        self.failures.lock().unwrap().insert(command, error);
    }

    fn record(&self, command: &'static str, id: &str) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!("{}:{}", command, id));
        match self.failures.lock().unwrap().get(command) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn require_session(&self, id: &str) -> Result<(), EngineError> {
        if self.has_session(id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl TorrentEngine for RecordingEngine {
    async fn add(&self, id: &str, _source: &str) -> Result<(), EngineError> {
        self.record("add", id)?;
        self.sessions.lock().unwrap().insert(id.to_string());
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<(), EngineError> {
        self.record("pause", id)?;
        self.require_session(id)
    }

    async fn resume(&self, id: &str) -> Result<(), EngineError> {
        self.record("resume", id)?;
        self.require_session(id)
    }

    async fn remove(&self, id: &str, _location: Option<&str>) -> Result<(), EngineError> {
        self.record("remove", id)?;
        self.sessions.lock().unwrap().remove(id);
        Ok(())
    }
}

/// Build a manager over `store` driven by a fresh recording engine.
pub async fn manager_with(
    store: Arc<dyn DownloadStore>,
) -> (Arc<RecordingEngine>, Arc<DownloadManager>) {
    let registry = DownloadRegistry::open(store).await.expect("open registry");
    let engine = RecordingEngine::new();
    let manager = Arc::new(DownloadManager::new(Arc::new(registry), engine.clone()));
    (engine, manager)
}

/// Wait until the record `id` satisfies `predicate`.
pub async fn wait_for<F>(registry: &DownloadRegistry, id: &str, predicate: F) -> Download
where
    F: Fn(&Download) -> bool,
{
    let (tx, mut rx) = watch::channel::<Option<Download>>(None);
    let _subscription = registry
        .subscribe_one(id, move |download| {
            tx.send_replace(Some(download.clone()));
        })
        .await;

    timeout(WAIT_TIMEOUT, async {
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(download) = current {
                if predicate(&download) {
                    return download;
                }
            }
            rx.changed().await.expect("subscription released before condition was met");
        }
    })
    .await
    .expect("timed out waiting for download state")
}

pub async fn wait_for_status(
    registry: &DownloadRegistry,
    id: &str,
    status: DownloadStatus,
) -> Download {
    wait_for(registry, id, |d| d.status == status).await
}
