// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lifecycle tests for torstream
//!
//! End-to-end flows through the download manager: intents, engine events,
//! persistence across restarts and the simulated engine writing real files.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use common::{manager_with, wait_for_status};
use torstream::{
    event_channel, DownloadManager, DownloadRegistry, DownloadStatus, DownloadStore, EngineError,
    EngineEvent, FileKind, JsonFileStore, ManagerError, SimulatedEngine,
};

const HASH: &str = "08ada5a7a6183aae1e09d831df6748d566095a10";

fn magnet(name: &str, size: u64) -> String {
    format!("magnet:?xt=urn:btih:{}&dn={}&xl={}", HASH, name, size)
}

fn file_store(dir: &TempDir) -> Arc<JsonFileStore> {
    Arc::new(JsonFileStore::new(dir.path().join("downloads.json")))
}

// =============================================================================
// ENGINE EVENT FLOW
// =============================================================================

#[tokio::test]
async fn test_metadata_progress_completed_flow() {
    let dir = TempDir::new().unwrap();
    let (_engine, manager) = manager_with(file_store(&dir)).await;

    let download = manager.add("magnet:abc").await.unwrap();
    let id = download.id.clone();

    manager
        .handle_event(EngineEvent::MetadataReceived {
            id: id.clone(),
            name: "Sintel".into(),
            location: "/x/Sintel".into(),
            total_size: 1000,
        })
        .await;

    let all = manager.registry().get_all().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "Sintel");
    assert_eq!(all[0].location.as_deref(), Some("/x/Sintel"));
    assert_eq!(all[0].total_size, 1000);
    assert_eq!(all[0].status, DownloadStatus::Downloading);

    manager
        .handle_event(EngineEvent::Progress {
            id: id.clone(),
            downloaded_size: 500,
            download_rate: 250,
            peers: 7,
            seeders: 3,
            progress: 50,
        })
        .await;
    let record = manager.registry().get(&id).await.unwrap();
    assert_eq!(record.progress, 50);
    assert_eq!(record.downloaded_size, 500);

    manager.handle_event(EngineEvent::Completed { id: id.clone() }).await;
    let record = manager.registry().get(&id).await.unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(record.downloaded_size, 1000);
    assert_eq!(record.download_rate, 0);

    // The file on disk reflects the same state
    let persisted = file_store(&dir).load().await.unwrap();
    assert_eq!(persisted, vec![record]);
}

#[tokio::test]
async fn test_events_through_dispatcher_loop() {
    let dir = TempDir::new().unwrap();
    let (_engine, manager) = manager_with(file_store(&dir)).await;
    let (sink, events) = event_channel();
    manager.spawn_event_loop(events);

    let download = manager.add("magnet:abc").await.unwrap();
    let id = download.id.clone();

    sink.send(EngineEvent::Progress {
        id: id.clone(),
        downloaded_size: 10,
        download_rate: 10,
        peers: 1,
        seeders: 1,
        progress: 10,
    })
    .await;
    sink.send(EngineEvent::Failed {
        id: id.clone(),
        error: "tracker unreachable".into(),
    })
    .await;

    let failed = wait_for_status(manager.registry(), &id, DownloadStatus::Error).await;
    assert_eq!(failed.error.as_deref(), Some("tracker unreachable"));
    assert_eq!((failed.download_rate, failed.peers, failed.seeders), (0, 0, 0));
}

#[tokio::test]
async fn test_remove_then_stale_events_are_noops() {
    let dir = TempDir::new().unwrap();
    let (engine, manager) = manager_with(file_store(&dir)).await;

    let download = manager.add("magnet:abc").await.unwrap();
    manager.remove(&download.id).await.unwrap();
    assert!(!engine.has_session(&download.id));

    for event in [
        EngineEvent::MetadataReceived {
            id: download.id.clone(),
            name: "Late".into(),
            location: "/x/Late".into(),
            total_size: 1,
        },
        EngineEvent::Progress {
            id: download.id.clone(),
            downloaded_size: 1,
            download_rate: 1,
            peers: 1,
            seeders: 1,
            progress: 1,
        },
        EngineEvent::Completed { id: download.id.clone() },
        EngineEvent::Failed { id: download.id.clone(), error: "late".into() },
    ] {
        manager.handle_event(event).await;
    }

    assert!(manager.registry().get(&download.id).await.is_none());
    assert!(file_store(&dir).load().await.unwrap().is_empty());
}

// =============================================================================
// USER INTENTS
// =============================================================================

#[tokio::test]
async fn test_pause_without_engine_session() {
    let dir = TempDir::new().unwrap();
    let (engine, manager) = manager_with(file_store(&dir)).await;

    let download = manager.add("magnet:abc").await.unwrap();
    engine.forget(&download.id);

    let err = manager.pause(&download.id).await.unwrap_err();
    assert!(matches!(err, ManagerError::Engine(EngineError::NotFound(_))));

    let record = manager.registry().get(&download.id).await.unwrap();
    assert_eq!(record.status, DownloadStatus::Paused);
}

#[tokio::test]
async fn test_resume_after_lost_session_readds_source() {
    let dir = TempDir::new().unwrap();
    let (engine, manager) = manager_with(file_store(&dir)).await;

    let download = manager.add("magnet:abc").await.unwrap();
    manager.pause(&download.id).await.unwrap();
    engine.forget(&download.id);

    let resumed = manager.resume(&download.id).await.unwrap();
    assert_eq!(resumed.status, DownloadStatus::Downloading);
    assert!(engine.has_session(&download.id));
    assert_eq!(
        engine.calls().last().map(String::as_str),
        Some(format!("add:{}", download.id).as_str())
    );
}

#[tokio::test]
async fn test_intents_on_unknown_id() {
    let dir = TempDir::new().unwrap();
    let (engine, manager) = manager_with(file_store(&dir)).await;

    assert!(matches!(manager.pause("nope").await, Err(ManagerError::NotFound(id)) if id == "nope"));
    assert!(matches!(manager.resume("nope").await, Err(ManagerError::NotFound(_))));
    assert!(engine.calls().is_empty());
}

// =============================================================================
// PERSISTENCE ACROSS RESTARTS
// =============================================================================

#[tokio::test]
async fn test_restart_pauses_unfinished_downloads() {
    let dir = TempDir::new().unwrap();

    let id = {
        let (_engine, manager) = manager_with(file_store(&dir)).await;
        let running = manager.add("magnet:running").await.unwrap();
        let done = manager.add("magnet:done").await.unwrap();
        manager.handle_event(EngineEvent::Completed { id: done.id.clone() }).await;
        running.id
    };

    // New process: fresh registry over the same file, engine without sessions
    let (engine, manager) = manager_with(file_store(&dir)).await;
    assert_eq!(manager.pause_unfinished_downloads().await.unwrap(), 1);
    assert_eq!(engine.calls(), vec![format!("pause:{}", id)]);

    let reopened = DownloadRegistry::open(file_store(&dir)).await.unwrap();
    let record = reopened.get(&id).await.unwrap();
    assert_eq!(record.status, DownloadStatus::Paused);
    assert_eq!(reopened.get_all().await.len(), 2);

    // Second reconciliation has nothing left to do
    assert_eq!(manager.pause_unfinished_downloads().await.unwrap(), 0);
}

#[tokio::test]
async fn test_legacy_download_list_is_migrated_on_write() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("downloads.json");
    std::fs::write(
        &path,
        r#"[{"_id":"m1abc","source":"magnet:legacy","name":"Old Movie","status":"DOWNLOADING",
            "progress":42,"downloadedSize":420,"totalSize":1000,"downloadRate":9,"peers":3,
            "seeders":1,"location":"/x/Old Movie"}]"#,
    )
    .unwrap();

    let (_engine, manager) = manager_with(file_store(&dir)).await;
    assert_eq!(manager.pause_unfinished_downloads().await.unwrap(), 1);

    let record = manager.registry().get("m1abc").await.unwrap();
    assert_eq!(record.name, "Old Movie");
    assert_eq!(record.progress, 42);
    assert_eq!(record.download_rate, 0);

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["version"], 1);
    assert_eq!(written["downloads"][0]["id"], "m1abc");
    assert_eq!(written["downloads"][0]["status"], "PAUSED");
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

#[tokio::test]
async fn test_subscription_to_future_id_never_fires() {
    let dir = TempDir::new().unwrap();
    let (_engine, manager) = manager_with(file_store(&dir)).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let _subscription = manager
        .registry()
        .subscribe_one("does-not-exist", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    manager.add("magnet:a").await.unwrap();
    manager.add("magnet:b").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_subscription_sees_each_transition() {
    let dir = TempDir::new().unwrap();
    let (_engine, manager) = manager_with(file_store(&dir)).await;
    let download = manager.add("magnet:a").await.unwrap();

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = statuses.clone();
    let subscription = manager
        .registry()
        .subscribe_one(&download.id, move |d| seen.lock().unwrap().push(d.status))
        .await;

    manager.pause(&download.id).await.unwrap();
    manager.resume(&download.id).await.unwrap();
    manager.handle_event(EngineEvent::Completed { id: download.id.clone() }).await;
    drop(subscription);
    manager.remove(&download.id).await.unwrap();

    assert_eq!(
        *statuses.lock().unwrap(),
        vec![
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
            DownloadStatus::Downloading,
            DownloadStatus::Completed,
        ]
    );
}

// =============================================================================
// SIMULATED ENGINE
// =============================================================================

struct Harness {
    _dir: TempDir,
    downloads: std::path::PathBuf,
    store: Arc<JsonFileStore>,
}

/// A manager with its dispatcher task.
///
/// The dispatcher holds the manager (and through it the engine) alive, so
/// stopping a "process" means aborting the dispatcher first.
struct Running {
    manager: Arc<DownloadManager>,
    event_loop: JoinHandle<()>,
}

impl Running {
    async fn kill(self) {
        self.event_loop.abort();
        let _ = self.event_loop.await;
        drop(self.manager);
        // Let blocking writes already handed to the pool settle
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let downloads = dir.path().join("downloads");
        let store = Arc::new(JsonFileStore::new(dir.path().join("downloads.json")));
        Self { _dir: dir, downloads, store }
    }

    async fn start(&self, rate: u64) -> Running {
        let registry = DownloadRegistry::open(self.store.clone()).await.unwrap();
        let (sink, events) = event_channel();
        let engine = SimulatedEngine::new(&self.downloads, sink)
            .with_rate(rate)
            .with_progress_interval(Duration::from_millis(50));
        let manager = Arc::new(DownloadManager::new(Arc::new(registry), Arc::new(engine)));
        let event_loop = manager.spawn_event_loop(events);
        Running { manager, event_loop }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simulated_download_to_completion_and_removal() {
    let harness = Harness::new();
    let manager = harness.start(8 * 1024 * 1024).await.manager;

    let download = manager.add(&magnet("Sintel", 2 * 1024 * 1024)).await.unwrap();
    let done = wait_for_status(manager.registry(), &download.id, DownloadStatus::Completed).await;

    assert_eq!(done.name, "Sintel");
    assert_eq!(done.progress, 100);
    assert_eq!(done.downloaded_size, 2 * 1024 * 1024);
    let location = done.location.clone().unwrap();
    assert_eq!(std::path::PathBuf::from(&location), harness.downloads.join("Sintel"));

    let files = manager.content(&download.id).await.unwrap();
    let kinds: Vec<_> = files.iter().map(|f| (f.kind, f.name.as_str())).collect();
    assert_eq!(
        kinds,
        vec![(FileKind::Video, "Sintel.mp4"), (FileKind::Subtitle, "Sintel.srt")]
    );
    assert_eq!(files[0].size, 2 * 1024 * 1024);

    manager.remove(&download.id).await.unwrap();
    assert!(!std::path::Path::new(&location).exists());
    assert!(manager.registry().get_all().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simulated_resume_after_restart_continues_payload() {
    let harness = Harness::new();

    let first = harness.start(1024 * 1024).await;
    let download = first.manager.add(&magnet("Resumable", 4 * 1024 * 1024)).await.unwrap();
    let id = download.id.clone();
    common::wait_for(first.manager.registry(), &id, |d| d.progress > 0).await;
    first.kill().await;

    let manager = harness.start(16 * 1024 * 1024).await.manager;
    assert_eq!(manager.pause_unfinished_downloads().await.unwrap(), 1);
    let paused = manager.registry().get(&id).await.unwrap();
    assert_eq!(paused.status, DownloadStatus::Paused);
    assert!(paused.progress > 0);

    manager.resume(&id).await.unwrap();
    let done = wait_for_status(manager.registry(), &id, DownloadStatus::Completed).await;
    assert_eq!(done.downloaded_size, 4 * 1024 * 1024);

    let payload = harness.downloads.join("Resumable").join("Resumable.mp4");
    assert_eq!(std::fs::metadata(payload).unwrap().len(), 4 * 1024 * 1024);
}

#[tokio::test]
async fn test_simulated_engine_rejects_bad_source() {
    let harness = Harness::new();
    let manager = harness.start(1024).await.manager;

    let err = manager.add("https://example.org/not-a-magnet").await.unwrap_err();
    assert!(matches!(err, ManagerError::Engine(EngineError::Fatal(_))));

    let all = manager.registry().get_all().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, DownloadStatus::Error);
    assert!(all[0].error.is_some());
}
