// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download lifecycle core for torstream
//!
//! This module keeps one persisted record per torrent acquisition and drives
//! it through its lifecycle:
//! - Persisted store with atomic, file-locked whole-collection writes
//! - Registry with filtered queries and change subscriptions
//! - Lifecycle controller mapping user intents and engine events to records
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ TorrentEngine   │
//! │  (controller)   │◀────│ (EventStream)   │
//! └────────┬────────┘     └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadRegistry│────▶│ DownloadStore   │
//! │ (subscriptions) │     │ (JSON file)     │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use torstream::download::{DownloadManager, DownloadRegistry, JsonFileStore};
//! use torstream::engine::{event_channel, SimulatedEngine};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(JsonFileStore::new("/tmp/torstream/downloads.json").with_instance_lock()?);
//! let registry = Arc::new(DownloadRegistry::open(store).await?);
//!
//! let (sink, events) = event_channel();
//! let engine = Arc::new(SimulatedEngine::new("/tmp/torstream/downloads", sink));
//! let manager = Arc::new(DownloadManager::new(registry, engine));
//! manager.spawn_event_loop(events);
//!
//! // Anything left running by a previous process is paused first
//! manager.pause_unfinished_downloads().await?;
//!
//! let download = manager.add("magnet:?xt=urn:btih:08ada5a7a6183aae1e09d831df6748d566095a10&dn=Sintel").await?;
//! let _watch = manager
//!     .registry()
//!     .subscribe_one(&download.id, |d| println!("{} {}%", d.status, d.progress))
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod content;
pub mod manager;
pub mod registry;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use content::{ContentFile, FileKind};
pub use manager::DownloadManager;
pub use registry::{DownloadRegistry, Subscription};
pub use store::{DownloadStore, InstanceLock, JsonFileStore, MemoryStore};
pub use types::{Download, DownloadFilter, DownloadId, DownloadPatch, DownloadStatus};
