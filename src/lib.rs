// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! torstream - Torrent download lifecycle library
//!
//! Keeps one persisted record per torrent acquisition, drives it through
//! its lifecycle and tells subscribers about every change:
//!
//! **Intent** -> **DownloadManager** -> **TorrentEngine** + **DownloadRegistry**
//!
//! Engine events flow back through a single dispatcher into the registry.
//!
//! # Core Modules
//!
//! - [`download`] - Records, persisted store, registry and lifecycle controller
//! - [`engine`] - Torrent engine adapter, event channel and simulated engine
//! - [`config`] - Data directory and JSON configuration
//! - [`error`] - Typed errors and terminal error formatting
//! - [`locks`] - Poison-recovering lock helpers
//! - [`utils`] - Byte, speed and ETA formatting

pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod locks;
pub mod utils;

// Re-export commonly used types from download
pub use download::{
    ContentFile, Download, DownloadFilter, DownloadId, DownloadManager, DownloadPatch,
    DownloadRegistry, DownloadStatus, DownloadStore, FileKind, InstanceLock, JsonFileStore,
    MemoryStore, Subscription,
};

// Re-export engine surface
pub use engine::{
    event_channel, EngineEvent, EventSink, EventStream, MagnetLink, ProgressThrottle,
    SimulatedEngine, TorrentEngine,
};

// Re-export errors and config
pub use config::Config;
pub use error::{EngineError, ManagerError, RegistryError, StorageError};
