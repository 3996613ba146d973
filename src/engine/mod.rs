// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Torrent engine adapter.
//!
//! The engine is reached through two narrow surfaces:
//!
//! - [`TorrentEngine`]: outbound commands (`add`, `pause`, `resume`, `remove`)
//! - [`EngineEvent`]: inbound notifications delivered over an mpsc channel
//!   created by [`event_channel`]
//!
//! ```text
//! ┌─────────────────┐  commands   ┌─────────────────┐
//! │ DownloadManager │────────────▶│ TorrentEngine   │
//! │                 │◀────────────│                 │
//! └─────────────────┘ EventStream └─────────────────┘
//! ```

pub mod magnet;
pub mod simulated;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::download::types::DownloadId;
use crate::error::EngineError;

pub use magnet::MagnetLink;
pub use simulated::SimulatedEngine;

/// Default minimum spacing between progress events for one download.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Buffered events before engine senders start waiting on the dispatcher.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Commands the download manager issues to a torrent engine.
///
/// Every command returns once the engine accepted it. Transfer outcomes
/// arrive later as [`EngineEvent`]s.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Start acquiring `source` under `id`. Replaces any existing session.
    async fn add(&self, id: &str, source: &str) -> Result<(), EngineError>;

    /// Pause the session. `NotFound` if there is none.
    async fn pause(&self, id: &str) -> Result<(), EngineError>;

    /// Resume the session. `NotFound` if it was lost (e.g. after a restart).
    async fn resume(&self, id: &str) -> Result<(), EngineError>;

    /// Stop the session if any and delete the content under `location`.
    /// An absent path is not an error.
    async fn remove(&self, id: &str, location: Option<&str>) -> Result<(), EngineError>;
}

/// Notification from the engine about one download.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    MetadataReceived {
        id: DownloadId,
        name: String,
        location: String,
        total_size: u64,
    },
    Progress {
        id: DownloadId,
        downloaded_size: u64,
        download_rate: u64,
        peers: u32,
        seeders: u32,
        progress: u8,
    },
    Completed {
        id: DownloadId,
    },
    Failed {
        id: DownloadId,
        error: String,
    },
}

impl EngineEvent {
    /// Id of the download this event is about.
    pub fn id(&self) -> &str {
        match self {
            EngineEvent::MetadataReceived { id, .. }
            | EngineEvent::Progress { id, .. }
            | EngineEvent::Completed { id }
            | EngineEvent::Failed { id, .. } => id,
        }
    }

    /// Short event name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::MetadataReceived { .. } => "metadata",
            EngineEvent::Progress { .. } => "progress",
            EngineEvent::Completed { .. } => "completed",
            EngineEvent::Failed { .. } => "failed",
        }
    }
}

/// Engine-side sending half of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl EventSink {
    /// Deliver an event. Returns false once the dispatcher has gone away.
    pub async fn send(&self, event: EngineEvent) -> bool {
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                tracing::debug!(
                    "ENGINE_EVENT_DROPPED | id={} kind={} dispatcher closed",
                    event.id(),
                    event.kind()
                );
                false
            }
        }
    }

    /// Whether the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of the event channel, consumed by a single dispatcher.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<EngineEvent>,
}

impl EventStream {
    /// Next event, or `None` once every sink is dropped.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }
}

/// Create a connected sink/stream pair.
pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSink { tx }, EventStream { rx })
}

/// Rate limiter for progress events, per download.
///
/// A sample passes only if its percentage differs from the last one that
/// passed and at least `interval` has elapsed since then. The first sample
/// for a download always passes.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: HashMap<DownloadId, (Instant, u8)>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    /// Decide whether a sample for `id` should be emitted now.
    pub fn should_emit(&mut self, id: &str, progress: u8) -> bool {
        self.should_emit_at(id, progress, Instant::now())
    }

    /// Same as [`should_emit`](Self::should_emit) with an explicit clock.
    pub fn should_emit_at(&mut self, id: &str, progress: u8, now: Instant) -> bool {
        if let Some((at, last_progress)) = self.last.get(id) {
            if *last_progress == progress || now.saturating_duration_since(*at) < self.interval {
                return false;
            }
        }
        self.last.insert(id.to_string(), (now, progress));
        true
    }

    /// Forget state for `id` so its next sample passes.
    pub fn reset(&mut self, id: &str) {
        self.last.remove(id);
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_first_sample_passes() {
        let mut throttle = ProgressThrottle::default();
        assert!(throttle.should_emit_at("a", 0, Instant::now()));
    }

    #[test]
    fn test_throttle_requires_interval_and_change() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(500));
        let start = Instant::now();

        assert!(throttle.should_emit_at("a", 1, start));
        // Changed but too soon
        assert!(!throttle.should_emit_at("a", 2, start + Duration::from_millis(100)));
        // Late enough but unchanged
        assert!(!throttle.should_emit_at("a", 1, start + Duration::from_millis(600)));
        // Both conditions met
        assert!(throttle.should_emit_at("a", 2, start + Duration::from_millis(600)));
    }

    #[test]
    fn test_throttle_is_per_download() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(10));
        let now = Instant::now();
        assert!(throttle.should_emit_at("a", 1, now));
        assert!(throttle.should_emit_at("b", 1, now));
        assert!(!throttle.should_emit_at("a", 2, now));

        throttle.reset("a");
        assert!(throttle.should_emit_at("a", 2, now));
    }

    #[test]
    fn test_event_accessors() {
        let event = EngineEvent::Failed {
            id: "x".into(),
            error: "tracker unreachable".into(),
        };
        assert_eq!(event.id(), "x");
        assert_eq!(event.kind(), "failed");
    }

    #[tokio::test]
    async fn test_event_channel_delivers_in_order() {
        let (sink, mut stream) = event_channel();
        let other = sink.clone();

        assert!(sink.send(EngineEvent::Completed { id: "a".into() }).await);
        assert!(other.send(EngineEvent::Completed { id: "b".into() }).await);
        drop(sink);
        drop(other);

        assert_eq!(stream.recv().await.map(|e| e.id().to_string()), Some("a".into()));
        assert_eq!(stream.recv().await.map(|e| e.id().to_string()), Some("b".into()));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_stream_dropped_reports_closed() {
        let (sink, stream) = event_channel();
        drop(stream);
        assert!(sink.is_closed());
        assert!(!sink.send(EngineEvent::Completed { id: "a".into() }).await);
    }
}
