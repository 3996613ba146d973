// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download record types.
//!
//! [`Download`] is the single persisted entity. Field names are serialized in
//! camelCase and status values in SCREAMING_CASE so existing download lists
//! written by the mobile app load unchanged.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque download identifier.
pub type DownloadId = String;

/// Name shown until the engine reports torrent metadata.
pub const PLACEHOLDER_NAME: &str = "Searching...";

/// Lifecycle state of a download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// Engine session is (believed to be) transferring data
    Downloading,
    /// Stopped by the user or by startup reconciliation
    Paused,
    /// All content received
    Completed,
    /// Engine reported a failure
    Error,
}

impl DownloadStatus {
    /// Returns true for states that only a restart can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Error)
    }

    /// Returns true if the download is actively transferring.
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Downloading)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Downloading => "DOWNLOADING",
            DownloadStatus::Paused => "PAUSED",
            DownloadStatus::Completed => "COMPLETED",
            DownloadStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DOWNLOADING" => Ok(DownloadStatus::Downloading),
            "PAUSED" => Ok(DownloadStatus::Paused),
            "COMPLETED" => Ok(DownloadStatus::Completed),
            "ERROR" => Ok(DownloadStatus::Error),
            other => Err(format!(
                "unknown status '{}' (expected downloading, paused, completed or error)",
                other
            )),
        }
    }
}

fn default_name() -> String {
    PLACEHOLDER_NAME.to_string()
}

/// A persisted download record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    /// Unique identifier, never reused
    #[serde(alias = "_id")]
    pub id: DownloadId,
    /// Magnet/torrent URI the download was created from
    pub source: String,
    /// Human-readable title
    #[serde(default = "default_name")]
    pub name: String,
    /// Current lifecycle state
    pub status: DownloadStatus,
    /// Percent complete (0-100)
    #[serde(default)]
    pub progress: u8,
    /// Bytes received so far
    #[serde(default)]
    pub downloaded_size: u64,
    /// Total payload size, 0 until metadata arrives
    #[serde(default)]
    pub total_size: u64,
    /// Current throughput in bytes per second
    #[serde(default)]
    pub download_rate: u64,
    /// Connected peers
    #[serde(default)]
    pub peers: u32,
    /// Connected seeders
    #[serde(default)]
    pub seeders: u32,
    /// Root folder of the downloaded content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Last engine error detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the record was created
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When the record was last mutated
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Download {
    /// Create a fresh record in the `DOWNLOADING` state with zeroed counters.
    pub fn new(id: impl Into<DownloadId>, source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source: source.into(),
            name: default_name(),
            status: DownloadStatus::Downloading,
            progress: 0,
            downloaded_size: 0,
            total_size: 0,
            download_rate: 0,
            peers: 0,
            seeders: 0,
            location: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow merge: only fields present in the patch change.
    ///
    /// `source` is immutable after creation and is ignored here.
    pub fn apply(&mut self, patch: &DownloadPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress.min(100);
        }
        if let Some(size) = patch.downloaded_size {
            self.downloaded_size = size;
        }
        if let Some(size) = patch.total_size {
            self.total_size = size;
        }
        if let Some(rate) = patch.download_rate {
            self.download_rate = rate;
        }
        if let Some(peers) = patch.peers {
            self.peers = peers;
        }
        if let Some(seeders) = patch.seeders {
            self.seeders = seeders;
        }
        if let Some(location) = &patch.location {
            self.location = location.clone();
        }
        if let Some(error) = &patch.error {
            self.error = error.clone();
        }
        self.updated_at = Utc::now();
    }

    /// Zero the swarm counters and throughput.
    pub fn reset_transfer_stats(&mut self) {
        self.download_rate = 0;
        self.peers = 0;
        self.seeders = 0;
    }

    /// Estimated seconds until completion at the current rate.
    pub fn eta_seconds(&self) -> Option<u64> {
        if !self.status.is_active() || self.download_rate == 0 || self.total_size == 0 {
            return None;
        }
        let remaining = self.total_size.saturating_sub(self.downloaded_size);
        Some(remaining / self.download_rate)
    }
}

/// Partial field set for registry `create`/`update` calls.
///
/// `location` and `error` are doubly optional so a patch can clear them:
/// `Some(None)` clears, `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadPatch {
    pub source: Option<String>,
    pub name: Option<String>,
    pub status: Option<DownloadStatus>,
    pub progress: Option<u8>,
    pub downloaded_size: Option<u64>,
    pub total_size: Option<u64>,
    pub download_rate: Option<u64>,
    pub peers: Option<u32>,
    pub seeders: Option<u32>,
    pub location: Option<Option<String>>,
    pub error: Option<Option<String>>,
}

impl DownloadPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn status(mut self, status: DownloadStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn downloaded_size(mut self, size: u64) -> Self {
        self.downloaded_size = Some(size);
        self
    }

    pub fn total_size(mut self, size: u64) -> Self {
        self.total_size = Some(size);
        self
    }

    pub fn download_rate(mut self, rate: u64) -> Self {
        self.download_rate = Some(rate);
        self
    }

    pub fn peers(mut self, peers: u32) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn seeders(mut self, seeders: u32) -> Self {
        self.seeders = Some(seeders);
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(Some(location.into()));
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }
}

/// Exact-match filter over record fields, AND-combined.
///
/// An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadFilter {
    pub status: Option<DownloadStatus>,
    pub source: Option<String>,
    pub name: Option<String>,
    pub location: Option<String>,
}

impl DownloadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: DownloadStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn matches(&self, download: &Download) -> bool {
        self.status.map_or(true, |s| download.status == s)
            && self.source.as_ref().map_or(true, |s| &download.source == s)
            && self.name.as_ref().map_or(true, |n| &download.name == n)
            && self
                .location
                .as_ref()
                .map_or(true, |l| download.location.as_ref() == Some(l))
    }
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(ID_ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Generate a download id: base-36 millisecond timestamp plus 11 random
/// base-36 characters.
pub fn generate_id() -> DownloadId {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..11)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", to_base36(millis), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_new_download_defaults() {
        let download = Download::new("abc", "magnet:?xt=urn:btih:abc");
        assert_eq!(download.name, PLACEHOLDER_NAME);
        assert_eq!(download.status, DownloadStatus::Downloading);
        assert_eq!(download.progress, 0);
        assert_eq!(download.total_size, 0);
        assert!(download.location.is_none());
    }

    #[test]
    fn test_apply_is_shallow() {
        let mut download = Download::new("abc", "magnet:one");
        download.apply(&DownloadPatch::new().name("Sintel").total_size(1000));
        assert_eq!(download.name, "Sintel");
        assert_eq!(download.total_size, 1000);
        assert_eq!(download.status, DownloadStatus::Downloading);

        download.apply(&DownloadPatch::new().status(DownloadStatus::Paused));
        assert_eq!(download.name, "Sintel");
        assert_eq!(download.status, DownloadStatus::Paused);
    }

    #[test]
    fn test_apply_ignores_source_and_clamps_progress() {
        let mut download = Download::new("abc", "magnet:one");
        download.apply(&DownloadPatch::new().source("magnet:two").progress(250));
        assert_eq!(download.source, "magnet:one");
        assert_eq!(download.progress, 100);
    }

    #[test]
    fn test_patch_can_clear_error() {
        let mut download = Download::new("abc", "magnet:one");
        download.apply(&DownloadPatch::new().error("tracker unreachable"));
        assert_eq!(download.error.as_deref(), Some("tracker unreachable"));
        download.apply(&DownloadPatch::new().clear_error());
        assert!(download.error.is_none());
    }

    #[test]
    fn test_filter_and_combines() {
        let mut download = Download::new("abc", "magnet:one");
        download.status = DownloadStatus::Paused;

        assert!(DownloadFilter::new().matches(&download));
        assert!(DownloadFilter::new().status(DownloadStatus::Paused).matches(&download));
        assert!(!DownloadFilter::new()
            .status(DownloadStatus::Paused)
            .source("magnet:two")
            .matches(&download));
        assert!(!DownloadFilter::new().location("/x").matches(&download));
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&DownloadStatus::Downloading).unwrap();
        assert_eq!(json, "\"DOWNLOADING\"");
        assert_eq!("paused".parse::<DownloadStatus>().unwrap(), DownloadStatus::Paused);
        assert!("stalled".parse::<DownloadStatus>().is_err());
    }

    #[test]
    fn test_reads_mobile_app_record() {
        let json = r#"{
            "_id": "lq2k3j4abcdefghijk",
            "downloadedSize": 500,
            "downloadRate": 0,
            "name": "Sintel",
            "peers": 0,
            "progress": 50,
            "seeders": 0,
            "source": "magnet:?xt=urn:btih:abc",
            "status": "PAUSED",
            "totalSize": 1000,
            "location": "/x/Sintel"
        }"#;
        let download: Download = serde_json::from_str(json).unwrap();
        assert_eq!(download.id, "lq2k3j4abcdefghijk");
        assert_eq!(download.status, DownloadStatus::Paused);
        assert_eq!(download.location.as_deref(), Some("/x/Sintel"));
        assert!(download.error.is_none());
    }

    #[test]
    fn test_eta_only_while_downloading() {
        let mut download = Download::new("abc", "magnet:one");
        download.total_size = 1000;
        download.downloaded_size = 400;
        download.download_rate = 100;
        assert_eq!(download.eta_seconds(), Some(6));

        download.status = DownloadStatus::Paused;
        assert_eq!(download.eta_seconds(), None);
    }

    #[test]
    fn test_generate_id_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.chars().all(|c| c.is_ascii_alphanumeric())));
    }
}
