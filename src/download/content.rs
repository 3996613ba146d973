// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Listing of the files a download produced, classified for playback.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Playback-oriented file classification. Ordering is display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Video,
    Subtitle,
    Image,
    Text,
    Other,
}

impl FileKind {
    /// Classify by extension, case-insensitively.
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "mp4" | "mkv" | "avi" | "mov" | "webm" | "m4v" => FileKind::Video,
            "srt" | "vtt" | "ass" | "ssa" => FileKind::Subtitle,
            "jpg" | "jpeg" | "png" | "gif" | "webp" => FileKind::Image,
            "txt" | "nfo" | "md" => FileKind::Text,
            _ => FileKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Video => "video",
            FileKind::Subtitle => "subtitle",
            FileKind::Image => "image",
            FileKind::Text => "text",
            FileKind::Other => "other",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file under a download's location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentFile {
    /// Path relative to the download location, `/`-separated
    pub name: String,
    /// Absolute path on disk
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    pub kind: FileKind,
}

/// Recursively list regular files under `root`, sorted by kind then name.
///
/// Blocking; call from `spawn_blocking` in async code.
pub fn list_content(root: &Path) -> std::io::Result<Vec<ContentFile>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();

            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let size = entry.metadata()?.len();
                let name = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(ContentFile {
                    kind: FileKind::from_path(&path),
                    name,
                    path,
                    size,
                });
            }
        }
    }

    files.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}
