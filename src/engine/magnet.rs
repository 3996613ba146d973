// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Magnet URI parsing.

use url::Url;

use crate::error::EngineError;

const BTIH_PREFIX: &str = "urn:btih:";

/// Fields of a `magnet:` URI that matter for a download record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// Lowercased info hash, hex (40 chars) or base32 (32 chars)
    pub info_hash: String,
    /// `dn` display name
    pub display_name: Option<String>,
    /// `xl` exact length in bytes
    pub exact_length: Option<u64>,
    /// `tr` tracker URLs
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Parse a magnet URI.
    ///
    /// # Errors
    ///
    /// `EngineError::Fatal` if the URI is not a magnet link or carries no
    /// BitTorrent info hash.
    pub fn parse(uri: &str) -> Result<Self, EngineError> {
        let url = Url::parse(uri)
            .map_err(|e| EngineError::Fatal(format!("invalid source URI: {}", e)))?;
        if url.scheme() != "magnet" {
            return Err(EngineError::Fatal(format!(
                "unsupported source scheme '{}'",
                url.scheme()
            )));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut exact_length = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = value.strip_prefix(BTIH_PREFIX) {
                        if !is_valid_hash(hash) {
                            return Err(EngineError::Fatal(format!("invalid info hash '{}'", hash)));
                        }
                        info_hash = Some(hash.to_ascii_lowercase());
                    }
                }
                "dn" => {
                    let name = value.trim();
                    if !name.is_empty() {
                        display_name = Some(name.to_string());
                    }
                }
                "xl" => exact_length = value.parse().ok(),
                "tr" => trackers.push(value.to_string()),
                _ => {}
            }
        }

        let info_hash =
            info_hash.ok_or_else(|| EngineError::Fatal("magnet link has no info hash".into()))?;

        Ok(Self {
            info_hash,
            display_name,
            exact_length,
            trackers,
        })
    }

    /// Display name, falling back to a short form of the info hash.
    pub fn name(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => format!("torrent-{}", &self.info_hash[..8.min(self.info_hash.len())]),
        }
    }
}

fn is_valid_hash(hash: &str) -> bool {
    match hash.len() {
        40 => hash.chars().all(|c| c.is_ascii_hexdigit()),
        32 => hash
            .chars()
            .all(|c| c.is_ascii_alphabetic() || ('2'..='7').contains(&c)),
        _ => false,
    }
}
