//! Playlist retrieval and caching.
//!
//! Playlists are small compared to EPG feeds, so they are fetched whole,
//! decompressed if needed and parsed in place. The parsed form is cached
//! under a `channel`-kind fingerprint so repeated exports within the TTL
//! do not refetch the M3U.

use std::sync::Arc;

use tracing::debug;

use crate::errors::{AppResult, SourceError};
use crate::ingestor::{ParsedPlaylist, parse_m3u};
use crate::services::ArtifactCache;
use crate::utils::fingerprint::{ArtifactKind, FingerprintKey, MirrorSignature};
use crate::utils::url::UrlUtils;
use crate::utils::DecompressionService;

pub struct PlaylistService {
    client: reqwest::Client,
    cache: Arc<ArtifactCache>,
}

impl PlaylistService {
    pub fn new(client: reqwest::Client, cache: Arc<ArtifactCache>) -> Self {
        Self { client, cache }
    }

    /// Fetch and parse a playlist, consulting the cache first.
    pub async fn get(&self, url: &str) -> AppResult<ParsedPlaylist> {
        let key = Self::cache_key(url);
        if let Some(cached) = self.cache.get::<ParsedPlaylist>(&key) {
            debug!(
                "Playlist cache hit for {}",
                UrlUtils::obfuscate_credentials(url)
            );
            return Ok(cached);
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Http {
                status: response.status().as_u16(),
                message: format!(
                    "unexpected status fetching playlist {}",
                    UrlUtils::obfuscate_credentials(url)
                ),
            }
            .into());
        }

        let bytes = response.bytes().await?;
        let content = DecompressionService::decompress(bytes)
            .map_err(|e| SourceError::parse("m3u", e.to_string()))?;
        let playlist = parse_m3u(&String::from_utf8_lossy(&content));
        debug!(
            "Parsed playlist {} with {} channels",
            UrlUtils::obfuscate_credentials(url),
            playlist.channels.len()
        );

        self.cache.set(&key, &playlist, None);
        Ok(playlist)
    }

    fn cache_key(url: &str) -> String {
        FingerprintKey {
            kind: ArtifactKind::Channel,
            mirrors: vec![MirrorSignature {
                url: url.to_string(),
                ..Default::default()
            }],
            snapshots: Vec::new(),
            playlist_ids: Vec::new(),
            mappings: Vec::new(),
            window: None,
        }
        .digest()
    }
}
