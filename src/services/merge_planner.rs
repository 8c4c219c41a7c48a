//! Merge planning: which upstream feed serves which playlist channel.
//!
//! Given the playlist channel set, the per-channel mappings and the
//! enabled sources, the planner computes one group per distinct source
//! URL carrying the EPG-side ids to accept and the table translating
//! them back to playlist ids. An empty playlist degrades to one
//! everything-allowed group per distinct source URL.

use std::collections::HashMap;

use crate::ingestor::normalize_id;
use crate::models::{ChannelMapping, MergeGroup, PlaylistChannel, Source};

/// Output of one planning pass.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    pub groups: Vec<MergeGroup>,
    /// Playlist channels with no EPG coverage; they contribute only a
    /// channel header to the export.
    pub uncovered: Vec<String>,
}

pub fn plan(
    playlist: &[PlaylistChannel],
    mappings: &HashMap<String, ChannelMapping>,
    sources: &[Source],
    default_epg_url: Option<&str>,
) -> MergePlan {
    let enabled: HashMap<_, _> = sources
        .iter()
        .filter(|s| s.enabled)
        .map(|s| (s.id, s))
        .collect();

    if playlist.is_empty() {
        // No channel set to restrict to: pull every distinct feed whole
        let mut urls = Vec::new();
        if let Some(url) = default_epg_url {
            urls.push(url.to_string());
        }
        for source in sources.iter().filter(|s| s.enabled) {
            if !urls.contains(&source.url) {
                urls.push(source.url.clone());
            }
        }
        return MergePlan {
            groups: urls
                .into_iter()
                .map(|source_url| MergeGroup {
                    source_url,
                    allowed_ids: None,
                    id_map: HashMap::new(),
                })
                .collect(),
            uncovered: Vec::new(),
        };
    }

    let mut order: Vec<String> = Vec::new();
    let mut by_url: HashMap<String, MergeGroup> = HashMap::new();
    let mut uncovered = Vec::new();

    for channel in playlist {
        let mapping = mappings.get(&channel.id);
        let mapped_source_url = mapping
            .and_then(|m| m.source_id)
            .and_then(|id| enabled.get(&id))
            .map(|s| s.url.clone());

        let (url, epg_id) = match mapped_source_url {
            Some(url) => {
                let epg_id = mapping
                    .and_then(|m| m.epg_channel_id.clone())
                    .unwrap_or_else(|| channel.id.clone());
                (url, epg_id)
            }
            None => match default_epg_url {
                Some(url) => (url.to_string(), channel.id.clone()),
                None => {
                    uncovered.push(channel.id.clone());
                    continue;
                }
            },
        };

        let group = by_url.entry(url.clone()).or_insert_with(|| {
            order.push(url.clone());
            MergeGroup {
                source_url: url,
                allowed_ids: Some(Default::default()),
                id_map: HashMap::new(),
            }
        });
        let normalized = normalize_id(&epg_id);
        if let Some(allowed) = group.allowed_ids.as_mut() {
            allowed.insert(normalized.clone());
        }
        group.id_map.insert(normalized, channel.id.clone());
    }

    MergePlan {
        groups: order
            .into_iter()
            .filter_map(|url| by_url.remove(&url))
            .collect(),
        uncovered,
    }
}
