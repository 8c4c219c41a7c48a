//! Domain models shared across the ingest, merge and export pipeline.
//!
//! The wire model tolerates missing fields throughout: optional fields stay
//! optional rather than being erased to empty strings, and raw XMLTV
//! timestamps are kept alongside their parsed UTC instants so the export
//! fast path can pass the original bytes through untouched.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// One schedule record for one channel, immutable once parsed.
///
/// `start_raw`/`stop_raw` preserve the original XMLTV timestamp strings
/// verbatim, including their numeric offset.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Programme {
    pub channel_id: String,
    pub start_utc: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_utc: Option<DateTime<Utc>>,
    pub start_raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

/// Channel metadata as discovered in an XMLTV document.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EpgChannel {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

/// One entry of the user's IPTV playlist. Consumed, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistChannel {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    pub stream_url: String,
}

/// A configured EPG source. Persisted in `settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: Uuid,
    pub url: String,
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scanned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<usize>,
}

/// How a per-channel time shift is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ShiftMode {
    /// Shift in a named time zone, honoring DST at the shifted instant.
    #[default]
    Wall,
    /// Keep the wall digits, adjust only the numeric offset field.
    Offset,
}

/// Per-playlist-channel override: source selection, id remapping and
/// time shifting. Persisted in `settings.json`, keyed by playlist id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMapping {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Uuid>,
    /// EPG-side id to pull from the source; defaults to the playlist id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epg_channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_minutes: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub shift_mode: ShiftMode,
}

impl ChannelMapping {
    pub fn offset_minutes(&self) -> i32 {
        self.offset_minutes.unwrap_or(0)
    }

    /// True when the mapping cannot change any emitted timestamp.
    pub fn is_time_neutral(&self) -> bool {
        self.offset_minutes() == 0
            && (self.zone_id.is_none() || self.shift_mode == ShiftMode::Offset)
    }
}

/// User-facing defaults, updated through the settings API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epg_url: Option<String>,
    #[serde(default = "default_true")]
    pub use_playlist_epg: bool,
    #[serde(default = "default_past_days")]
    pub past_days: u32,
    #[serde(default = "default_future_days")]
    pub future_days: u32,
    #[serde(default = "default_true")]
    pub history_backfill: bool,
    #[serde(default = "default_retention_days")]
    pub history_retention_days: u32,
}

fn default_true() -> bool {
    true
}

fn default_past_days() -> u32 {
    7
}

fn default_future_days() -> u32 {
    3
}

fn default_retention_days() -> u32 {
    21
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            playlist_url: None,
            epg_url: None,
            use_playlist_epg: true,
            past_days: default_past_days(),
            future_days: default_future_days(),
            history_backfill: true,
            history_retention_days: default_retention_days(),
        }
    }
}

/// Everything persisted under `<data>/settings.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub mappings: HashMap<String, ChannelMapping>,
}

/// Transient plan for pulling one upstream feed during assembly.
///
/// `allowed_ids` of `None` means every channel in the feed is accepted.
/// `id_map` translates normalized EPG-side ids to playlist ids.
#[derive(Debug, Clone)]
pub struct MergeGroup {
    pub source_url: String,
    pub allowed_ids: Option<std::collections::HashSet<String>>,
    pub id_map: HashMap<String, String>,
}

/// Channel header data for the export, merged from playlist and EPG
/// metadata. Playlist name/logo win when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

/// Result of one full assembly pass: ordered channels with merged,
/// sorted schedules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledEpg {
    /// Export enumeration order: playlist insertion order, else
    /// EPG-discovery order.
    pub channel_order: Vec<String>,
    pub channels: HashMap<String, ChannelInfo>,
    pub schedules: HashMap<String, Vec<Programme>>,
}

/// Cached result of a source rescan, persisted under
/// `<data>/source-cache/<sourceId>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChannelCache {
    pub source_id: Uuid,
    pub scanned_at: DateTime<Utc>,
    pub channels: Vec<EpgChannel>,
}

/// Lifecycle of one prewarm job. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PrewarmState {
    Queued,
    Running,
    Done,
    Error,
}

/// Status record tracked per prewarm job; resolvable under both the
/// transient job key and the final fingerprint key.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrewarmJob {
    pub status: PrewarmState,
    pub percent: u8,
    pub message: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub export_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_key: Option<String>,
}
