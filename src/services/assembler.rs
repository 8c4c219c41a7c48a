//! Assembly: fetch, parse, merge and backfill one schedule set.
//!
//! Each merge group is fetched through the mirror concurrently, then the
//! mirror files are stream-parsed in parallel blocking tasks. A group
//! that fails to fetch or parse contributes nothing; the assembly
//! succeeds with a degraded set. After the live merge, history backfill
//! walks each group's snapshots newest-first to reconstruct past days
//! the upstream no longer serves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::ingestor::xmltv_stream::{self, XmltvParseOptions};
use crate::ingestor::{ParsedGuide, normalize_id};
use crate::mirror::MirrorStore;
use crate::models::{
    AssembledEpg, ChannelInfo, ChannelMapping, EpgChannel, MergeGroup, PlaylistChannel,
    Programme, Source,
};
use crate::services::merge_planner;
use crate::services::ArtifactCache;
use crate::utils::fingerprint::{
    ArtifactKind, FingerprintKey, MappingSignature, SnapshotSignature,
};

/// Snapshot stamps folded into fingerprints. Rotations beyond this depth
/// cannot change backfill output within a realistic window.
const FINGERPRINT_SNAPSHOT_DEPTH: usize = 8;

/// Everything one assembly pass needs, passed by reference from the
/// request handler's settings snapshot.
pub struct AssemblyInput<'a> {
    pub playlist: &'a [PlaylistChannel],
    pub mappings: &'a HashMap<String, ChannelMapping>,
    pub sources: &'a [Source],
    pub default_epg_url: Option<&'a str>,
    /// `[from, to)` in milliseconds since epoch; `None` means full.
    pub window: Option<(i64, i64)>,
    pub history_backfill: bool,
}

/// Per-group outcome, surfaced by the debug API.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStat {
    pub source_url: String,
    pub fetched: bool,
    pub programmes: usize,
    pub backfilled: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct AssemblyOutput {
    pub epg: AssembledEpg,
    /// `epg`-kind key; export handlers re-address it per artifact kind.
    pub fingerprint: FingerprintKey,
    pub group_stats: Vec<GroupStat>,
    pub from_cache: bool,
}

pub struct EpgAssembler {
    mirror: Arc<MirrorStore>,
    cache: Arc<ArtifactCache>,
}

impl EpgAssembler {
    pub fn new(mirror: Arc<MirrorStore>, cache: Arc<ArtifactCache>) -> Self {
        Self { mirror, cache }
    }

    /// Compute the half-open request window from day counts.
    ///
    /// The reference instant is truncated to the hour so that
    /// back-to-back requests with the same day counts produce the same
    /// window, and therefore the same fingerprint.
    pub fn window_from_days(past_days: u32, future_days: u32) -> (i64, i64) {
        let now_ms = Utc::now().timestamp_millis();
        let hour_ms = 3_600_000;
        let anchor = (now_ms / hour_ms) * hour_ms;
        let day_ms = 86_400_000;
        (
            anchor - i64::from(past_days) * day_ms,
            anchor + i64::from(future_days) * day_ms,
        )
    }

    /// Run the full pipeline for one request.
    pub async fn assemble(&self, input: &AssemblyInput<'_>) -> AppResult<AssemblyOutput> {
        let plan = merge_planner::plan(
            input.playlist,
            input.mappings,
            input.sources,
            input.default_epg_url,
        );

        // Fan out mirror fetches; failures degrade to whatever mirror
        // state exists for fingerprinting purposes.
        let fetches = futures::future::join_all(
            plan.groups
                .iter()
                .map(|group| self.mirror.fetch(&group.source_url)),
        )
        .await;

        let mut mirrors = Vec::with_capacity(plan.groups.len());
        let mut snapshots = Vec::with_capacity(plan.groups.len());
        for (group, fetch) in plan.groups.iter().zip(&fetches) {
            let signature = match fetch {
                Ok(file) => file.signature.clone(),
                Err(_) => self.mirror.signature(&group.source_url).await,
            };
            mirrors.push(signature);
            snapshots.push(SnapshotSignature {
                url: group.source_url.clone(),
                timestamps: self
                    .mirror
                    .list_snapshots(&group.source_url)
                    .iter()
                    .take(FINGERPRINT_SNAPSHOT_DEPTH)
                    .map(|s| s.stamp())
                    .collect(),
            });
        }

        let fingerprint = FingerprintKey {
            kind: ArtifactKind::Epg,
            mirrors,
            snapshots,
            playlist_ids: input.playlist.iter().map(|c| c.id.clone()).collect(),
            mappings: mapping_signatures(input.playlist, input.mappings),
            window: input.window,
        };
        let digest = fingerprint.digest();

        if let Some(epg) = self.cache.get::<AssembledEpg>(&digest) {
            debug!("Assembly cache hit for {}", digest);
            return Ok(AssemblyOutput {
                epg,
                fingerprint,
                group_stats: Vec::new(),
                from_cache: true,
            });
        }

        // Parse every fetched mirror in parallel blocking tasks
        let mut parse_tasks = Vec::new();
        for (group, fetch) in plan.groups.iter().zip(&fetches) {
            let Ok(file) = fetch else {
                parse_tasks.push(None);
                continue;
            };
            let path = file.path.clone();
            let options = XmltvParseOptions {
                allowed_ids: group.allowed_ids.clone(),
                window: input.window,
                limit_programmes: None,
            };
            parse_tasks.push(Some(tokio::task::spawn_blocking(move || {
                xmltv_stream::parse_path(&path, &options)
            })));
        }

        let mut parsed: Vec<Option<ParsedGuide>> = Vec::with_capacity(parse_tasks.len());
        let mut group_stats = Vec::with_capacity(plan.groups.len());
        for ((group, fetch), task) in plan.groups.iter().zip(&fetches).zip(parse_tasks) {
            let (guide, error) = match (fetch, task) {
                (Err(e), _) => (None, Some(e.to_string())),
                (Ok(_), Some(task)) => match task.await {
                    Ok(Ok(guide)) => (Some(guide), None),
                    Ok(Err(e)) => (None, Some(e.to_string())),
                    Err(e) => (None, Some(format!("parse task failed: {e}"))),
                },
                (Ok(_), None) => (None, Some("parse task missing".to_string())),
            };
            if let Some(error) = &error {
                warn!(
                    "Group {} contributed nothing: {}",
                    group.source_url, error
                );
            }
            group_stats.push(GroupStat {
                source_url: group.source_url.clone(),
                fetched: fetch.is_ok(),
                programmes: guide.as_ref().map(|g| g.programmes.len()).unwrap_or(0),
                backfilled: 0,
                error,
            });
            parsed.push(guide);
        }

        let mut merge = MergeState::new(input.playlist, input.mappings);
        for (group, guide) in plan.groups.iter().zip(parsed) {
            if let Some(guide) = guide {
                merge.absorb(group, guide);
            }
        }

        if input.history_backfill {
            self.backfill(input, &plan.groups, &mut merge, &mut group_stats)
                .await;
        }

        let epg = merge.finish();
        self.cache.set(&digest, &epg, None);

        Ok(AssemblyOutput {
            epg,
            fingerprint,
            group_stats,
            from_cache: false,
        })
    }

    /// Reconstruct past days from rotated snapshots.
    ///
    /// Upstream EPGs that only serve today and future cannot be
    /// backfilled directly; mirroring each successful fetch and rotating
    /// on change accumulates de-facto history whose union approximates a
    /// sliding multi-day archive.
    async fn backfill(
        &self,
        input: &AssemblyInput<'_>,
        groups: &[MergeGroup],
        merge: &mut MergeState<'_>,
        group_stats: &mut [GroupStat],
    ) {
        let now_ms = Utc::now().timestamp_millis();
        let (from, to) = input.window.unwrap_or((i64::MIN, i64::MAX));
        if from >= now_ms {
            return;
        }
        let past_window = (from, to.min(now_ms));

        for (index, group) in groups.iter().enumerate() {
            let snapshots = self.mirror.list_snapshots(&group.source_url);
            if snapshots.is_empty() {
                continue;
            }
            let mut earliest_ms = i64::MAX;
            let mut added_total = 0usize;
            for snapshot in snapshots {
                let options = XmltvParseOptions {
                    allowed_ids: group.allowed_ids.clone(),
                    window: Some(past_window),
                    limit_programmes: None,
                };
                let path = snapshot.path.clone();
                let guide = tokio::task::spawn_blocking(move || {
                    xmltv_stream::parse_path(&path, &options)
                })
                .await;
                let guide = match guide {
                    Ok(Ok(guide)) => guide,
                    Ok(Err(e)) => {
                        debug!(
                            "Skipping unreadable snapshot {}: {}",
                            snapshot.path.display(),
                            e
                        );
                        continue;
                    }
                    Err(e) => {
                        debug!("Snapshot parse task failed: {}", e);
                        continue;
                    }
                };

                let added = merge.absorb_backfill(group, guide, &mut earliest_ms);
                added_total += added;
                if added == 0 {
                    break;
                }
                if from > i64::MIN && earliest_ms <= from {
                    // The accumulated history already spans the full
                    // past window; older snapshots cannot add coverage.
                    break;
                }
            }
            if let Some(stat) = group_stats.get_mut(index) {
                stat.backfilled += added_total;
            }
            if added_total > 0 {
                debug!(
                    "Backfilled {} programmes for {}",
                    added_total, group.source_url
                );
            }
        }
    }

    /// Channels-only pass against a source's mirror, for rescans.
    pub async fn scan_channels(&self, url: &str) -> AppResult<Vec<EpgChannel>> {
        let file = self.mirror.fetch(url).await?;
        let options = XmltvParseOptions::channels_only();
        let guide = tokio::task::spawn_blocking(move || {
            xmltv_stream::parse_path(&file.path, &options)
        })
        .await
        .map_err(|e| AppError::internal(format!("scan task failed: {e}")))??;
        Ok(guide.channels)
    }
}

fn mapping_signatures(
    playlist: &[PlaylistChannel],
    mappings: &HashMap<String, ChannelMapping>,
) -> Vec<MappingSignature> {
    let relevant: Box<dyn Iterator<Item = (&String, &ChannelMapping)>> = if playlist.is_empty() {
        Box::new(mappings.iter())
    } else {
        Box::new(playlist.iter().filter_map(|c| {
            mappings.get_key_value(&c.id)
        }))
    };
    relevant
        .map(|(channel_id, m)| MappingSignature {
            channel_id: channel_id.clone(),
            source_id: m.source_id,
            epg_channel_id: m.epg_channel_id.clone(),
            offset_minutes: m.offset_minutes(),
            zone_id: m.zone_id.clone(),
            shift_mode: m.shift_mode,
        })
        .collect()
}

/// Accumulates merged channels and schedules across groups.
struct MergeState<'a> {
    mappings: &'a HashMap<String, ChannelMapping>,
    epg: AssembledEpg,
    /// De-duplication on `(playlist_id, start_raw)`: the raw start is
    /// stable across sources and snapshots.
    seen: HashSet<(String, String)>,
}

impl<'a> MergeState<'a> {
    fn new(playlist: &[PlaylistChannel], mappings: &'a HashMap<String, ChannelMapping>) -> Self {
        let mut epg = AssembledEpg::default();
        for channel in playlist {
            epg.channel_order.push(channel.id.clone());
            epg.channels.insert(
                channel.id.clone(),
                ChannelInfo {
                    display_name: channel.name.clone(),
                    icon_url: channel.logo_url.clone(),
                },
            );
        }
        Self {
            mappings,
            epg,
            seen: HashSet::new(),
        }
    }

    fn absorb(&mut self, group: &MergeGroup, guide: ParsedGuide) {
        for channel in guide.channels {
            let target = self.target_id(group, &channel.id);
            self.ensure_channel(&target);
            if let Some(info) = self.epg.channels.get_mut(&target) {
                // First non-empty wins across merged sources
                if info.display_name.is_none() {
                    info.display_name = channel.display_name;
                }
                if info.icon_url.is_none() {
                    info.icon_url = channel.icon_url;
                }
            }
        }
        let mut earliest = i64::MAX;
        for programme in guide.programmes {
            self.insert_programme(group, programme, &mut earliest);
        }
    }

    /// Returns how many programmes a backfill snapshot actually added.
    fn absorb_backfill(
        &mut self,
        group: &MergeGroup,
        guide: ParsedGuide,
        earliest_ms: &mut i64,
    ) -> usize {
        let mut added = 0;
        for programme in guide.programmes {
            if self.insert_programme(group, programme, earliest_ms) {
                added += 1;
            }
        }
        added
    }

    fn insert_programme(
        &mut self,
        group: &MergeGroup,
        mut programme: Programme,
        earliest_ms: &mut i64,
    ) -> bool {
        let target = self.target_id(group, &programme.channel_id);
        if !self
            .seen
            .insert((target.clone(), programme.start_raw.clone()))
        {
            return false;
        }
        // Pre-apply the per-channel minute offset so sorting, window
        // reasoning and the JSON API all see shifted instants; the
        // export renderer re-derives formatted timestamps.
        let offset = self
            .mappings
            .get(&target)
            .map(|m| m.offset_minutes())
            .unwrap_or(0);
        if offset != 0 {
            let delta = chrono::Duration::minutes(i64::from(offset));
            programme.start_utc += delta;
            programme.stop_utc = programme.stop_utc.map(|s| s + delta);
        }
        *earliest_ms = (*earliest_ms).min(programme.start_utc.timestamp_millis());
        programme.channel_id = target.clone();
        self.ensure_channel(&target);
        self.epg.schedules.entry(target).or_default().push(programme);
        true
    }

    /// Translate an EPG-side id to its playlist id. Unmapped ids (the
    /// empty-playlist case) stay on the normalized form so channel
    /// headers and programmes land under the same key.
    fn target_id(&self, group: &MergeGroup, epg_id: &str) -> String {
        let normalized = normalize_id(epg_id);
        match group.id_map.get(&normalized) {
            Some(playlist_id) => playlist_id.clone(),
            None => normalized,
        }
    }

    fn ensure_channel(&mut self, id: &str) {
        if !self.epg.channels.contains_key(id) {
            self.epg.channel_order.push(id.to_string());
            self.epg.channels.insert(id.to_string(), ChannelInfo::default());
        }
    }

    fn finish(mut self) -> AssembledEpg {
        for programmes in self.epg.schedules.values_mut() {
            programmes.sort_by_key(|p| p.start_utc);
        }
        self.epg
    }
}
