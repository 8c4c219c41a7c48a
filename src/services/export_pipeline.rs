//! Shared export pipeline: resolve request inputs, assemble, address the
//! artifact and render.
//!
//! Both the synchronous export handlers and the prewarm scheduler drive
//! this service, so the two paths produce identical bytes for identical
//! fingerprints and share the on-disk artifact cache.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::models::{PersistedState, PlaylistChannel};
use crate::services::assembler::{AssemblyInput, AssemblyOutput, EpgAssembler};
use crate::services::{ExportRenderer, PlaylistService, SettingsStore};
use crate::utils::fingerprint::ArtifactKind;

/// Minimum plausible artifact size. Anything smaller is treated as a
/// failed write and rebuilt.
pub const MIN_ARTIFACT_BYTES: u64 = 100;

/// Query-level export parameters, before defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct ExportParams {
    pub past_days: Option<u32>,
    pub future_days: Option<u32>,
    pub full: bool,
    pub playlist: Option<String>,
    pub epg: Option<String>,
}

/// An assembled export addressed by its artifact fingerprint, ready to
/// render.
pub struct PreparedExport {
    pub state: PersistedState,
    pub assembly: AssemblyOutput,
    pub digest: String,
    pub artifact_path: Option<PathBuf>,
}

pub struct ExportPipeline {
    store: Arc<SettingsStore>,
    playlists: Arc<PlaylistService>,
    assembler: Arc<EpgAssembler>,
    renderer: Arc<ExportRenderer>,
    exports_dir: PathBuf,
}

impl ExportPipeline {
    pub fn new(
        store: Arc<SettingsStore>,
        playlists: Arc<PlaylistService>,
        assembler: Arc<EpgAssembler>,
        renderer: Arc<ExportRenderer>,
        exports_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            playlists,
            assembler,
            renderer,
            exports_dir,
        }
    }

    pub fn store(&self) -> &Arc<SettingsStore> {
        &self.store
    }

    pub fn playlists(&self) -> &Arc<PlaylistService> {
        &self.playlists
    }

    pub fn assembler(&self) -> &Arc<EpgAssembler> {
        &self.assembler
    }

    /// Resolve the request window. Absent parameters imply `full`.
    pub fn resolve_window(&self, params: &ExportParams) -> Option<(i64, i64)> {
        if params.full {
            return None;
        }
        if params.past_days.is_none() && params.future_days.is_none() {
            return None;
        }
        let settings = self.store.settings();
        Some(EpgAssembler::window_from_days(
            params.past_days.unwrap_or(settings.past_days),
            params.future_days.unwrap_or(settings.future_days),
        ))
    }

    /// Resolve the playlist and default EPG URL for a request, honoring
    /// the configured defaults and the playlist's own EPG hint.
    pub async fn resolve_playlist(
        &self,
        playlist_param: Option<&str>,
        epg_param: Option<&str>,
    ) -> AppResult<(Vec<PlaylistChannel>, Option<String>)> {
        let settings = self.store.settings();
        let playlist_url = playlist_param
            .map(|u| u.to_string())
            .or(settings.playlist_url);

        let (channels, playlist_epg_hint) = match playlist_url {
            Some(url) => {
                let parsed = self.playlists.get(&url).await?;
                (parsed.channels, parsed.epg_url)
            }
            None => (Vec::new(), None),
        };

        let default_epg_url = epg_param
            .map(|u| u.to_string())
            .or(settings.epg_url)
            .or_else(|| {
                if settings.use_playlist_epg {
                    playlist_epg_hint
                } else {
                    None
                }
            });

        Ok((channels, default_epg_url))
    }

    /// Assemble schedules for a request and address the resulting
    /// artifact. Does not render yet.
    pub async fn prepare(
        &self,
        params: &ExportParams,
        kind: ArtifactKind,
    ) -> AppResult<PreparedExport> {
        let state = self.store.snapshot();
        let (playlist, default_epg_url) = self
            .resolve_playlist(params.playlist.as_deref(), params.epg.as_deref())
            .await?;

        if playlist.is_empty() && default_epg_url.is_none() && state.sources.is_empty() {
            return Err(AppError::validation(
                "no playlist, EPG URL or sources configured",
            ));
        }

        let window = self.resolve_window(params);
        let input = AssemblyInput {
            playlist: &playlist,
            mappings: &state.mappings,
            sources: &state.sources,
            default_epg_url: default_epg_url.as_deref(),
            window,
            history_backfill: state.settings.history_backfill,
        };
        let assembly = self.assembler.assemble(&input).await?;

        let digest = assembly.fingerprint.with_kind(kind).digest();
        let artifact_path = match kind {
            ArtifactKind::ExportGz => Some(self.exports_dir.join(format!("{digest}.xml.gz"))),
            _ => None,
        };

        Ok(PreparedExport {
            state,
            assembly,
            digest,
            artifact_path,
        })
    }

    /// True when a valid artifact already exists for a prepared export.
    pub fn artifact_exists(&self, prepared: &PreparedExport) -> bool {
        prepared
            .artifact_path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len() > MIN_ARTIFACT_BYTES)
            .unwrap_or(false)
    }

    /// Render a prepared export, reusing the disk artifact when its
    /// fingerprint already produced one.
    pub async fn finish(&self, prepared: &PreparedExport, gzip: bool) -> AppResult<(Vec<u8>, bool)> {
        if let Some(path) = prepared.artifact_path.as_deref() {
            if self.artifact_exists(prepared) {
                debug!("Serving export {} from disk artifact", prepared.digest);
                return Ok((tokio::fs::read(path).await?, true));
            }
            let bytes = self
                .renderer
                .render_to_file(
                    &prepared.assembly.epg,
                    &prepared.state.mappings,
                    gzip,
                    path,
                )
                .await?;
            info!(
                "Built export artifact {} ({} bytes)",
                prepared.digest,
                bytes.len()
            );
            return Ok((bytes, false));
        }

        let bytes = self
            .renderer
            .render(&prepared.assembly.epg, &prepared.state.mappings, gzip)?;
        Ok((bytes, false))
    }
}
