//! HTTP handlers.
//!
//! Handlers stay thin: parameter validation at the boundary, then
//! delegation to the service layer. Responses are plain JSON shapes;
//! errors map through `responses.rs`.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::errors::{AppError, AppResult, WebError};
use crate::models::{ChannelMapping, PlaylistChannel, Settings, SourceChannelCache};
use crate::services::assembler::{AssemblyInput, EpgAssembler};
use crate::services::export_pipeline::ExportParams;
use crate::utils::UrlUtils;
use crate::utils::fingerprint::ArtifactKind;

use super::AppState;

// ---------------------------------------------------------------------
// Query and body shapes

#[derive(Debug, Deserialize, IntoParams)]
pub struct ChannelsQuery {
    /// Playlist URL; defaults to the configured playlist.
    pub playlist: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct EpgQuery {
    pub playlist: Option<String>,
    pub epg: Option<String>,
    pub debug: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct EpgChannelQuery {
    pub id: String,
    /// Window start, milliseconds since epoch (inclusive).
    pub from: Option<i64>,
    /// Window end, milliseconds since epoch (exclusive).
    pub to: Option<i64>,
    pub playlist: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct ExportQuery {
    pub past_days: Option<u32>,
    pub future_days: Option<u32>,
    pub full: Option<String>,
    pub playlist: Option<String>,
    pub epg: Option<String>,
    pub filename: Option<String>,
}

impl ExportQuery {
    fn to_params(&self) -> ExportParams {
        ExportParams {
            past_days: self.past_days,
            future_days: self.future_days,
            full: flag(self.full.as_deref()),
            playlist: self.playlist.clone(),
            epg: self.epg.clone(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrewarmRequest {
    pub past_days: Option<u32>,
    pub future_days: Option<u32>,
    pub full: Option<bool>,
    pub playlist: Option<String>,
    pub epg: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct StatusQuery {
    pub key: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSourceRequest {
    pub url: String,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSourceRequest {
    pub url: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleMappingUpsert {
    channel_id: String,
    #[serde(flatten)]
    mapping: ChannelMapping,
}

#[derive(Debug, Deserialize)]
struct BulkMappingUpsert {
    mappings: HashMap<String, ChannelMapping>,
}

fn flag(value: Option<&str>) -> bool {
    matches!(value, Some("1") | Some("true") | Some("yes"))
}

fn parse_uuid(raw: &str) -> AppResult<Uuid> {
    raw.parse()
        .map_err(|_| AppError::validation(format!("invalid source id '{raw}'")))
}

// ---------------------------------------------------------------------
// Health

#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")))]
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------
// Playlist channels

/// Parse the playlist and return its channels plus the detected EPG URL.
#[utoipa::path(get, path = "/api/channels", params(ChannelsQuery),
    responses((status = 200, description = "Playlist channels"),
              (status = 400, description = "No playlist configured")))]
pub async fn get_channels(
    State(state): State<AppState>,
    Query(query): Query<ChannelsQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let playlist_url = query
        .playlist
        .or_else(|| state.store.settings().playlist_url)
        .ok_or_else(|| WebError::missing_parameter("playlist"))?;
    let parsed = state.pipeline.playlists().get(&playlist_url).await?;
    Ok(Json(json!({
        "channels": parsed.channels,
        "epgUrl": parsed.epg_url,
    })))
}

// ---------------------------------------------------------------------
// Assembled schedules

/// Assembled schedules within the default window.
#[utoipa::path(get, path = "/api/epg", params(EpgQuery),
    responses((status = 200, description = "Merged schedules")))]
pub async fn get_epg(
    State(state): State<AppState>,
    Query(query): Query<EpgQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let snapshot = state.store.snapshot();
    let (playlist, default_epg_url) = state
        .pipeline
        .resolve_playlist(query.playlist.as_deref(), query.epg.as_deref())
        .await?;
    let window = EpgAssembler::window_from_days(
        snapshot.settings.past_days,
        snapshot.settings.future_days,
    );
    let input = AssemblyInput {
        playlist: &playlist,
        mappings: &snapshot.mappings,
        sources: &snapshot.sources,
        default_epg_url: default_epg_url.as_deref(),
        window: Some(window),
        history_backfill: snapshot.settings.history_backfill,
    };
    let assembly = state.pipeline.assembler().assemble(&input).await?;

    let mut body = json!({
        "channelOrder": assembly.epg.channel_order,
        "channels": assembly.epg.channels,
        "schedules": assembly.epg.schedules,
    });
    if flag(query.debug.as_deref()) {
        body["debug"] = json!({
            "fromCache": assembly.from_cache,
            "groups": assembly.group_stats,
            "fingerprint": assembly.fingerprint.digest(),
            "window": window,
        });
    }
    Ok(Json(body))
}

/// One channel's schedules in `[from, to)`, with a fingerprint ETag.
#[utoipa::path(get, path = "/api/epg/channel", params(EpgChannelQuery),
    responses((status = 200, description = "Channel schedules"),
              (status = 304, description = "Not modified")))]
pub async fn get_epg_channel(
    State(state): State<AppState>,
    Query(query): Query<EpgChannelQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    if query.id.trim().is_empty() {
        return Err(AppError::validation("id must not be empty"));
    }

    let snapshot = state.store.snapshot();
    let (playlist, default_epg_url) = state
        .pipeline
        .resolve_playlist(query.playlist.as_deref(), None)
        .await?;
    let channel = playlist
        .into_iter()
        .find(|c| c.id == query.id)
        .unwrap_or_else(|| PlaylistChannel {
            id: query.id.clone(),
            name: None,
            group: None,
            logo_url: None,
            stream_url: String::new(),
        });

    let default_window = EpgAssembler::window_from_days(
        snapshot.settings.past_days,
        snapshot.settings.future_days,
    );
    let window = (
        query.from.unwrap_or(default_window.0),
        query.to.unwrap_or(default_window.1),
    );
    if window.0 >= window.1 {
        return Err(AppError::validation("from must be before to"));
    }

    let channels = [channel];
    let input = AssemblyInput {
        playlist: &channels,
        mappings: &snapshot.mappings,
        sources: &snapshot.sources,
        default_epg_url: default_epg_url.as_deref(),
        window: Some(window),
        history_backfill: snapshot.settings.history_backfill,
    };
    let assembly = state.pipeline.assembler().assemble(&input).await?;
    let digest = assembly
        .fingerprint
        .with_kind(ArtifactKind::Channel)
        .digest();

    let etag = format!("\"{digest}\"");
    let matches = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().trim_matches('"') == digest))
        .unwrap_or(false);
    if matches {
        return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response());
    }

    let programmes = assembly
        .epg
        .schedules
        .get(&query.id)
        .cloned()
        .unwrap_or_default();
    let body = Json(json!({
        "channel": query.id,
        "from": window.0,
        "to": window.1,
        "programmes": programmes,
    }));
    Ok(([(header::ETAG, etag)], body).into_response())
}

// ---------------------------------------------------------------------
// Exports

/// Gzipped XMLTV export.
#[utoipa::path(get, path = "/epg.xml.gz", params(ExportQuery),
    responses((status = 200, description = "Gzipped XMLTV document", content_type = "application/gzip")))]
pub async fn export_gzip(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> AppResult<Response> {
    let params = query.to_params();
    let prepared = state
        .pipeline
        .prepare(&params, ArtifactKind::ExportGz)
        .await?;
    let (bytes, reused) = state.pipeline.finish(&prepared, true).await?;
    info!(
        "Export {} served ({} bytes, reused: {})",
        prepared.digest,
        bytes.len(),
        reused
    );

    let filename = query.filename.as_deref().unwrap_or("epg.xml.gz");
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// Plain XMLTV export.
#[utoipa::path(get, path = "/epg.xml", params(ExportQuery),
    responses((status = 200, description = "XMLTV document", content_type = "application/xml")))]
pub async fn export_plain(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> AppResult<Response> {
    let params = query.to_params();
    let prepared = state
        .pipeline
        .prepare(&params, ArtifactKind::ExportXml)
        .await?;
    let (bytes, _) = state.pipeline.finish(&prepared, false).await?;

    let filename = query.filename.as_deref().unwrap_or("epg.xml");
    Ok((
        [
            (header::CONTENT_TYPE, "application/xml; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// Start building an export in the background.
#[utoipa::path(post, path = "/api/export/prewarm", request_body = PrewarmRequest,
    responses((status = 200, description = "Job accepted")))]
pub async fn prewarm_export(
    State(state): State<AppState>,
    Json(request): Json<PrewarmRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let params = ExportParams {
        past_days: request.past_days,
        future_days: request.future_days,
        full: request.full.unwrap_or(false),
        playlist: request.playlist,
        epg: request.epg,
    };
    let ticket = state.prewarm.prewarm(params).await;
    Ok(Json(json!({
        "key": ticket.key,
        "started": true,
        "exportUrl": ticket.export_url,
    })))
}

/// Prewarm job status by transient key or fingerprint.
#[utoipa::path(get, path = "/api/export/status", params(StatusQuery),
    responses((status = 200, description = "Job status", body = crate::models::PrewarmJob),
              (status = 404, description = "Unknown key")))]
pub async fn export_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> AppResult<Json<crate::models::PrewarmJob>> {
    state
        .prewarm
        .status(&query.key)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found("prewarm job", query.key))
}

// ---------------------------------------------------------------------
// Settings

#[utoipa::path(get, path = "/api/settings",
    responses((status = 200, description = "Current defaults", body = Settings)))]
pub async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.store.settings())
}

#[utoipa::path(post, path = "/api/settings", request_body = Settings,
    responses((status = 200, description = "Updated defaults", body = Settings)))]
pub async fn update_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> AppResult<Json<Settings>> {
    let updated = state.store.update_settings(settings).await?;
    state
        .mirror
        .set_retention_days(updated.history_retention_days);
    Ok(Json(updated))
}

// ---------------------------------------------------------------------
// Sources

#[utoipa::path(get, path = "/api/sources",
    responses((status = 200, description = "Configured sources")))]
pub async fn list_sources(State(state): State<AppState>) -> Json<Vec<crate::models::Source>> {
    Json(state.store.sources())
}

#[utoipa::path(post, path = "/api/sources", request_body = CreateSourceRequest,
    responses((status = 200, description = "Created source", body = crate::models::Source),
              (status = 400, description = "Invalid URL")))]
pub async fn create_source(
    State(state): State<AppState>,
    Json(request): Json<CreateSourceRequest>,
) -> AppResult<Json<crate::models::Source>> {
    UrlUtils::parse_and_validate(&request.url)
        .map_err(|e| AppError::validation(format!("invalid source url: {e}")))?;
    let source = state
        .store
        .add_source(
            request.url,
            request.enabled.unwrap_or(true),
            request.priority.unwrap_or(0),
        )
        .await?;
    Ok(Json(source))
}

#[utoipa::path(get, path = "/api/sources/{id}", params(("id" = String, Path, description = "Source id")),
    responses((status = 200, description = "Source", body = crate::models::Source),
              (status = 404, description = "Unknown source")))]
pub async fn get_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<crate::models::Source>> {
    Ok(Json(state.store.source(parse_uuid(&id)?)?))
}

#[utoipa::path(post, path = "/api/sources/{id}", request_body = UpdateSourceRequest,
    params(("id" = String, Path, description = "Source id")),
    responses((status = 200, description = "Updated source", body = crate::models::Source)))]
pub async fn update_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateSourceRequest>,
) -> AppResult<Json<crate::models::Source>> {
    if let Some(url) = &request.url {
        UrlUtils::parse_and_validate(url)
            .map_err(|e| AppError::validation(format!("invalid source url: {e}")))?;
    }
    let source = state
        .store
        .update_source(
            parse_uuid(&id)?,
            request.url,
            request.enabled,
            request.priority,
        )
        .await?;
    Ok(Json(source))
}

#[utoipa::path(delete, path = "/api/sources/{id}", params(("id" = String, Path, description = "Source id")),
    responses((status = 200, description = "Deleted"), (status = 404, description = "Unknown source")))]
pub async fn delete_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state.store.delete_source(parse_uuid(&id)?).await?;
    Ok(Json(json!({ "deleted": true })))
}

/// Stream-parse the source feed to refresh its channel list.
#[utoipa::path(post, path = "/api/sources/{id}/rescan", params(("id" = String, Path, description = "Source id")),
    responses((status = 200, description = "Rescan result")))]
pub async fn rescan_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let id = parse_uuid(&id)?;
    let source = state.store.source(id)?;
    let channels = state.pipeline.assembler().scan_channels(&source.url).await?;
    let cache = SourceChannelCache {
        source_id: id,
        scanned_at: chrono::Utc::now(),
        channels,
    };
    state.store.write_source_cache(&cache).await?;
    let source = state
        .store
        .mark_source_scanned(id, cache.channels.len())
        .await?;
    info!(
        "Rescanned source {} ({} channels)",
        id,
        cache.channels.len()
    );
    Ok(Json(json!({
        "sourceId": id,
        "channelCount": cache.channels.len(),
        "lastScannedAt": source.last_scanned_at,
    })))
}

#[utoipa::path(get, path = "/api/sources/{id}/channels", params(("id" = String, Path, description = "Source id")),
    responses((status = 200, description = "Cached channel list"),
              (status = 404, description = "No rescan cached")))]
pub async fn source_channels(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<SourceChannelCache>> {
    let id = parse_uuid(&id)?;
    // 404s also for unknown source ids
    state.store.source(id)?;
    state
        .store
        .read_source_cache(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found("source channel cache", id.to_string()))
}

// ---------------------------------------------------------------------
// Mappings

#[utoipa::path(get, path = "/api/mappings",
    responses((status = 200, description = "All channel mappings")))]
pub async fn get_mappings(
    State(state): State<AppState>,
) -> Json<HashMap<String, ChannelMapping>> {
    Json(state.store.mappings())
}

/// Upsert mappings, single (`{channelId, ...}`) or bulk
/// (`{mappings: {...}}`).
#[utoipa::path(post, path = "/api/mappings",
    responses((status = 200, description = "Mappings stored"),
              (status = 400, description = "Unrecognized body shape")))]
pub async fn upsert_mappings(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> AppResult<Json<serde_json::Value>> {
    if body.get("mappings").is_some() {
        let bulk: BulkMappingUpsert = serde_json::from_value(body)
            .map_err(|e| AppError::validation(format!("invalid bulk mapping body: {e}")))?;
        let count = bulk.mappings.len();
        state.store.upsert_mappings(bulk.mappings).await?;
        return Ok(Json(json!({ "updated": count })));
    }

    if body.get("channelId").is_some() {
        let single: SingleMappingUpsert = serde_json::from_value(body)
            .map_err(|e| AppError::validation(format!("invalid mapping body: {e}")))?;
        state
            .store
            .upsert_mapping(single.channel_id, single.mapping)
            .await?;
        return Ok(Json(json!({ "updated": 1 })));
    }

    Err(AppError::validation(
        "expected either {channelId, ...} or {mappings: {...}}",
    ))
}
