//! OpenAPI document for the HTTP surface.

use axum::Json;
use utoipa::OpenApi;

use super::api;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "epg-viewer",
        description = "XMLTV EPG ingest, merge and export service"
    ),
    paths(
        api::health,
        api::get_channels,
        api::get_epg,
        api::get_epg_channel,
        api::export_gzip,
        api::export_plain,
        api::prewarm_export,
        api::export_status,
        api::get_settings,
        api::update_settings,
        api::list_sources,
        api::create_source,
        api::get_source,
        api::update_source,
        api::delete_source,
        api::rescan_source,
        api::source_channels,
        api::get_mappings,
        api::upsert_mappings,
    )
)]
pub struct ApiDoc;

pub async fn serve() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
