//! Web layer: state wiring, router assembly and the serve loop.
//!
//! Handlers are thin and delegate to the service layer; all services are
//! constructed once and injected through `AppState` rather than reached
//! through globals.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::errors::AppResult;
use crate::mirror::MirrorStore;
use crate::services::{
    ArtifactCache, EpgAssembler, ExportPipeline, ExportRenderer, PlaylistService,
    PrewarmScheduler, SettingsStore,
};
use crate::timeshift::TimeShiftEngine;

pub mod api;
pub mod openapi;
pub mod responses;

/// Shared handler state. Everything is `Arc`-wrapped so the router clones
/// are cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SettingsStore>,
    pub mirror: Arc<MirrorStore>,
    pub pipeline: Arc<ExportPipeline>,
    pub prewarm: Arc<PrewarmScheduler>,
}

impl AppState {
    /// Wire every service from configuration. Used by `main` and by the
    /// integration tests.
    pub fn from_config(config: Config) -> AppResult<Self> {
        let data_dir = config.storage.data_dir.clone();

        let store = Arc::new(SettingsStore::load(&data_dir)?);
        let mirror = Arc::new(MirrorStore::new(data_dir.join("mirror"), &config.mirror)?);
        mirror.set_retention_days(store.settings().history_retention_days);

        let schedule_cache = Arc::new(ArtifactCache::new(
            data_dir.join("cache").join("schedules"),
            Duration::from_secs(config.cache.ttl_secs),
        )?);

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.mirror.connect_timeout_secs))
            .timeout(Duration::from_secs(config.mirror.fetch_timeout_secs))
            .build()?;
        let playlists = Arc::new(PlaylistService::new(client, Arc::clone(&schedule_cache)));

        let assembler = Arc::new(EpgAssembler::new(
            Arc::clone(&mirror),
            Arc::clone(&schedule_cache),
        ));
        let renderer = Arc::new(ExportRenderer::new(TimeShiftEngine::new(
            config.export.force_zero_offset,
        )));
        let pipeline = Arc::new(ExportPipeline::new(
            Arc::clone(&store),
            playlists,
            assembler,
            renderer,
            data_dir.join("cache").join("exports"),
        ));
        let prewarm = Arc::new(PrewarmScheduler::new(Arc::clone(&pipeline)));

        Ok(Self {
            config: Arc::new(config),
            store,
            mirror,
            pipeline,
            prewarm,
        })
    }
}

/// Assemble the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/openapi.json", get(openapi::serve))
        .route("/api/channels", get(api::get_channels))
        .route("/api/epg", get(api::get_epg))
        .route("/api/epg/channel", get(api::get_epg_channel))
        .route("/epg.xml.gz", get(api::export_gzip))
        .route("/api/export/epg.xml.gz", get(api::export_gzip))
        .route("/epg.xml", get(api::export_plain))
        .route("/api/export/epg.xml", get(api::export_plain))
        .route("/api/export/prewarm", post(api::prewarm_export))
        .route("/api/export/status", get(api::export_status))
        .route(
            "/api/settings",
            get(api::get_settings).post(api::update_settings),
        )
        .route(
            "/api/sources",
            get(api::list_sources).post(api::create_source),
        )
        .route(
            "/api/sources/{id}",
            get(api::get_source)
                .post(api::update_source)
                .delete(api::delete_source),
        )
        .route("/api/sources/{id}/rescan", post(api::rescan_source))
        .route("/api/sources/{id}/channels", get(api::source_channels))
        .route(
            "/api/mappings",
            get(api::get_mappings).post(api::upsert_mappings),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> AppResult<Self> {
        let addr: SocketAddr = format!(
            "{}:{}",
            state.config.web.host, state.config.web.port
        )
        .parse()
        .map_err(|e| {
            crate::errors::AppError::configuration(format!("invalid listen address: {e}"))
        })?;
        Ok(Self {
            app: router(state),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn serve(self) -> AppResult<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("Listening on {}", self.addr);
        axum::serve(listener, self.app).await?;
        Ok(())
    }
}
