//! Service layer: orchestration and process-wide state.

pub mod artifact_cache;
pub mod assembler;
pub mod export_pipeline;
pub mod export_renderer;
pub mod merge_planner;
pub mod playlist;
pub mod prewarm;
pub mod settings_store;

pub use artifact_cache::ArtifactCache;
pub use assembler::EpgAssembler;
pub use export_pipeline::ExportPipeline;
pub use export_renderer::ExportRenderer;
pub use playlist::PlaylistService;
pub use prewarm::PrewarmScheduler;
pub use settings_store::SettingsStore;
