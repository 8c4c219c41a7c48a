//! Process-wide persisted state: defaults, sources and mappings.
//!
//! The store is loaded once at startup and injected into every component
//! that needs it. Reads return defensive copies so callers always observe
//! a full snapshot; writes are serialized and persisted with a
//! `tmp → rename` before returning, so a crash never leaves a torn
//! `settings.json` behind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::{
    ChannelMapping, PersistedState, Settings, Source, SourceChannelCache,
};

pub struct SettingsStore {
    settings_path: PathBuf,
    source_cache_dir: PathBuf,
    state: RwLock<PersistedState>,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    /// Load persisted state from `<data>/settings.json`, falling back to
    /// defaults when the file does not exist yet.
    pub fn load(data_dir: &std::path::Path) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let source_cache_dir = data_dir.join("source-cache");
        std::fs::create_dir_all(&source_cache_dir)?;

        let settings_path = data_dir.join("settings.json");
        let state = match std::fs::read(&settings_path) {
            Ok(content) => serde_json::from_slice(&content).map_err(|e| {
                AppError::configuration(format!(
                    "cannot parse {}: {e}",
                    settings_path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings.json yet, starting with defaults");
                PersistedState::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            settings_path,
            source_cache_dir,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        })
    }

    /// Full defensive copy of the persisted state.
    pub fn snapshot(&self) -> PersistedState {
        self.state.read().expect("settings store lock poisoned").clone()
    }

    pub fn settings(&self) -> Settings {
        self.snapshot().settings
    }

    pub fn sources(&self) -> Vec<Source> {
        self.snapshot().sources
    }

    pub fn mappings(&self) -> HashMap<String, ChannelMapping> {
        self.snapshot().mappings
    }

    pub fn source(&self, id: Uuid) -> AppResult<Source> {
        self.snapshot()
            .sources
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::not_found("source", id.to_string()))
    }

    pub async fn update_settings(&self, settings: Settings) -> AppResult<Settings> {
        self.mutate(|state| {
            state.settings = settings.clone();
            Ok(())
        })
        .await?;
        Ok(settings)
    }

    pub async fn add_source(&self, url: String, enabled: bool, priority: i32) -> AppResult<Source> {
        let source = Source {
            id: Uuid::new_v4(),
            url,
            enabled,
            priority,
            last_scanned_at: None,
            channel_count: None,
        };
        let created = source.clone();
        self.mutate(move |state| {
            state.sources.push(source);
            state.sources.sort_by_key(|s| s.priority);
            Ok(())
        })
        .await?;
        Ok(created)
    }

    pub async fn update_source(
        &self,
        id: Uuid,
        url: Option<String>,
        enabled: Option<bool>,
        priority: Option<i32>,
    ) -> AppResult<Source> {
        let mut updated = None;
        self.mutate(|state| {
            let source = state
                .sources
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| AppError::not_found("source", id.to_string()))?;
            if let Some(url) = url {
                source.url = url;
            }
            if let Some(enabled) = enabled {
                source.enabled = enabled;
            }
            if let Some(priority) = priority {
                source.priority = priority;
            }
            updated = Some(source.clone());
            state.sources.sort_by_key(|s| s.priority);
            Ok(())
        })
        .await?;
        updated.ok_or_else(|| AppError::not_found("source", id.to_string()))
    }

    pub async fn delete_source(&self, id: Uuid) -> AppResult<()> {
        self.mutate(|state| {
            let before = state.sources.len();
            state.sources.retain(|s| s.id != id);
            if state.sources.len() == before {
                return Err(AppError::not_found("source", id.to_string()));
            }
            Ok(())
        })
        .await?;
        let _ = std::fs::remove_file(self.source_cache_path(id));
        Ok(())
    }

    pub async fn mark_source_scanned(&self, id: Uuid, channel_count: usize) -> AppResult<Source> {
        let mut updated = None;
        self.mutate(|state| {
            let source = state
                .sources
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| AppError::not_found("source", id.to_string()))?;
            source.last_scanned_at = Some(Utc::now());
            source.channel_count = Some(channel_count);
            updated = Some(source.clone());
            Ok(())
        })
        .await?;
        updated.ok_or_else(|| AppError::not_found("source", id.to_string()))
    }

    pub async fn upsert_mapping(
        &self,
        channel_id: String,
        mapping: ChannelMapping,
    ) -> AppResult<()> {
        self.mutate(|state| {
            state.mappings.insert(channel_id, mapping);
            Ok(())
        })
        .await
    }

    pub async fn upsert_mappings(
        &self,
        mappings: HashMap<String, ChannelMapping>,
    ) -> AppResult<()> {
        self.mutate(|state| {
            state.mappings.extend(mappings);
            Ok(())
        })
        .await
    }

    /// Apply a mutation under the write lock and persist before
    /// returning. Readers observe either the prior or the new snapshot.
    async fn mutate(
        &self,
        apply: impl FnOnce(&mut PersistedState) -> AppResult<()>,
    ) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        let persisted = {
            let mut state = self.state.write().expect("settings store lock poisoned");
            apply(&mut state)?;
            state.clone()
        };
        let tmp = self.settings_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&persisted)?).await?;
        tokio::fs::rename(&tmp, &self.settings_path).await?;
        Ok(())
    }

    fn source_cache_path(&self, id: Uuid) -> PathBuf {
        self.source_cache_dir.join(format!("{id}.json"))
    }

    /// Persist a rescan result. Best-effort durability is not enough
    /// here: the channel list endpoint reads it back.
    pub async fn write_source_cache(&self, cache: &SourceChannelCache) -> AppResult<()> {
        let path = self.source_cache_path(cache.source_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(cache)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn read_source_cache(&self, id: Uuid) -> Option<SourceChannelCache> {
        let content = tokio::fs::read(self.source_cache_path(id)).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!("Discarding unreadable source cache for {}: {}", id, e);
                None
            }
        }
    }
}
