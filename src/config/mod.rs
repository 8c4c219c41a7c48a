//! Application configuration.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `EPG_VIEWER_*` environment overrides. CLI flags are applied on top
//! by `main`. The `PORT` environment variable is honored for parity with
//! common container deployments (default 3333).

use std::path::PathBuf;

use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            storage: StorageConfig::default(),
            mirror: MirrorConfig::default(),
            cache: CacheConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3333,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of all persisted state: settings, mirror files, caches.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Snapshots older than this are pruned.
    pub retention_days: u32,
    /// At most this many snapshots are kept per URL, newest first.
    pub keep_max: usize,
    /// Total request timeout for mirror fetches, seconds.
    pub fetch_timeout_secs: u64,
    /// TCP connect timeout, seconds.
    pub connect_timeout_secs: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            retention_days: 21,
            keep_max: 40,
            fetch_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for parsed-schedule and playlist cache entries, seconds.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Rewrite every emitted numeric offset to `+0000` after shifting,
    /// leaving the wall digits untouched. IPTV clients that re-apply
    /// device offsets then render correct local times.
    pub force_zero_offset: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            force_zero_offset: true,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then TOML file, then environment.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("EPG_VIEWER_").split("__"))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.web.port, 3333);
        assert_eq!(config.mirror.retention_days, 21);
        assert_eq!(config.mirror.keep_max, 40);
        assert_eq!(config.cache.ttl_secs, 600);
        assert!(config.export.force_zero_offset);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load_from_file("/nonexistent/config.toml").unwrap();
        assert_eq!(config.web.port, 3333);
    }
}
