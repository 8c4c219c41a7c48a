//! On-disk mirror of upstream EPG feeds.
//!
//! Every configured URL gets a hashed key under the mirror directory:
//! the current file (`<key>.xmltv.gz` or `<key>.xml`), a JSON metadata
//! sidecar (`<key>.json`) and rotated snapshots
//! (`<key>.<YYYYMMDDhhmmss>.xmltv[.gz]`). Fetches revalidate with
//! `If-None-Match`/`If-Modified-Since`; when upstream content changes the
//! prior current file is renamed to a snapshot before the new body is
//! streamed in. Snapshots are the raw material for history backfill.
//!
//! A per-URL mutex is held across revalidate, rotate, write and metadata
//! update. One global mutex would block unrelated sources; no mutex risks
//! rotating a file another writer is emitting into.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::MirrorConfig;
use crate::errors::{AppError, AppResult, SourceError};
use crate::utils::fingerprint::MirrorSignature;
use crate::utils::url::UrlUtils;

/// Metadata sidecar persisted next to each mirror file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    pub is_gz: bool,
    pub saved_at: DateTime<Utc>,
}

/// Handle to the current mirror file for one URL.
#[derive(Debug, Clone)]
pub struct MirrorFile {
    pub path: PathBuf,
    pub is_gz: bool,
    pub signature: MirrorSignature,
}

/// One rotated snapshot of a mirror.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub rotated_at: DateTime<Utc>,
    pub is_gz: bool,
}

impl Snapshot {
    /// The `YYYYMMDDhhmmss` stamp embedded in the file name.
    pub fn stamp(&self) -> String {
        self.rotated_at.format("%Y%m%d%H%M%S").to_string()
    }
}

/// Per-URL on-disk mirror with conditional revalidation and rotated
/// snapshots.
pub struct MirrorStore {
    dir: PathBuf,
    client: reqwest::Client,
    keep_max: usize,
    retention_days: AtomicU32,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MirrorStore {
    pub fn new(dir: PathBuf, config: &MirrorConfig) -> AppResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()?;
        Ok(Self {
            dir,
            client,
            keep_max: config.keep_max,
            retention_days: AtomicU32::new(config.retention_days),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Runtime override for snapshot retention, driven by the settings
    /// store.
    pub fn set_retention_days(&self, days: u32) {
        self.retention_days.store(days, Ordering::Relaxed);
    }

    async fn lock_for(&self, url: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fetch a URL through the mirror, revalidating when possible.
    ///
    /// On upstream failure after one retry the existing mirror file, if
    /// any, is returned so exports keep working from the last good copy.
    pub async fn fetch(&self, url: &str) -> AppResult<MirrorFile> {
        let lock = self.lock_for(url).await;
        let _guard = lock.lock().await;

        let key = UrlUtils::mirror_key(url);
        let meta = self.read_meta(&key).await;
        let current = self.current_file(&key);

        // Revalidate whenever metadata exists, even if the current file
        // was rotated away; the 304 branch handles the missing file.
        match self.try_fetch(url, &key, meta.as_ref(), current.as_deref()).await {
            Ok(file) => Ok(file),
            Err(e) => match self.open_current(url, &key, meta.as_ref()) {
                Some(file) => {
                    warn!(
                        "Fetch failed for {}, serving mirror: {}",
                        UrlUtils::obfuscate_credentials(url),
                        e
                    );
                    Ok(file)
                }
                None => Err(e),
            },
        }
    }

    async fn try_fetch(
        &self,
        url: &str,
        key: &str,
        meta: Option<&MirrorMeta>,
        current: Option<&Path>,
    ) -> AppResult<MirrorFile> {
        let mut request = self.client.get(url);
        if let Some(meta) = meta {
            if let Some(etag) = &meta.etag {
                request = request.header(reqwest::header::IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &meta.last_modified {
                request = request.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = match request.send().await {
            Ok(response) if response.status().is_server_error() => {
                // One unconditional retry after a short delay
                warn!(
                    "Upstream {} returned {}, retrying once",
                    UrlUtils::obfuscate_credentials(url),
                    response.status()
                );
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.client.get(url).send().await?
            }
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Fetch error for {}, retrying once: {}",
                    UrlUtils::obfuscate_credentials(url),
                    UrlUtils::obfuscate_credentials(&e.to_string())
                );
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.client.get(url).send().await?
            }
        };

        if response.status() == StatusCode::NOT_MODIFIED {
            if let Some(path) = current {
                debug!("304 for {}, mirror is fresh", UrlUtils::obfuscate_credentials(url));
                let is_gz = meta.map(|m| m.is_gz).unwrap_or(false);
                return Ok(self.mirror_file(url, path.to_path_buf(), is_gz, meta));
            }
            // The current file was rotated away; refetch unconditionally
            debug!("304 with missing mirror file, refetching {}", key);
            let response = self.client.get(url).send().await?;
            if !response.status().is_success() {
                return Err(SourceError::Http {
                    status: response.status().as_u16(),
                    message: format!(
                        "unexpected status refetching {}",
                        UrlUtils::obfuscate_credentials(url)
                    ),
                }
                .into());
            }
            return self.store_response(url, key, response).await;
        }

        if !response.status().is_success() {
            return Err(SourceError::Http {
                status: response.status().as_u16(),
                message: format!(
                    "unexpected status fetching {}",
                    UrlUtils::obfuscate_credentials(url)
                ),
            }
            .into());
        }

        self.store_response(url, key, response).await
    }

    /// Rotate, stream the body to a temp file, promote it atomically and
    /// persist metadata.
    async fn store_response(
        &self,
        url: &str,
        key: &str,
        response: reqwest::Response,
    ) -> AppResult<MirrorFile> {
        let is_gz = Self::response_is_gzip(url, &response);
        let etag = header_string(&response, reqwest::header::ETAG);
        let last_modified = header_string(&response, reqwest::header::LAST_MODIFIED);

        if let Some((existing, existing_gz)) = self.current_pair(key) {
            self.rotate(key, &existing, existing_gz)?;
        }

        let target = self.dir.join(if is_gz {
            format!("{key}.xmltv.gz")
        } else {
            format!("{key}.xml")
        });
        let tmp = target.with_extension("tmp");

        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
            };
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, &target).await?;

        let meta = MirrorMeta {
            etag,
            last_modified,
            is_gz,
            saved_at: Utc::now(),
        };
        self.write_meta(key, &meta).await?;
        self.prune_snapshots(key);

        info!(
            "Mirrored {} ({} bytes, gzip: {})",
            UrlUtils::obfuscate_credentials(url),
            written,
            is_gz
        );
        Ok(self.mirror_file(url, target, is_gz, Some(&meta)))
    }

    /// Rename the current file to a timestamped snapshot. Collisions
    /// within the same second advance to the next free second.
    fn rotate(&self, key: &str, current: &Path, is_gz: bool) -> AppResult<()> {
        let suffix = if is_gz { "xmltv.gz" } else { "xmltv" };
        let mut stamp = Utc::now();
        for _ in 0..60 {
            let candidate = self
                .dir
                .join(format!("{key}.{}.{suffix}", stamp.format("%Y%m%d%H%M%S")));
            if !candidate.exists() {
                std::fs::rename(current, &candidate)?;
                debug!("Rotated {} to {}", current.display(), candidate.display());
                return Ok(());
            }
            stamp += chrono::Duration::seconds(1);
        }
        Err(AppError::internal(format!(
            "could not allocate snapshot name for mirror key {key}"
        )))
    }

    /// Snapshots for a URL, newest first.
    pub fn list_snapshots(&self, url: &str) -> Vec<Snapshot> {
        self.snapshots_for_key(&UrlUtils::mirror_key(url))
    }

    fn snapshots_for_key(&self, key: &str) -> Vec<Snapshot> {
        let mut snapshots = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return snapshots;
        };
        let prefix = format!("{key}.");
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let (stamp, is_gz) = if let Some(stamp) = rest.strip_suffix(".xmltv.gz") {
                (stamp, true)
            } else if let Some(stamp) = rest.strip_suffix(".xmltv") {
                (stamp, false)
            } else {
                continue;
            };
            if stamp.len() != 14 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Some(rotated_at) = parse_stamp(stamp) else {
                continue;
            };
            snapshots.push(Snapshot {
                path: entry.path(),
                rotated_at,
                is_gz,
            });
        }
        snapshots.sort_by(|a, b| b.rotated_at.cmp(&a.rotated_at));
        snapshots
    }

    /// Delete snapshots older than the retention cutoff or beyond the
    /// keep_max index when sorted newest first.
    fn prune_snapshots(&self, key: &str) {
        let retention_days = self.retention_days.load(Ordering::Relaxed);
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        for (index, snapshot) in self.snapshots_for_key(key).iter().enumerate() {
            if snapshot.rotated_at < cutoff || index >= self.keep_max {
                if let Err(e) = std::fs::remove_file(&snapshot.path) {
                    warn!("Failed to prune snapshot {}: {}", snapshot.path.display(), e);
                } else {
                    debug!("Pruned snapshot {}", snapshot.path.display());
                }
            }
        }
    }

    /// Conditional-request identity of the current mirror state for a
    /// URL; all-zero when nothing is mirrored yet.
    pub async fn signature(&self, url: &str) -> MirrorSignature {
        let key = UrlUtils::mirror_key(url);
        let meta = self.read_meta(&key).await;
        self.build_signature(url, self.current_file(&key).as_deref(), meta.as_ref())
    }

    fn mirror_file(
        &self,
        url: &str,
        path: PathBuf,
        is_gz: bool,
        meta: Option<&MirrorMeta>,
    ) -> MirrorFile {
        let signature = self.build_signature(url, Some(&path), meta);
        MirrorFile {
            path,
            is_gz,
            signature,
        }
    }

    fn build_signature(
        &self,
        url: &str,
        path: Option<&Path>,
        meta: Option<&MirrorMeta>,
    ) -> MirrorSignature {
        let (size, mtime) = path
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| {
                let mtime = m
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                (m.len(), mtime)
            })
            .unwrap_or((0, 0));
        MirrorSignature {
            url: url.to_string(),
            etag: meta.and_then(|m| m.etag.clone()),
            last_modified: meta.and_then(|m| m.last_modified.clone()),
            size,
            mtime,
        }
    }

    fn open_current(&self, url: &str, key: &str, meta: Option<&MirrorMeta>) -> Option<MirrorFile> {
        let (path, is_gz) = self.current_pair(key)?;
        Some(self.mirror_file(url, path, is_gz, meta))
    }

    fn current_file(&self, key: &str) -> Option<PathBuf> {
        self.current_pair(key).map(|(path, _)| path)
    }

    fn current_pair(&self, key: &str) -> Option<(PathBuf, bool)> {
        let gz = self.dir.join(format!("{key}.xmltv.gz"));
        if gz.exists() {
            return Some((gz, true));
        }
        let plain = self.dir.join(format!("{key}.xml"));
        if plain.exists() {
            return Some((plain, false));
        }
        None
    }

    async fn read_meta(&self, key: &str) -> Option<MirrorMeta> {
        let path = self.dir.join(format!("{key}.json"));
        let content = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&content).ok()
    }

    async fn write_meta(&self, key: &str, meta: &MirrorMeta) -> AppResult<()> {
        let path = self.dir.join(format!("{key}.json"));
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(meta)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn response_is_gzip(url: &str, response: &reqwest::Response) -> bool {
        let header_says_gzip = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_ascii_lowercase().contains("gzip"))
                .unwrap_or(false)
        };
        header_says_gzip(reqwest::header::CONTENT_ENCODING)
            || header_says_gzip(reqwest::header::CONTENT_TYPE)
            || url.split('?').next().unwrap_or(url).ends_with(".gz")
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    let naive = chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
