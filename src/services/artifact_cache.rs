//! Two-tier TTL cache keyed by content fingerprints.
//!
//! The memory tier answers repeat requests within a process; the disk
//! tier survives restarts and is promoted into memory on first hit.
//! Disk writes are best-effort: a full disk degrades performance, not
//! correctness, because every entry can be rebuilt from its inputs.
//! Keys never collide across artifact kinds since the kind is hashed
//! into the fingerprint.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tracing::{debug, warn};

const MIN_TTL: Duration = Duration::from_secs(1);

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskEntry<'a> {
    expires_at: DateTime<Utc>,
    #[serde(borrow)]
    data: &'a RawValue,
}

struct MemoryEntry {
    json: String,
    expires_at: Instant,
}

pub struct ArtifactCache {
    dir: PathBuf,
    default_ttl: Duration,
    memory: Mutex<HashMap<String, MemoryEntry>>,
}

impl ArtifactCache {
    pub fn new(dir: PathBuf, default_ttl: Duration) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            default_ttl: default_ttl.max(MIN_TTL),
            memory: Mutex::new(HashMap::new()),
        })
    }

    /// Memory first; on miss, load the disk blob and promote it.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        {
            let mut memory = self.memory.lock().expect("cache lock poisoned");
            if let Some(entry) = memory.get(key) {
                if entry.expires_at > Instant::now() {
                    return serde_json::from_str(&entry.json).ok();
                }
                memory.remove(key);
            }
        }

        let path = self.entry_path(key);
        let content = std::fs::read_to_string(&path).ok()?;
        let entry: DiskEntry = serde_json::from_str(&content).ok()?;
        let now = Utc::now();
        if entry.expires_at <= now {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        let remaining = (entry.expires_at - now)
            .to_std()
            .unwrap_or(MIN_TTL)
            .max(MIN_TTL);
        let json = entry.data.get().to_string();
        let value = serde_json::from_str(&json).ok()?;
        debug!("Promoted cache entry {} from disk", key);
        self.memory
            .lock()
            .expect("cache lock poisoned")
            .insert(
                key.to_string(),
                MemoryEntry {
                    json,
                    expires_at: Instant::now() + remaining,
                },
            );
        Some(value)
    }

    /// Store in both tiers. `ttl` of `None` uses the cache default; any
    /// value is floored at one second.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl).max(MIN_TTL);
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!("Cannot serialize cache entry {}: {}", key, e);
                return;
            }
        };

        self.memory
            .lock()
            .expect("cache lock poisoned")
            .insert(
                key.to_string(),
                MemoryEntry {
                    json: json.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );

        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(1));
        let blob = format!(
            "{{\"expiresAt\":{},\"data\":{}}}",
            serde_json::to_string(&expires_at).unwrap_or_else(|_| "null".into()),
            json
        );
        let path = self.entry_path(key);
        let tmp = path.with_extension("json.tmp");
        let written = std::fs::write(&tmp, blob).and_then(|_| std::fs::rename(&tmp, &path));
        if let Err(e) = written {
            warn!("Cache disk write failed for {}: {}", key, e);
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}
