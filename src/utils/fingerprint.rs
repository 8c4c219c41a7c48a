//! Content-addressed cache keys.
//!
//! A fingerprint covers every input that can change an output artifact:
//! the mirror signature of each upstream URL, the recent snapshot rotation
//! timestamps (history contributions change when a rotation happens), the
//! playlist channel set, the time-relevant subset of mappings, and the
//! requested window. Keys are stable only if the underlying record is
//! serialized with sorted keys at every level, so the digest walks a
//! canonical rendering rather than whatever order serde_json produces.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::ShiftMode;

/// What kind of artifact a fingerprint addresses. The kind is part of the
/// hashed record, so keys never collide across artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Epg,
    ExportGz,
    ExportXml,
    Channel,
}

/// Conditional-request identity of one mirrored URL.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorSignature {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub size: u64,
    /// Mirror file mtime, seconds since epoch.
    pub mtime: i64,
}

/// Rotation timestamps currently on disk for one URL, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSignature {
    pub url: String,
    pub timestamps: Vec<String>,
}

/// The subset of a channel mapping that affects emitted bytes.
#[derive(Debug, Clone, Serialize)]
pub struct MappingSignature {
    pub channel_id: String,
    pub source_id: Option<Uuid>,
    pub epg_channel_id: Option<String>,
    pub offset_minutes: i32,
    pub zone_id: Option<String>,
    pub shift_mode: ShiftMode,
}

/// Canonicalized record hashed into a stable content-addressed key.
#[derive(Debug, Clone, Serialize)]
pub struct FingerprintKey {
    pub kind: ArtifactKind,
    pub mirrors: Vec<MirrorSignature>,
    pub snapshots: Vec<SnapshotSignature>,
    pub playlist_ids: Vec<String>,
    pub mappings: Vec<MappingSignature>,
    /// `[from, to)` in milliseconds since epoch; `None` means full.
    pub window: Option<(i64, i64)>,
}

impl FingerprintKey {
    /// Hash into the hex key used for cache file names.
    pub fn digest(&self) -> String {
        let mut record = self.clone();
        record.mirrors.sort_by(|a, b| a.url.cmp(&b.url));
        record.snapshots.sort_by(|a, b| a.url.cmp(&b.url));
        record.playlist_ids.sort();
        record
            .mappings
            .sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

        let value = serde_json::to_value(&record).unwrap_or(Value::Null);
        let mut canonical = String::new();
        write_canonical(&value, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{digest:x}")
    }

    /// Same record addressed as a different artifact kind.
    pub fn with_kind(&self, kind: ArtifactKind) -> Self {
        let mut key = self.clone();
        key.kind = kind;
        key
    }
}

/// Serialize a JSON value with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
