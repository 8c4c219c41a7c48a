//! XMLTV export rendering.
//!
//! Writes the export document from an assembled schedule set, running
//! every timestamp through the time-shift engine. Channel headers prefer
//! playlist name/logo, then EPG metadata, then the bare id. Output is
//! UTF-8; gzip variants use a single deflate stream at level 6. The
//! rendered bytes are written to the export cache file and served to the
//! client from the same buffer, so replays with an identical fingerprint
//! are byte-identical.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::models::{AssembledEpg, ChannelMapping, Programme};
use crate::timeshift::{ShiftSpec, TimeShiftEngine};
use crate::utils::xmltv_time;

const GENERATOR_NAME: &str = "epg-viewer export";

pub struct ExportRenderer {
    engine: TimeShiftEngine,
}

impl ExportRenderer {
    pub fn new(engine: TimeShiftEngine) -> Self {
        Self { engine }
    }

    /// Render the document, optionally gzip-compressed.
    pub fn render(
        &self,
        epg: &AssembledEpg,
        mappings: &HashMap<String, ChannelMapping>,
        gzip: bool,
    ) -> AppResult<Vec<u8>> {
        let xml = self.render_xml(epg, mappings);
        if !gzip {
            return Ok(xml.into_bytes());
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(6));
        encoder
            .write_all(xml.as_bytes())
            .and_then(|_| encoder.finish())
            .map_err(|e| AppError::internal(format!("gzip encoding failed: {e}")))
    }

    /// Render and promote to a cache file atomically, returning the same
    /// bytes for the client stream.
    pub async fn render_to_file(
        &self,
        epg: &AssembledEpg,
        mappings: &HashMap<String, ChannelMapping>,
        gzip: bool,
        path: &Path,
    ) -> AppResult<Vec<u8>> {
        let bytes = self.render(epg, mappings, gzip)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Wrote export artifact {} ({} bytes)", path.display(), bytes.len());
        Ok(bytes)
    }

    fn render_xml(&self, epg: &AssembledEpg, mappings: &HashMap<String, ChannelMapping>) -> String {
        let mut out = String::with_capacity(4096);
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<!DOCTYPE tv SYSTEM \"xmltv.dtd\">\n");
        out.push_str(&format!(
            "<tv generator-info-name=\"{}\">\n",
            escape_attr(GENERATOR_NAME)
        ));

        for id in &epg.channel_order {
            let info = epg.channels.get(id);
            let display_name = info
                .and_then(|i| i.display_name.as_deref())
                .unwrap_or(id.as_str());
            out.push_str(&format!("  <channel id=\"{}\">\n", escape_attr(id)));
            out.push_str(&format!(
                "    <display-name>{}</display-name>\n",
                escape_text(display_name)
            ));
            if let Some(icon) = info.and_then(|i| i.icon_url.as_deref()) {
                out.push_str(&format!("    <icon src=\"{}\"/>\n", escape_attr(icon)));
            }
            out.push_str("  </channel>\n");
        }

        for id in &epg.channel_order {
            let Some(programmes) = epg.schedules.get(id) else {
                continue;
            };
            let mapping = mappings.get(id);
            for programme in programmes {
                self.render_programme(&mut out, id, programme, mapping);
            }
        }

        out.push_str("</tv>\n");
        out
    }

    fn render_programme(
        &self,
        out: &mut String,
        channel_id: &str,
        programme: &Programme,
        mapping: Option<&ChannelMapping>,
    ) {
        let start = self.render_timestamp(
            programme.start_utc,
            Some(&programme.start_raw),
            mapping,
        );
        out.push_str(&format!("  <programme start=\"{}\"", escape_attr(&start)));
        if let Some(stop_utc) = programme.stop_utc {
            let stop = self.render_timestamp(stop_utc, programme.stop_raw.as_deref(), mapping);
            out.push_str(&format!(" stop=\"{}\"", escape_attr(&stop)));
        }
        out.push_str(&format!(" channel=\"{}\">\n", escape_attr(channel_id)));

        if let Some(title) = &programme.title {
            out.push_str(&format!("    <title>{}</title>\n", escape_text(title)));
        }
        if let Some(description) = &programme.description {
            out.push_str(&format!("    <desc>{}</desc>\n", escape_text(description)));
        }
        if let Some(category) = &programme.category {
            out.push_str(&format!(
                "    <category>{}</category>\n",
                escape_text(category)
            ));
        }
        if let Some(icon) = &programme.icon_url {
            out.push_str(&format!("    <icon src=\"{}\"/>\n", escape_attr(icon)));
        }
        out.push_str("  </programme>\n");
    }

    /// Derive the output timestamp for one instant.
    ///
    /// The assembler pre-applied the mapping's minute offset to the
    /// cached UTC instants, so the engine is handed the original instant
    /// back and re-applies the shift itself; the raw string then lines
    /// up for the zero-shift pass-through.
    fn render_timestamp(
        &self,
        utc: chrono::DateTime<chrono::Utc>,
        original: Option<&str>,
        mapping: Option<&ChannelMapping>,
    ) -> String {
        let offset_minutes = mapping.map(|m| m.offset_minutes()).unwrap_or(0);
        let unshifted = utc - chrono::Duration::minutes(i64::from(offset_minutes));
        let spec = ShiftSpec {
            utc: Some(unshifted),
            original,
            zone: TimeShiftEngine::resolve_zone(mapping.and_then(|m| m.zone_id.as_deref())),
            offset_minutes,
            mode: mapping.map(|m| m.shift_mode).unwrap_or_default(),
        };
        self.engine
            .render(&spec)
            .unwrap_or_else(|| xmltv_time::format_wall(utc.naive_utc(), 0))
    }
}

/// Escape `&`, `<`, `>` in element text.
fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Attributes additionally escape the quote character.
fn escape_attr(text: &str) -> String {
    escape_text(text).replace('"', "&quot;")
}
