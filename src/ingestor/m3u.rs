//! M3U playlist parser.
//!
//! Parses `#EXTM3U` playlists into channel records and picks up the EPG
//! hint the header may carry (`url-tvg`, `x-tvg-url` or `tvg-url`). Real
//! playlists in the wild are messy: attribute order varies, lines may be
//! CRLF-terminated, and comment lines appear between entries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::PlaylistChannel;

/// Result of parsing one playlist document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPlaylist {
    pub channels: Vec<PlaylistChannel>,
    /// EPG URL advertised by the playlist header, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epg_url: Option<String>,
}

/// Parse an M3U playlist.
///
/// Channel id resolution: `tvg-id`, else `tvg-name`, else the display
/// name after the `#EXTINF` comma. Entries without a stream URL line are
/// skipped.
pub fn parse_m3u(content: &str) -> ParsedPlaylist {
    let mut playlist = ParsedPlaylist::default();
    let mut pending: Option<(HashMap<String, String>, Option<String>)> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix("#EXTM3U") {
            let attrs = parse_attributes(header);
            playlist.epg_url = ["url-tvg", "x-tvg-url", "tvg-url"]
                .iter()
                .find_map(|key| attrs.get(*key).cloned())
                .filter(|url| !url.is_empty());
            continue;
        }

        if let Some(extinf) = line.strip_prefix("#EXTINF:") {
            let attrs = parse_attributes(extinf);
            let name = display_name(extinf);
            pending = Some((attrs, name));
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        // A bare line is the stream URL for the preceding #EXTINF
        if let Some((attrs, name)) = pending.take() {
            let id = attrs
                .get("tvg-id")
                .filter(|v| !v.is_empty())
                .or_else(|| attrs.get("tvg-name").filter(|v| !v.is_empty()))
                .cloned()
                .or_else(|| name.clone());

            let Some(id) = id else {
                debug!("Skipping playlist entry without any usable id: {}", line);
                continue;
            };

            playlist.channels.push(PlaylistChannel {
                id,
                name,
                group: attrs.get("group-title").filter(|v| !v.is_empty()).cloned(),
                logo_url: attrs.get("tvg-logo").filter(|v| !v.is_empty()).cloned(),
                stream_url: line.to_string(),
            });
        }
    }

    playlist
}

/// Scan `key="value"` pairs out of an EXTINF or header line.
fn parse_attributes(text: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while let Some(eq) = text[i..].find("=\"") {
        let eq = i + eq;
        // Walk back over the key characters
        let mut key_start = eq;
        while key_start > 0 {
            let c = bytes[key_start - 1];
            if c.is_ascii_alphanumeric() || c == b'-' || c == b'_' {
                key_start -= 1;
            } else {
                break;
            }
        }
        let key = &text[key_start..eq];
        let value_start = eq + 2;
        let Some(close) = text[value_start..].find('"') else {
            break;
        };
        if !key.is_empty() {
            attrs.insert(
                key.to_ascii_lowercase(),
                text[value_start..value_start + close].to_string(),
            );
        }
        i = value_start + close + 1;
    }
    attrs
}

/// The display name is whatever follows the last comma outside quotes.
fn display_name(extinf: &str) -> Option<String> {
    let mut in_quotes = false;
    let mut last_comma = None;
    for (idx, c) in extinf.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => last_comma = Some(idx),
            _ => {}
        }
    }
    last_comma
        .map(|idx| extinf[idx + 1..].trim().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"#EXTM3U url-tvg="http://example.com/epg.xml.gz"
#EXTINF:-1 tvg-id="BBC1" tvg-name="BBC One" tvg-logo="http://logos/bbc1.png" group-title="UK",BBC One HD
http://streams.example.com/bbc1
#EXTINF:-1 group-title="UK",ITV
http://streams.example.com/itv
"#;

    #[test]
    fn test_parse_header_epg_hint() {
        let playlist = parse_m3u(SAMPLE);
        assert_eq!(
            playlist.epg_url.as_deref(),
            Some("http://example.com/epg.xml.gz")
        );
    }

    #[test]
    fn test_parse_channels() {
        let playlist = parse_m3u(SAMPLE);
        assert_eq!(playlist.channels.len(), 2);

        let bbc = &playlist.channels[0];
        assert_eq!(bbc.id, "BBC1");
        assert_eq!(bbc.name.as_deref(), Some("BBC One HD"));
        assert_eq!(bbc.group.as_deref(), Some("UK"));
        assert_eq!(bbc.logo_url.as_deref(), Some("http://logos/bbc1.png"));
        assert_eq!(bbc.stream_url, "http://streams.example.com/bbc1");

        // Falls back to the display name when tvg-id is absent
        let itv = &playlist.channels[1];
        assert_eq!(itv.id, "ITV");
    }

    #[test]
    fn test_crlf_and_comments_tolerated() {
        let content = "#EXTM3U x-tvg-url=\"http://e/epg\"\r\n#EXTINF:-1 tvg-id=\"A\",Alpha\r\n# a stray comment\r\nhttp://s/a\r\n";
        let playlist = parse_m3u(content);
        assert_eq!(playlist.epg_url.as_deref(), Some("http://e/epg"));
        assert_eq!(playlist.channels.len(), 1);
        assert_eq!(playlist.channels[0].id, "A");
    }

    #[test]
    fn test_name_with_comma_in_attribute() {
        let content = "#EXTM3U\n#EXTINF:-1 tvg-name=\"News, Weather\",The News\nhttp://s/news\n";
        let playlist = parse_m3u(content);
        assert_eq!(playlist.channels[0].id, "News, Weather");
        assert_eq!(playlist.channels[0].name.as_deref(), Some("The News"));
    }

    #[test]
    fn test_extinf_without_url_is_skipped() {
        let content = "#EXTM3U\n#EXTINF:-1 tvg-id=\"A\",Alpha\n#EXTINF:-1 tvg-id=\"B\",Beta\nhttp://s/b\n";
        let playlist = parse_m3u(content);
        assert_eq!(playlist.channels.len(), 1);
        assert_eq!(playlist.channels[0].id, "B");
    }
}
