//! Streaming XMLTV parser.
//!
//! SAX-style parse over quick-xml: channels are emitted as `</channel>`
//! closes and programmes as `</programme>` closes, so a multi-gigabyte
//! guide never has to fit in memory. Programmes are filtered inline
//! against an allowed-id set and a half-open `[from, to)` time window,
//! and the parse can terminate early after a fixed number of programme
//! elements (`limit_programmes = 0` yields a channels-only pass).
//!
//! Element and attribute names are matched case-insensitively. Channel
//! ids are compared using Unicode trim + lowercase.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;

use crate::errors::{AppResult, SourceError};
use crate::models::{EpgChannel, Programme};
use crate::utils::decompression::DecompressionService;
use crate::utils::xmltv_time;

/// Filtering options for one parse pass.
#[derive(Debug, Clone, Default)]
pub struct XmltvParseOptions {
    /// Normalized EPG-side ids to accept. `None` or empty accepts all.
    pub allowed_ids: Option<HashSet<String>>,
    /// `[from, to)` in milliseconds since epoch. `None` means no filter.
    pub window: Option<(i64, i64)>,
    /// Stop parsing after observing this many programme elements
    /// (counted before filtering). `Some(0)` collects channels only.
    pub limit_programmes: Option<usize>,
}

impl XmltvParseOptions {
    /// A channels-only pass, used by source rescans.
    pub fn channels_only() -> Self {
        Self {
            limit_programmes: Some(0),
            ..Self::default()
        }
    }
}

/// Everything one parse pass produced.
#[derive(Debug, Clone, Default)]
pub struct ParsedGuide {
    pub channels: Vec<EpgChannel>,
    pub programmes: Vec<Programme>,
    /// Programmes whose `start` attribute failed the timestamp grammar.
    pub dropped_unparseable: usize,
}

/// Normalize a channel id for comparison: Unicode trim + lowercase.
pub fn normalize_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug, Default)]
struct ChannelDraft {
    id: String,
    display_name: Option<String>,
    icon_url: Option<String>,
}

#[derive(Debug, Default)]
struct ProgrammeDraft {
    channel: String,
    start: String,
    stop: Option<String>,
    title: Option<String>,
    description: Option<String>,
    category: Option<String>,
    icon_url: Option<String>,
}

/// Parse an XMLTV document from a mirror file, transparently decoding
/// gzip.
pub fn parse_path(path: &Path, options: &XmltvParseOptions) -> AppResult<ParsedGuide> {
    let reader = DecompressionService::open_maybe_gzip(path)
        .map_err(|e| SourceError::parse("xmltv", format!("cannot open {}: {e}", path.display())))?;
    parse_reader(reader, options)
}

/// Parse an XMLTV document from any buffered reader.
pub fn parse_reader<R: BufRead>(input: R, options: &XmltvParseOptions) -> AppResult<ParsedGuide> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);

    let allowed = options
        .allowed_ids
        .as_ref()
        .filter(|ids| !ids.is_empty());

    let mut guide = ParsedGuide::default();
    let mut current_channel: Option<ChannelDraft> = None;
    let mut current_programme: Option<ProgrammeDraft> = None;
    let mut current_text = String::new();
    let mut programmes_seen = 0usize;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.name().as_ref().to_ascii_lowercase();
                match name.as_slice() {
                    b"channel" => {
                        let attrs = parse_attributes(e);
                        current_channel = Some(ChannelDraft {
                            id: attrs
                                .iter()
                                .find(|(k, _)| k == "id")
                                .map(|(_, v)| v.clone())
                                .unwrap_or_default(),
                            ..ChannelDraft::default()
                        });
                    }
                    b"programme" => {
                        if let Some(limit) = options.limit_programmes {
                            if programmes_seen >= limit {
                                break;
                            }
                        }
                        programmes_seen += 1;
                        let attrs = parse_attributes(e);
                        let get = |key: &str| {
                            attrs
                                .iter()
                                .find(|(k, _)| k == key)
                                .map(|(_, v)| v.clone())
                        };
                        current_programme = Some(ProgrammeDraft {
                            channel: get("channel").unwrap_or_default(),
                            start: get("start").unwrap_or_default(),
                            stop: get("stop"),
                            ..ProgrammeDraft::default()
                        });
                    }
                    b"icon" => {
                        apply_icon(e, &mut current_channel, &mut current_programme);
                    }
                    _ => {}
                }
                current_text.clear();
            }

            Ok(Event::Empty(ref e)) => {
                let name = e.name().as_ref().to_ascii_lowercase();
                match name.as_slice() {
                    b"icon" => {
                        apply_icon(e, &mut current_channel, &mut current_programme);
                    }
                    b"channel" => {
                        // A childless channel still names an id
                        let attrs = parse_attributes(e);
                        if let Some((_, id)) = attrs.iter().find(|(k, _)| k == "id") {
                            finish_channel(
                                ChannelDraft {
                                    id: id.clone(),
                                    ..ChannelDraft::default()
                                },
                                allowed,
                                &mut guide,
                            );
                        }
                    }
                    _ => {}
                }
            }

            Ok(Event::End(ref e)) => {
                let name = e.name().as_ref().to_ascii_lowercase();
                match name.as_slice() {
                    b"display-name" => {
                        if let Some(channel) = current_channel.as_mut() {
                            if channel.display_name.is_none() && !current_text.trim().is_empty() {
                                channel.display_name = Some(current_text.trim().to_string());
                            }
                        }
                    }
                    b"title" => {
                        if let Some(programme) = current_programme.as_mut() {
                            if programme.title.is_none() && !current_text.trim().is_empty() {
                                programme.title = Some(current_text.trim().to_string());
                            }
                        }
                    }
                    b"desc" => {
                        if let Some(programme) = current_programme.as_mut() {
                            if programme.description.is_none() && !current_text.trim().is_empty() {
                                programme.description = Some(current_text.trim().to_string());
                            }
                        }
                    }
                    b"category" => {
                        if let Some(programme) = current_programme.as_mut() {
                            if programme.category.is_none() && !current_text.trim().is_empty() {
                                programme.category = Some(current_text.trim().to_string());
                            }
                        }
                    }
                    b"channel" => {
                        if let Some(draft) = current_channel.take() {
                            finish_channel(draft, allowed, &mut guide);
                        }
                    }
                    b"programme" => {
                        if let Some(draft) = current_programme.take() {
                            finish_programme(draft, allowed, options.window, &mut guide);
                        }
                    }
                    _ => {}
                }
                current_text.clear();
            }

            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|e| {
                    SourceError::parse("xmltv", format!("invalid text content: {e}"))
                })?;
                current_text.push_str(&text);
            }

            Ok(Event::CData(e)) => {
                let text = std::str::from_utf8(&e).map_err(|e| {
                    SourceError::parse("xmltv", format!("invalid UTF-8 in CDATA: {e}"))
                })?;
                current_text.push_str(text);
            }

            Ok(Event::Eof) => break,

            Err(e) => {
                return Err(SourceError::parse("xmltv", format!("XML parsing error: {e}")).into());
            }

            _ => {}
        }
        buf.clear();
    }

    if guide.dropped_unparseable > 0 {
        debug!(
            "Dropped {} programmes with unparseable start timestamps",
            guide.dropped_unparseable
        );
    }

    Ok(guide)
}

/// Parse XML attributes, lowercasing keys for case-insensitive lookup.
fn parse_attributes(element: &BytesStart) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    for attr in element.attributes().flatten() {
        if let Ok(key) = std::str::from_utf8(attr.key.as_ref()) {
            if let Ok(value) = attr.unescape_value() {
                attrs.push((key.to_ascii_lowercase(), value.into_owned()));
            }
        }
    }
    attrs
}

fn apply_icon(
    element: &BytesStart,
    current_channel: &mut Option<ChannelDraft>,
    current_programme: &mut Option<ProgrammeDraft>,
) {
    let attrs = parse_attributes(element);
    let Some((_, src)) = attrs.iter().find(|(k, _)| k == "src") else {
        return;
    };
    if let Some(programme) = current_programme.as_mut() {
        if programme.icon_url.is_none() {
            programme.icon_url = Some(src.clone());
        }
    } else if let Some(channel) = current_channel.as_mut() {
        if channel.icon_url.is_none() {
            channel.icon_url = Some(src.clone());
        }
    }
}

fn finish_channel(draft: ChannelDraft, allowed: Option<&HashSet<String>>, guide: &mut ParsedGuide) {
    if draft.id.trim().is_empty() {
        return;
    }
    if let Some(allowed) = allowed {
        if !allowed.contains(&normalize_id(&draft.id)) {
            return;
        }
    }
    guide.channels.push(EpgChannel {
        id: draft.id.trim().to_string(),
        display_name: draft.display_name,
        icon_url: draft.icon_url,
    });
}

fn finish_programme(
    draft: ProgrammeDraft,
    allowed: Option<&HashSet<String>>,
    window: Option<(i64, i64)>,
    guide: &mut ParsedGuide,
) {
    let normalized = normalize_id(&draft.channel);
    if let Some(allowed) = allowed {
        if !allowed.contains(&normalized) {
            return;
        }
    }

    let Some(start) = xmltv_time::parse_timestamp(&draft.start) else {
        guide.dropped_unparseable += 1;
        return;
    };
    // Keep the stop only when it parses and respects stop >= start, so
    // the raw string and the UTC instant never disagree.
    let stop = draft.stop.and_then(|raw| {
        xmltv_time::parse_timestamp(&raw)
            .filter(|stop| stop.utc >= start.utc)
            .map(|stop| (raw, stop))
    });

    if let Some((from, to)) = window {
        let start_ms = start.utc.timestamp_millis();
        let overlaps = start_ms < to
            && match &stop {
                Some((_, stop)) => stop.utc.timestamp_millis() > from,
                None => true,
            };
        if !overlaps {
            return;
        }
    }

    let (stop_raw, stop_utc) = match stop {
        Some((raw, parsed)) => (Some(raw), Some(parsed.utc)),
        None => (None, None),
    };

    guide.programmes.push(Programme {
        channel_id: normalized,
        start_utc: start.utc,
        stop_utc,
        start_raw: draft.start,
        stop_raw,
        title: draft.title,
        description: draft.description,
        category: draft.category,
        icon_url: draft.icon_url,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE tv SYSTEM "xmltv.dtd">
<tv generator-info-name="test">
  <channel id="bbc1">
    <display-name>BBC 1</display-name>
    <icon src="http://logos/bbc1.png"/>
  </channel>
  <channel id="itv"><display-name>ITV</display-name></channel>
  <programme channel="bbc1" start="20240610120000 +0100" stop="20240610130000 +0100">
    <title>News</title>
    <desc>Midday news.</desc>
    <category>News</category>
  </programme>
  <programme channel="itv" start="20240610180000 +0100">
    <title>Evening Show</title>
  </programme>
  <programme channel="bbc1" start="garbage">
    <title>Broken</title>
  </programme>
</tv>
"#;

    fn parse(options: &XmltvParseOptions) -> ParsedGuide {
        parse_reader(GUIDE.as_bytes(), options).unwrap()
    }

    #[test]
    fn test_parse_channels_and_programmes() {
        let guide = parse(&XmltvParseOptions::default());
        assert_eq!(guide.channels.len(), 2);
        assert_eq!(guide.channels[0].id, "bbc1");
        assert_eq!(guide.channels[0].display_name.as_deref(), Some("BBC 1"));
        assert_eq!(
            guide.channels[0].icon_url.as_deref(),
            Some("http://logos/bbc1.png")
        );
        assert_eq!(guide.programmes.len(), 2);
        assert_eq!(guide.dropped_unparseable, 1);

        let news = &guide.programmes[0];
        assert_eq!(news.channel_id, "bbc1");
        assert_eq!(news.start_raw, "20240610120000 +0100");
        assert_eq!(news.title.as_deref(), Some("News"));
        assert_eq!(
            news.start_utc,
            Utc.with_ymd_and_hms(2024, 6, 10, 11, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_allowed_ids_filter_is_case_insensitive() {
        let options = XmltvParseOptions {
            allowed_ids: Some([normalize_id(" BBC1 ")].into_iter().collect()),
            ..Default::default()
        };
        let guide = parse(&options);
        assert_eq!(guide.channels.len(), 1);
        assert_eq!(guide.programmes.len(), 1);
        assert_eq!(guide.programmes[0].channel_id, "bbc1");
    }

    #[test]
    fn test_window_filter_half_open() {
        // Window covering exactly the News programme: [11:00, 12:00) UTC
        let from = Utc
            .with_ymd_and_hms(2024, 6, 10, 11, 0, 0)
            .unwrap()
            .timestamp_millis();
        let to = Utc
            .with_ymd_and_hms(2024, 6, 10, 12, 0, 0)
            .unwrap()
            .timestamp_millis();
        let options = XmltvParseOptions {
            window: Some((from, to)),
            ..Default::default()
        };
        let guide = parse(&options);
        assert_eq!(guide.programmes.len(), 1);
        assert_eq!(guide.programmes[0].title.as_deref(), Some("News"));

        // A window that starts at the programme's stop must exclude it
        let stop_ms = Utc
            .with_ymd_and_hms(2024, 6, 10, 12, 0, 0)
            .unwrap()
            .timestamp_millis();
        let options = XmltvParseOptions {
            window: Some((stop_ms, stop_ms + 3_600_000)),
            ..Default::default()
        };
        let guide = parse(&options);
        assert!(guide.programmes.iter().all(|p| p.title.as_deref() != Some("News")));
    }

    #[test]
    fn test_limit_zero_yields_channels_only() {
        let guide = parse(&XmltvParseOptions::channels_only());
        assert_eq!(guide.channels.len(), 2);
        assert!(guide.programmes.is_empty());
    }

    #[test]
    fn test_case_insensitive_elements() {
        let upper = r#"<TV><CHANNEL ID="a"><DISPLAY-NAME>A</DISPLAY-NAME></CHANNEL>
<PROGRAMME CHANNEL="a" START="20240610120000"><TITLE>T</TITLE></PROGRAMME></TV>"#;
        let guide = parse_reader(upper.as_bytes(), &XmltvParseOptions::default()).unwrap();
        assert_eq!(guide.channels.len(), 1);
        assert_eq!(guide.programmes.len(), 1);
        assert_eq!(guide.programmes[0].title.as_deref(), Some("T"));
    }

    #[test]
    fn test_malformed_xml_is_fatal() {
        let broken = "<tv><channel id=\"a\"><display-name>A</display";
        assert!(parse_reader(broken.as_bytes(), &XmltvParseOptions::default()).is_err());
    }

    #[test]
    fn test_entity_unescaping() {
        let doc = r#"<tv><programme channel="a" start="20240610120000">
<title>Tom &amp; Jerry</title></programme></tv>"#;
        let guide = parse_reader(doc.as_bytes(), &XmltvParseOptions::default()).unwrap();
        assert_eq!(guide.programmes[0].title.as_deref(), Some("Tom & Jerry"));
    }
}
