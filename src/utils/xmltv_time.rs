//! XMLTV timestamp grammar: parsing and rendering.
//!
//! The grammar is `YYYYMMDDhhmmss` optionally followed by whitespace and
//! `+HHMM`/`-HHMM` or `Z`. A missing offset is treated as UTC when parsing.
//! The original text is always preserved by callers for pass-through, so
//! these helpers never need to reconstruct an input string.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

/// A parsed XMLTV instant together with the explicit numeric offset it
/// carried, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmltvTimestamp {
    pub utc: DateTime<Utc>,
    /// Present only when the input spelled out `+HHMM`/`-HHMM` or `Z`.
    pub offset: Option<FixedOffset>,
}

/// Parse an XMLTV timestamp. Returns `None` on any grammar violation.
pub fn parse_timestamp(raw: &str) -> Option<XmltvTimestamp> {
    let raw = raw.trim();
    if raw.len() < 14 || !raw.as_bytes()[..14].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let (digits, rest) = raw.split_at(14);
    let naive = NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S").ok()?;

    let rest = rest.trim_start();
    if rest.is_empty() {
        return Some(XmltvTimestamp {
            utc: Utc.from_utc_datetime(&naive),
            offset: None,
        });
    }

    let offset = parse_offset(rest)?;
    let utc = offset.from_local_datetime(&naive).single()?.with_timezone(&Utc);
    Some(XmltvTimestamp {
        utc,
        offset: Some(offset),
    })
}

/// Parse the `+HHMM`/`-HHMM`/`Z` suffix of a timestamp.
pub fn parse_offset(text: &str) -> Option<FixedOffset> {
    let text = text.trim();
    if text == "Z" || text == "z" {
        return FixedOffset::east_opt(0);
    }
    if text.len() != 5 {
        return None;
    }
    let sign = match text.as_bytes()[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    if !text.as_bytes()[1..].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let hours: i32 = text[1..3].parse().ok()?;
    let minutes: i32 = text[3..5].parse().ok()?;
    if minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Minutes east of UTC spelled by the trailing offset, if present.
pub fn offset_minutes_of(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    if raw.len() < 14 {
        return None;
    }
    let rest = raw[14..].trim_start();
    if rest.is_empty() {
        return None;
    }
    parse_offset(rest).map(|o| o.local_minus_utc() / 60)
}

/// The 14 wall-clock digits of a timestamp, if it has them.
pub fn wall_digits(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    if raw.len() >= 14 && raw.as_bytes()[..14].iter().all(u8::is_ascii_digit) {
        Some(&raw[..14])
    } else {
        None
    }
}

/// Render wall digits plus a numeric offset in minutes.
pub fn format_wall(wall: NaiveDateTime, offset_minutes: i32) -> String {
    format!(
        "{} {}",
        wall.format("%Y%m%d%H%M%S"),
        format_offset(offset_minutes)
    )
}

/// Render a minute offset as `+HHMM`/`-HHMM`.
pub fn format_offset(minutes: i32) -> String {
    let sign = if minutes < 0 { '-' } else { '+' };
    let abs = minutes.abs();
    format!("{}{:02}{:02}", sign, abs / 60, abs % 60)
}

/// Rewrite a timestamp so its numeric offset reads `+0000` while leaving
/// the wall digits untouched. Unparseable input is returned as-is.
pub fn force_zero_offset(raw: &str) -> String {
    match wall_digits(raw) {
        Some(digits) => format!("{digits} +0000"),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_with_offset() {
        let ts = parse_timestamp("20240610120000 +0100").unwrap();
        assert_eq!(ts.utc.hour(), 11);
        assert_eq!(ts.offset.unwrap().local_minus_utc(), 3600);
    }

    #[test]
    fn test_parse_zulu_and_bare() {
        let zulu = parse_timestamp("20240610120000 Z").unwrap();
        assert_eq!(zulu.utc.hour(), 12);
        assert_eq!(zulu.offset.unwrap().local_minus_utc(), 0);

        let bare = parse_timestamp("20240610120000").unwrap();
        assert_eq!(bare.utc.hour(), 12);
        assert!(bare.offset.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_timestamp("not a timestamp").is_none());
        assert!(parse_timestamp("2024061012").is_none());
        assert!(parse_timestamp("20240610120000 +25xx").is_none());
        assert!(parse_timestamp("20241310120000 +0100").is_none());
    }

    #[test]
    fn test_offset_minutes_of() {
        assert_eq!(offset_minutes_of("20240610120000 +0130"), Some(90));
        assert_eq!(offset_minutes_of("20240610120000 -0500"), Some(-300));
        assert_eq!(offset_minutes_of("20240610120000"), None);
    }

    #[test]
    fn test_format_offset() {
        assert_eq!(format_offset(0), "+0000");
        assert_eq!(format_offset(90), "+0130");
        assert_eq!(format_offset(-330), "-0530");
    }

    #[test]
    fn test_force_zero_offset_keeps_digits() {
        assert_eq!(
            force_zero_offset("20240610120000 +0230"),
            "20240610120000 +0000"
        );
        assert_eq!(force_zero_offset("20240610120000"), "20240610120000 +0000");
        assert_eq!(force_zero_offset("garbage"), "garbage");
    }
}
