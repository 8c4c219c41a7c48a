//! Programme timestamp shifting.
//!
//! Two modes exist. `wall` shifts the absolute instant and renders the
//! wall clock in a named IANA zone, so DST is honored at the shifted
//! instant. `offset` leaves the wall digits untouched and adjusts only
//! the numeric `+HHMM` field, clamped to the XMLTV-legal ±14:00 range.
//!
//! After shifting, the globally configured zero-offset rewrite can
//! replace the emitted numeric offset with a literal `+0000` without
//! touching the wall digits. IPTV clients that naively re-apply device
//! offsets then render correct local times because the engine has
//! already done the math.

use chrono::{DateTime, Duration, Offset, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::models::ShiftMode;
use crate::utils::xmltv_time;

/// Largest representable XMLTV offset: ±14 hours in minutes.
const MAX_OFFSET_MINUTES: i32 = 840;

/// One timestamp to shift, with whatever source material is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShiftSpec<'a> {
    /// Parsed UTC instant, when the caller has one.
    pub utc: Option<DateTime<Utc>>,
    /// Original XMLTV timestamp text, preserved verbatim from parse.
    pub original: Option<&'a str>,
    /// IANA zone for wall-clock shifting.
    pub zone: Option<Tz>,
    pub offset_minutes: i32,
    pub mode: ShiftMode,
}

/// Converts programme instants into output XMLTV timestamps.
#[derive(Debug, Clone, Copy)]
pub struct TimeShiftEngine {
    force_zero_offset: bool,
}

impl TimeShiftEngine {
    pub fn new(force_zero_offset: bool) -> Self {
        Self { force_zero_offset }
    }

    /// Resolve a mapping's zone id, logging and ignoring unknown names.
    pub fn resolve_zone(zone_id: Option<&str>) -> Option<Tz> {
        let zone_id = zone_id?;
        match zone_id.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!("Ignoring unknown time zone id '{}'", zone_id);
                None
            }
        }
    }

    /// Render one timestamp. Returns `None` when neither a UTC instant
    /// nor an original string is available.
    pub fn render(&self, spec: &ShiftSpec) -> Option<String> {
        let rendered = self.render_unnormalized(spec)?;
        if self.force_zero_offset {
            Some(xmltv_time::force_zero_offset(&rendered))
        } else {
            Some(rendered)
        }
    }

    fn render_unnormalized(&self, spec: &ShiftSpec) -> Option<String> {
        // Fast path: nothing can change the emitted instant, so the
        // original bytes pass through untouched.
        if spec.offset_minutes == 0 && (spec.zone.is_none() || spec.mode == ShiftMode::Offset) {
            if let Some(original) = spec.original {
                return Some(original.to_string());
            }
        }

        let utc = spec
            .utc
            .or_else(|| spec.original.and_then(|o| xmltv_time::parse_timestamp(o).map(|t| t.utc)));

        match spec.mode {
            ShiftMode::Wall => {
                let utc = utc?;
                let shifted = utc + Duration::minutes(i64::from(spec.offset_minutes));
                if let Some(tz) = spec.zone {
                    let local = shifted.with_timezone(&tz);
                    let offset_minutes = local.offset().fix().local_minus_utc() / 60;
                    Some(xmltv_time::format_wall(local.naive_local(), offset_minutes))
                } else if let Some(offset) = spec
                    .original
                    .and_then(|o| xmltv_time::parse_timestamp(o))
                    .and_then(|t| t.offset)
                {
                    // The original's fixed offset stands in for a zone
                    let local = shifted.with_timezone(&offset);
                    Some(xmltv_time::format_wall(
                        local.naive_local(),
                        offset.local_minus_utc() / 60,
                    ))
                } else {
                    Some(xmltv_time::format_wall(shifted.naive_utc(), 0))
                }
            }
            ShiftMode::Offset => {
                let (digits, base_offset) = match spec.original {
                    Some(original) => {
                        let digits = xmltv_time::wall_digits(original)?.to_string();
                        let base = xmltv_time::offset_minutes_of(original).unwrap_or(0);
                        (digits, base)
                    }
                    None => {
                        let utc = utc?;
                        match spec.zone {
                            Some(tz) => {
                                let local = utc.with_timezone(&tz);
                                (
                                    local.naive_local().format("%Y%m%d%H%M%S").to_string(),
                                    local.offset().fix().local_minus_utc() / 60,
                                )
                            }
                            None => (utc.naive_utc().format("%Y%m%d%H%M%S").to_string(), 0),
                        }
                    }
                };
                let adjusted = (base_offset + spec.offset_minutes)
                    .clamp(-MAX_OFFSET_MINUTES, MAX_OFFSET_MINUTES);
                Some(format!("{digits} {}", xmltv_time::format_offset(adjusted)))
            }
        }
    }
}
