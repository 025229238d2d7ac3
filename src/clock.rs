//! Clock Service
//! Authoritative wall-clock in a fixed civil timezone (UTC+05:30).
//!
//! Every timestamp the system persists is a civil-time string in this zone;
//! conversions to and from instants happen only here. Nothing else in the
//! codebase may consult the host's local timezone.

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, NaiveTime, TimeZone, Utc};

/// Length of one betting round.
pub const SLOT_SECS: i64 = 300;

/// Round ids are the slot start formatted on the civil clock.
pub const ROUND_ID_FORMAT: &str = "%Y%m%d%H%M";

/// Lossless civil-time string format, round-trippable with `parse_civil`.
pub const CIVIL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const OFFSET_SECS: i32 = 5 * 3600 + 30 * 60; // +05:30

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    offset: FixedOffset,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        let offset = FixedOffset::east_opt(OFFSET_SECS).expect("static offset is in range");
        Self { offset }
    }

    /// Current instant on the operating-zone civil clock.
    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    /// Largest slot boundary <= t. The +05:30 offset is a whole number of
    /// minutes divisible by 5, so flooring the epoch timestamp to 300s lands
    /// on civil 5-minute boundaries.
    pub fn floor_to_slot(&self, t: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let floored = t.timestamp().div_euclid(SLOT_SECS) * SLOT_SECS;
        self.offset
            .timestamp_opt(floored, 0)
            .single()
            .expect("floored epoch timestamp is representable")
    }

    /// Slot start instant for a round id.
    pub fn slot_start(&self, round_id: &str) -> AppResult<DateTime<FixedOffset>> {
        self.parse_round_id(round_id)
    }

    /// Slot end instant for a round id: start + 300s.
    pub fn slot_end(&self, round_id: &str) -> AppResult<DateTime<FixedOffset>> {
        Ok(self.parse_round_id(round_id)? + Duration::seconds(SLOT_SECS))
    }

    /// `"YYYYMMDDHHMM"` id of the slot containing t.
    pub fn format_round_id(&self, t: DateTime<FixedOffset>) -> String {
        self.floor_to_slot(t).format(ROUND_ID_FORMAT).to_string()
    }

    /// Total on any 12-digit string that names a valid civil datetime;
    /// everything else is `InvalidRoundId`.
    pub fn parse_round_id(&self, id: &str) -> AppResult<DateTime<FixedOffset>> {
        if id.len() != 12 || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::InvalidRoundId(id.to_string()));
        }
        let naive = NaiveDateTime::parse_from_str(id, ROUND_ID_FORMAT)
            .map_err(|_| AppError::InvalidRoundId(id.to_string()))?;
        self.offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| AppError::InvalidRoundId(id.to_string()))
    }

    /// Lossless `"YYYY-MM-DD HH:MM:SS"` in the operating zone.
    pub fn civil_string(&self, t: DateTime<FixedOffset>) -> String {
        t.with_timezone(&self.offset).format(CIVIL_FORMAT).to_string()
    }

    pub fn parse_civil(&self, s: &str) -> AppResult<DateTime<FixedOffset>> {
        let naive = NaiveDateTime::parse_from_str(s, CIVIL_FORMAT)
            .map_err(|_| AppError::BadTimeFormat(s.to_string()))?;
        self.offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| AppError::BadTimeFormat(s.to_string()))
    }

    /// Civil `HH:MM`, used by the operating-window settings.
    pub fn parse_hhmm(&self, s: &str) -> AppResult<NaiveTime> {
        NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| AppError::BadTimeFormat(s.to_string()))
    }

    /// Civil date `YYYY-MM-DD`, used by by-date listings.
    pub fn parse_date(&self, s: &str) -> AppResult<chrono::NaiveDate> {
        chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|_| AppError::BadTimeFormat(s.to_string()))
    }

    /// Whether the civil time-of-day of t falls inside [start, end].
    pub fn in_window(&self, t: DateTime<FixedOffset>, start: NaiveTime, end: NaiveTime) -> bool {
        let tod = t.with_timezone(&self.offset).time();
        if start <= end {
            tod >= start && tod <= end
        } else {
            // Window wrapping midnight
            tod >= start || tod <= end
        }
    }
}
