use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::model::Ms;

/// Canonical wall-clock format for every timestamp that leaves the engine.
pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M";

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse any accepted input shape into a naive local date-time.
/// Offsets on RFC 3339 input are dropped; the wall-clock reading is kept.
pub fn parse_local(input: &str) -> Option<NaiveDateTime> {
    let s = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Normalize a timestamp string to `yyyy-MM-dd HH:mm`.
/// Unparseable input is returned unchanged.
pub fn normalize(input: &str) -> String {
    match parse_local(input) {
        Some(dt) => normalize_datetime(dt),
        None => input.to_string(),
    }
}

pub fn normalize_datetime(dt: NaiveDateTime) -> String {
    dt.format(CANONICAL_FORMAT).to_string()
}

/// Parse a timestamp into engine milliseconds (minute precision).
pub fn parse_stamp(input: &str) -> Option<Ms> {
    let dt = parse_local(input)?;
    let dt = dt.with_second(0)?.with_nanosecond(0)?;
    Some(to_ms(dt))
}

pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn from_ms(ms: Ms) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

pub fn format_stamp(ms: Ms) -> String {
    match from_ms(ms) {
        Some(dt) => normalize_datetime(dt),
        None => ms.to_string(),
    }
}

/// Calendar day a timestamp falls on.
pub fn day_of(ms: Ms) -> NaiveDate {
    from_ms(ms)
        .map(|dt| dt.date())
        .unwrap_or(NaiveDate::MIN)
}

pub fn day_start(day: NaiveDate) -> Ms {
    day.and_hms_opt(0, 0, 0).map(to_ms).unwrap_or(Ms::MIN)
}

pub fn at(day: NaiveDate, hour: u32) -> Option<Ms> {
    day.and_hms_opt(hour, 0, 0).map(to_ms)
}

pub fn weekday_of(day: NaiveDate) -> chrono::Weekday {
    day.weekday()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_iso_and_canonical() {
        assert_eq!(normalize("2025-03-10T09:00:00"), "2025-03-10 09:00");
        assert_eq!(normalize("2025-03-10T09:30"), "2025-03-10 09:30");
        assert_eq!(normalize("2025-03-10 09:30"), "2025-03-10 09:30");
        assert_eq!(normalize("2025-03-10T09:30:15.250"), "2025-03-10 09:30");
        assert_eq!(normalize("2025-03-10"), "2025-03-10 00:00");
    }

    #[test]
    fn normalize_keeps_wall_clock_of_offset_input() {
        assert_eq!(normalize("2025-03-10T09:00:00+02:00"), "2025-03-10 09:00");
        assert_eq!(normalize("2025-03-10T09:00:00Z"), "2025-03-10 09:00");
    }

    #[test]
    fn normalize_is_fail_soft() {
        assert_eq!(normalize("next tuesday"), "next tuesday");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("2025-07-01T16:45:00");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn stamp_roundtrip_truncates_seconds() {
        let ms = parse_stamp("2025-03-10T09:00:59").unwrap();
        assert_eq!(format_stamp(ms), "2025-03-10 09:00");
        assert_eq!(ms % MINUTE, 0);
    }

    #[test]
    fn stamp_rejects_garbage() {
        assert!(parse_stamp("garbage").is_none());
        assert!(parse_stamp("2025-13-40 09:00").is_none());
    }

    #[test]
    fn day_boundaries() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let nine = at(day, 9).unwrap();
        assert_eq!(day_of(nine), day);
        assert_eq!(nine - day_start(day), 9 * HOUR);
        assert_eq!(day_of(day_start(day) + DAY), day.succ_opt().unwrap());
    }
}
