//! Date handling for record fields and backup timestamps.
//!
//! Dates are stored as `YYYY-MM-DD` strings and timestamps as RFC 3339 in UTC.

use time::{
    format_description::{well_known::Rfc3339, FormatItem},
    macros::format_description,
    Date, OffsetDateTime, PrimitiveDateTime, Time,
};

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Parses a `YYYY-MM-DD` date, also accepting a full RFC 3339 timestamp
/// (only its date part is kept).
pub fn parse_date(s: &str) -> Option<Date> {
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(ts.date());
    }
    Date::parse(s, DATE_FORMAT).ok()
}

/// Parses an RFC 3339 timestamp. A bare date is read as midnight UTC.
pub fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(ts);
    }
    Date::parse(s, DATE_FORMAT)
        .ok()
        .map(|d| PrimitiveDateTime::new(d, Time::MIDNIGHT).assume_utc())
}

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

pub fn format_date(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    #[test]
    fn test_parse_date_formats() {
        let d = Date::from_calendar_date(2024, Month::January, 15).unwrap();
        assert_eq!(parse_date("2024-01-15"), Some(d));
        assert_eq!(parse_date("2024-01-15T10:30:00Z"), Some(d));
        assert_eq!(parse_date("15/01/2024"), None);
        assert_eq!(format_date(d), "2024-01-15");
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = parse_timestamp("2024-03-01T08:00:00Z").unwrap();
        assert_eq!(parse_timestamp(&format_timestamp(ts)), Some(ts));
        assert_eq!(parse_timestamp("2024-03-01").unwrap().date(), ts.date());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
