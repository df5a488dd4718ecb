use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Parses `yyyy-MM-dd HH:mm` or `yyyy-MM-dd` (midnight). Anything else is `None`.
pub fn parse_task_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.len() > 10 {
        return NaiveDateTime::parse_from_str(value, DATE_TIME_FORMAT)
            .ok()
            .filter(|parsed| parsed.format(DATE_TIME_FORMAT).to_string() == value);
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .ok()
        .filter(|parsed| parsed.format(DATE_FORMAT).to_string() == value)
        .map(|date| date.and_time(NaiveTime::MIN))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn format_date_time(value: NaiveDateTime) -> String {
    value.format(DATE_TIME_FORMAT).to_string()
}

/// Lower and upper day bounds used by the bucketed queries: today and today + 2.
pub fn bucket_bounds(today: NaiveDate) -> (String, String) {
    (format_date(today), format_date(today + Duration::days(2)))
}
