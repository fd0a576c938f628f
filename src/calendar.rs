//! Calendar-date conversions between the `YYYY-MM-DD` boundary format and
//! the naive millisecond timeline.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};

use crate::engine::EngineError;
use crate::model::{Ms, Span};

/// Events end at 23:59 of their last day.
const END_OF_DAY_MINUTES: i64 = 23 * 60 + 59;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a required `YYYY-MM-DD` date. `None` and blank input count as missing.
pub fn parse_date(field: &'static str, input: Option<&str>) -> Result<NaiveDate, EngineError> {
    let raw = input.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    // chrono's %Y accepts any digit count; the boundary format is fixed-width.
    if raw.len() != 10 {
        return Err(invalid_date(field, raw));
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| invalid_date(field, raw))
}

fn invalid_date(field: &'static str, raw: &str) -> EngineError {
    EngineError::Validation(format!("{field}: invalid date '{raw}', expected YYYY-MM-DD"))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parse a `YYYY-MM-DD HH:MM` instant (a `T` separator and seconds are also
/// accepted).
pub fn parse_datetime(field: &'static str, input: &str) -> Result<NaiveDateTime, EngineError> {
    let raw = input.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "{field}: invalid datetime '{raw}', expected YYYY-MM-DD HH:MM"
            ))
        })
}

pub fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M").to_string()
}

pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn from_ms(ms: Ms) -> NaiveDateTime {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

/// Calendar date of an instant.
pub fn date_of(ms: Ms) -> NaiveDate {
    from_ms(ms).date()
}

/// The span of an event running from the start of `start` to 23:59 of `end`.
pub fn day_span(start: NaiveDate, end: NaiveDate) -> Result<Span, EngineError> {
    if start > end {
        return Err(EngineError::Validation(
            "start date must not be after end date".into(),
        ));
    }
    let start_dt = start.and_time(NaiveTime::MIN);
    let end_dt = end
        .and_time(NaiveTime::MIN)
        .checked_add_signed(TimeDelta::minutes(END_OF_DAY_MINUTES))
        .ok_or_else(|| EngineError::Validation("end date out of range".into()))?;
    Ok(Span::new(to_ms(start_dt), to_ms(end_dt)))
}

/// Today's date on the local calendar.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn round_hours(hours: f64) -> f64 {
    (hours * 100.0).round() / 100.0
}
