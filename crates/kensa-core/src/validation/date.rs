//! Date search validation
//!
//! FHIR dates are ranges: `2020` covers the whole year, `2020-03-14` the
//! whole day, and a dateTime without seconds the whole minute. Comparators
//! are evaluated between the range implied by the search value and the range
//! covered by the target element (a date, dateTime, instant or Period).

use crate::metadata::Comparator;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static DATE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(\d{4})(?:-(\d{2})(?:-(\d{2})",
        r"(?:T(\d{2}):(\d{2})(?::(\d{2})(\.\d+)?)?(Z|[+-]\d{2}:\d{2})?)?)?)?$",
    ))
    .expect("date pattern is valid")
});

/// Precision a FHIR date value was written with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePrecision {
    Year,
    Month,
    Day,
    Minute,
    Second,
    Instant,
}

/// Inclusive range of instants covered by a date value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    fn unbounded() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// A parsed date value together with its precision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDate {
    pub range: DateRange,
    pub precision: DatePrecision,
    pub offset: FixedOffset,
}

/// Parse a FHIR date, dateTime or instant string
pub fn parse_date(value: &str) -> Option<ParsedDate> {
    let caps = DATE_PATTERN.captures(value.trim())?;
    let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let utc = FixedOffset::east_opt(0)?;

    let Some(month) = number(2) else {
        let start = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()?;
        let next = Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single()?;
        return Some(ParsedDate {
            range: closed(start, next),
            precision: DatePrecision::Year,
            offset: utc,
        });
    };

    let Some(day) = number(3) else {
        let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let next = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).single()?;
        return Some(ParsedDate {
            range: closed(start, next),
            precision: DatePrecision::Month,
            offset: utc,
        });
    };

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let Some(hour) = number(4) else {
        let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
        return Some(ParsedDate {
            range: closed(start, start + Duration::days(1)),
            precision: DatePrecision::Day,
            offset: utc,
        });
    };

    let minute = number(5)?;
    let second = number(6);
    let fraction = caps.get(7).map(|m| m.as_str());
    let offset = match caps.get(8).map(|m| m.as_str()) {
        None | Some("Z") => utc,
        Some(raw) => parse_offset(raw)?,
    };

    let time = chrono::NaiveTime::from_hms_opt(hour, minute, second.unwrap_or(0))?;
    let naive = NaiveDateTime::new(date, time);
    let local = offset.from_local_datetime(&naive).single()?;
    let start = local.with_timezone(&Utc);

    let (range, precision) = match (second, fraction) {
        (None, _) => (closed(start, start + Duration::minutes(1)), DatePrecision::Minute),
        (Some(_), None) => (closed(start, start + Duration::seconds(1)), DatePrecision::Second),
        (Some(_), Some(fraction)) => {
            let nanos: f64 = format!("0{fraction}").parse().ok()?;
            let instant = start + Duration::nanoseconds((nanos * 1e9) as i64);
            (
                DateRange {
                    start: instant,
                    end: instant,
                },
                DatePrecision::Instant,
            )
        }
    };

    Some(ParsedDate {
        range,
        precision,
        offset,
    })
}

fn closed(start: DateTime<Utc>, next: DateTime<Utc>) -> DateRange {
    DateRange {
        start,
        end: next - Duration::nanoseconds(1),
    }
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let sign = if raw.starts_with('-') { -1 } else { 1 };
    let (hours, minutes) = raw[1..].split_once(':')?;
    let seconds = hours.parse::<i32>().ok()? * 3600 + minutes.parse::<i32>().ok()? * 60;
    FixedOffset::east_opt(sign * seconds)
}

/// Range covered by a target element: a date string or a Period object
pub fn target_range(value: &Value) -> Option<DateRange> {
    match value {
        Value::String(s) => parse_date(s).map(|parsed| parsed.range),
        Value::Object(period) => {
            let start = period
                .get("start")
                .and_then(Value::as_str)
                .and_then(parse_date)
                .map(|p| p.range.start);
            let end = period
                .get("end")
                .and_then(Value::as_str)
                .and_then(parse_date)
                .map(|p| p.range.end);
            if start.is_none() && end.is_none() {
                return None;
            }
            let unbounded = DateRange::unbounded();
            Some(DateRange {
                start: start.unwrap_or(unbounded.start),
                end: end.unwrap_or(unbounded.end),
            })
        }
        _ => None,
    }
}

/// Does the target element satisfy a (possibly prefixed) date search value?
pub fn validate_date_search(requested: &str, target: &Value) -> bool {
    let (comparator, raw) = Comparator::split_prefix(requested);
    let Some(search) = parse_date(raw) else {
        return false;
    };
    let Some(target) = target_range(target) else {
        return false;
    };
    compare(comparator, &search.range, &target)
}

fn compare(comparator: Comparator, search: &DateRange, target: &DateRange) -> bool {
    let contains = search.start <= target.start && search.end >= target.end;
    match comparator {
        Comparator::Eq => contains,
        Comparator::Ne => !contains,
        Comparator::Gt => target.end > search.end,
        Comparator::Lt => target.start < search.start,
        Comparator::Ge => target.end > search.end || contains,
        Comparator::Le => target.start < search.start || contains,
        Comparator::Sa => target.start > search.end,
        Comparator::Eb => target.end < search.start,
        Comparator::Ap => {
            let widened = DateRange {
                start: search.start - Duration::days(1),
                end: search.end + Duration::days(1),
            };
            widened.overlaps(target)
        }
    }
}

/// Shift a date value by whole days, keeping its written precision
///
/// Year and month precision values are widened to a day first, since a
/// day shift is not expressible at those precisions.
pub fn shift_days(value: &str, days: i64) -> Option<String> {
    let parsed = parse_date(value)?;
    let shifted = parsed.range.start + Duration::days(days);
    Some(match parsed.precision {
        DatePrecision::Year | DatePrecision::Month | DatePrecision::Day => {
            shifted.format("%Y-%m-%d").to_string()
        }
        DatePrecision::Minute | DatePrecision::Second | DatePrecision::Instant => shifted
            .with_timezone(&parsed.offset)
            .format("%Y-%m-%dT%H:%M:%S%:z")
            .to_string(),
    })
}
