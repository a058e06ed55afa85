//! Provider weekly availability parsing.
//!
//! Providers store availability either as a map of day name to comma
//! separated `HH:MM-HH:MM` ranges, or as a list of already structured
//! windows. Both shapes are normalized here; entries that cannot be read are
//! logged and skipped so one typo does not hide the rest of the week.

use chrono::NaiveTime;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::domain::schedule::{hhmm, AvailabilityWindow, DayOfWeek};

/// Structured entry as stored by older clients.
#[derive(Debug, Deserialize)]
struct StructuredEntry {
    #[serde(alias = "dia")]
    day: String,
    #[serde(alias = "horaInicio", alias = "startTime")]
    start_time: String,
    #[serde(alias = "horaFin", alias = "endTime")]
    end_time: String,
}

/// Parses the stored availability text. Never fails: unreadable input yields
/// an empty list.
pub fn parse_availability(raw: &str) -> Vec<AvailabilityWindow> {
    if raw.trim().is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(value) => parse_availability_value(&value),
        Err(e) => {
            warn!(error = %e, "Availability is not valid JSON, ignoring");
            Vec::new()
        }
    }
}

/// Same as [`parse_availability`] for an already decoded JSON document.
pub fn parse_availability_value(value: &Value) -> Vec<AvailabilityWindow> {
    let mut windows = match value {
        Value::Object(days) => days
            .iter()
            .flat_map(|(day, ranges)| parse_day_ranges(day, ranges))
            .collect(),
        Value::Array(entries) => entries.iter().filter_map(parse_structured_entry).collect(),
        Value::Null => Vec::new(),
        other => {
            warn!(kind = %json_kind(other), "Unsupported availability shape, ignoring");
            Vec::new()
        }
    };

    windows.sort_by_key(|w: &AvailabilityWindow| (w.day, w.start_time, w.end_time));
    windows.dedup();
    windows
}

fn parse_day_ranges(day: &str, ranges: &Value) -> Vec<AvailabilityWindow> {
    let Some(day_of_week) = DayOfWeek::parse(day) else {
        warn!(day = %day, "Unknown day in availability, skipping");
        return Vec::new();
    };

    let Some(ranges) = ranges.as_str() else {
        warn!(day = %day, "Availability ranges are not a string, skipping");
        return Vec::new();
    };

    ranges
        .split(',')
        .map(str::trim)
        .filter(|range| !range.is_empty())
        .filter_map(|range| match parse_range(range) {
            Some((start_time, end_time)) => Some(AvailabilityWindow {
                day: day_of_week,
                start_time,
                end_time,
            }),
            None => {
                warn!(day = %day, range = %range, "Malformed availability range, skipping");
                None
            }
        })
        .collect()
}

fn parse_structured_entry(entry: &Value) -> Option<AvailabilityWindow> {
    let parsed: StructuredEntry = match serde_json::from_value(entry.clone()) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Malformed availability entry, skipping");
            return None;
        }
    };

    let day = DayOfWeek::parse(&parsed.day);
    let start = hhmm::parse(&parsed.start_time);
    let end = hhmm::parse(&parsed.end_time);

    match (day, start, end) {
        (Some(day), Some(start_time), Some(end_time)) if start_time < end_time => {
            Some(AvailabilityWindow {
                day,
                start_time,
                end_time,
            })
        }
        _ => {
            warn!(
                day = %parsed.day,
                start = %parsed.start_time,
                end = %parsed.end_time,
                "Invalid availability entry, skipping"
            );
            None
        }
    }
}

/// `"09:00-13:00"` into an ordered pair of times.
fn parse_range(range: &str) -> Option<(NaiveTime, NaiveTime)> {
    let (start, end) = range.split_once('-')?;
    let start = hhmm::parse(start)?;
    let end = hhmm::parse(end)?;
    (start < end).then_some((start, end))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
