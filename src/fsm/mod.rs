//! Interval reconstruction state machines.
//!
//! Each variant is a single-pass fold over an ordered row stream: it holds
//! at most one open interval, mutates it in place as matching rows arrive,
//! and freezes it into a flat [`Record`] exactly once, at the moment it
//! closes. Closing happens on a partition-key change, a config-field
//! change, or end of stream; the machines perform no I/O and have no
//! suspension points.

pub mod generic;
pub mod instance_type;
pub mod resource_specs;
pub mod vm;

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::row::{FieldError, StreamItem, Value};

/// A closed interval, flattened to the destination table's column set.
/// Column order is the insert order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    columns: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Integer column accessor used by assertions in tests.
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn columns(&self) -> &[(String, Value)] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Single-pass interval reconstruction over an ordered row stream.
///
/// `process` is a synchronous reducer: `(state, item) -> emitted records`.
/// A call emits zero records (row absorbed into the open interval), one
/// (interval closed, possibly with a new one opened from the same row), and
/// never more. `EndOfStream` is the flush transition: it emits the open
/// interval if any and opens nothing, and is idempotent.
pub trait Reconstructor: Send {
    /// Stage-kind label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Folds one stream item into the machine state. Takes the item by
    /// reference so the driver can still render it if the fold fails.
    fn process(&mut self, item: &StreamItem) -> Result<Vec<Record>, FieldError>;
}

/// Last second (23:59:59 UTC) of the day containing `ts`.
pub(crate) fn end_of_day(ts: i64) -> i64 {
    let day = ts.div_euclid(86_400);
    (day + 1) * 86_400 - 1
}

/// Day identifier `year * 100_000 + ordinal day`, the warehouse's
/// day-dimension key.
pub(crate) fn day_id(ts: i64) -> i64 {
    let date = Utc
        .timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.date_naive())
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
    i64::from(date.year()) * 100_000 + i64::from(date.ordinal())
}

/// Parses a calendar date `YYYY-MM-DD` into its midnight UTC timestamp.
pub(crate) fn parse_date(field: &str, s: &str) -> Result<i64, FieldError> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| FieldError::Invalid {
        field: field.to_string(),
        value: s.to_string(),
    })?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp())
}

/// Parses a configured end-date override.
///
/// A date-only value is exclusive: unterminated intervals end at the last
/// second before it. A full datetime is used verbatim.
pub fn parse_end_date(s: &str) -> Option<i64> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp() - 1);
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// End-of-day of the current UTC day, the fallback end for interval kinds
/// that track day-granular facts.
pub(crate) fn today_end_of_day() -> i64 {
    end_of_day(Utc::now().timestamp())
}
