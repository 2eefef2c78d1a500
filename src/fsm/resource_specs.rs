//! Host hardware-spec interval reconstruction.
//!
//! Consumes daily host configuration facts ordered by (resource, host) and
//! date, and emits one record per span during which a host held one
//! (vcpus, memory) configuration. A -1/-1 value pair marks the host as
//! absent from the day's inventory: it closes the open span without
//! opening a new one, and is skipped silently when nothing is open.

use crate::row::{FieldError, Row, StreamItem, Value};

use super::{day_id, parse_date, today_end_of_day, Record, Reconstructor};

/// Typed view of a hardware-spec source row.
struct SpecRow {
    resource_id: i64,
    host_id: i64,
    vcpus: i64,
    memory_mb: i64,
    /// Midnight of the fact date.
    date_ts: i64,
}

impl SpecRow {
    fn parse(row: &Row) -> Result<Self, FieldError> {
        Ok(Self {
            resource_id: row.int("resource_id")?,
            host_id: row.int("host_id")?,
            vcpus: row.int("vcpus")?,
            memory_mb: row.int("memory_mb")?,
            date_ts: parse_date("fact_date", row.text("fact_date")?)?,
        })
    }

    /// True for the inventory marker meaning the host was not present.
    fn host_absent(&self) -> bool {
        self.vcpus == -1 && self.memory_mb == -1
    }

    /// Last second of the day before this row's fact date, the closing
    /// edge for a configuration superseded on this date.
    fn day_before_end(&self) -> i64 {
        self.date_ts - 1
    }
}

/// The single open configuration span held between rows.
#[derive(Debug, Clone)]
struct OpenSpan {
    resource_id: i64,
    host_id: i64,
    vcpus: i64,
    memory_mb: i64,
    start_date_ts: i64,
    end_date_ts: i64,
}

impl OpenSpan {
    fn same_host(&self, row: &SpecRow) -> bool {
        self.resource_id == row.resource_id && self.host_id == row.host_id
    }

    fn same_config(&self, row: &SpecRow) -> bool {
        self.vcpus == row.vcpus && self.memory_mb == row.memory_mb
    }

    fn into_record(self) -> Record {
        Record::new()
            .with("resource_id", Value::Int(self.resource_id))
            .with("host_id", Value::Int(self.host_id))
            .with("vcpus", Value::Int(self.vcpus))
            .with("memory_mb", Value::Int(self.memory_mb))
            .with("start_date_ts", Value::Int(self.start_date_ts))
            .with("end_date_ts", Value::Int(self.end_date_ts))
            .with("start_day_id", Value::Int(day_id(self.start_date_ts)))
            .with("end_day_id", Value::Int(day_id(self.end_date_ts)))
    }
}

/// Reconstructs host hardware-spec spans from daily inventory facts.
pub struct ResourceSpecsReconstructor {
    /// Configured end override for unterminated spans; None falls back to
    /// the end of the current day, since a configuration only appears in
    /// the stream when it changes.
    end_time: Option<i64>,
    open: Option<OpenSpan>,
}

impl ResourceSpecsReconstructor {
    pub fn new(end_time: Option<i64>) -> Self {
        Self {
            end_time,
            open: None,
        }
    }

    fn open_span(&self, row: &SpecRow) -> OpenSpan {
        OpenSpan {
            resource_id: row.resource_id,
            host_id: row.host_id,
            vcpus: row.vcpus,
            memory_mb: row.memory_mb,
            start_date_ts: row.date_ts,
            end_date_ts: self.end_time.unwrap_or_else(today_end_of_day),
        }
    }
}

impl Reconstructor for ResourceSpecsReconstructor {
    fn name(&self) -> &'static str {
        "resource_specs"
    }

    fn process(&mut self, item: &StreamItem) -> Result<Vec<Record>, FieldError> {
        let raw = match item {
            StreamItem::EndOfStream => {
                return Ok(self
                    .open
                    .take()
                    .map(OpenSpan::into_record)
                    .into_iter()
                    .collect());
            }
            StreamItem::Row(row) => row,
        };
        let row = SpecRow::parse(raw)?;

        if row.host_absent() {
            let Some(mut open) = self.open.take() else {
                // Host already gone; nothing to close.
                return Ok(Vec::new());
            };
            open.end_date_ts = row.day_before_end();
            return Ok(vec![open.into_record()]);
        }

        let Some(open) = self.open.as_mut() else {
            self.open = Some(self.open_span(&row));
            return Ok(Vec::new());
        };

        if !open.same_host(&row) {
            let closed = self.open.take().expect("open span present").into_record();
            self.open = Some(self.open_span(&row));
            return Ok(vec![closed]);
        }

        if !open.same_config(&row) {
            // The new configuration took effect on this date, so the old
            // one ended the day before.
            open.end_date_ts = row.day_before_end();
            let closed = self.open.take().expect("open span present").into_record();
            self.open = Some(self.open_span(&row));
            return Ok(vec![closed]);
        }

        // Identical configuration reported again: the open span already
        // covers it.
        Ok(Vec::new())
    }
}
