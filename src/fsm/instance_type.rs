//! Instance-type catalog interval reconstruction.
//!
//! Consumes instance-type configuration facts ordered by (resource, type)
//! and start time, and emits one record per span during which a type held
//! one (cores, memory, disk) shape. Newly discovered types carry the zero
//! placeholder id; a later row for the same shape that carries the real id
//! corrects the open span's key in place, so the sink updates the existing
//! destination row instead of inserting a duplicate.

use crate::row::{FieldError, Row, StreamItem, Value};

use super::{today_end_of_day, Record, Reconstructor};

/// Placeholder id carried by rows whose instance type has not been
/// assigned a catalog key yet.
const PLACEHOLDER_TYPE_ID: i64 = 0;

/// Typed view of an instance-type source row.
struct TypeRow {
    resource_id: i64,
    instance_type_id: i64,
    instance_type: String,
    display: String,
    description: String,
    num_cores: i64,
    memory_mb: i64,
    disk_gb: i64,
    start_time: i64,
}

impl TypeRow {
    fn parse(row: &Row) -> Result<Self, FieldError> {
        Ok(Self {
            resource_id: row.int("resource_id")?,
            instance_type_id: row.int("instance_type_id")?,
            instance_type: row.text("instance_type")?.to_string(),
            display: row.text("display")?.to_string(),
            description: row.text("description")?.to_string(),
            num_cores: row.int("num_cores")?,
            memory_mb: row.int("memory_mb")?,
            disk_gb: row.int("disk_gb")?,
            start_time: row.int("start_time")?,
        })
    }
}

/// The single open catalog span held between rows.
#[derive(Debug, Clone)]
struct OpenType {
    resource_id: i64,
    instance_type_id: i64,
    instance_type: String,
    display: String,
    description: String,
    num_cores: i64,
    memory_mb: i64,
    disk_gb: i64,
    start_time: i64,
    end_time: i64,
}

impl OpenType {
    fn same_type(&self, row: &TypeRow) -> bool {
        self.resource_id == row.resource_id && self.instance_type == row.instance_type
    }

    fn same_shape(&self, row: &TypeRow) -> bool {
        self.num_cores == row.num_cores
            && self.memory_mb == row.memory_mb
            && self.disk_gb == row.disk_gb
    }

    /// True when `row` retroactively supplies the catalog key for this
    /// span: identical shape, a later start, a real id where the span
    /// still holds the placeholder.
    fn supplies_key(&self, row: &TypeRow) -> bool {
        self.same_shape(row)
            && self.start_time < row.start_time
            && self.instance_type_id == PLACEHOLDER_TYPE_ID
            && row.instance_type_id != PLACEHOLDER_TYPE_ID
    }

    fn into_record(self) -> Record {
        Record::new()
            .with("resource_id", Value::Int(self.resource_id))
            .with("instance_type_id", Value::Int(self.instance_type_id))
            .with("instance_type", Value::Str(self.instance_type))
            .with("display", Value::Str(self.display))
            .with("description", Value::Str(self.description))
            .with("num_cores", Value::Int(self.num_cores))
            .with("memory_mb", Value::Int(self.memory_mb))
            .with("disk_gb", Value::Int(self.disk_gb))
            .with("start_time", Value::Int(self.start_time))
            .with("end_time", Value::Int(self.end_time))
    }
}

/// Reconstructs instance-type configuration spans from catalog facts.
pub struct InstanceTypeReconstructor {
    /// Configured end override for unterminated spans; None falls back to
    /// the end of the current day, since the catalog only records changes.
    end_time: Option<i64>,
    open: Option<OpenType>,
}

impl InstanceTypeReconstructor {
    pub fn new(end_time: Option<i64>) -> Self {
        Self {
            end_time,
            open: None,
        }
    }

    fn open_type(&self, row: TypeRow) -> OpenType {
        OpenType {
            resource_id: row.resource_id,
            instance_type_id: row.instance_type_id,
            instance_type: row.instance_type,
            display: row.display,
            description: row.description,
            num_cores: row.num_cores,
            memory_mb: row.memory_mb,
            disk_gb: row.disk_gb,
            start_time: row.start_time,
            end_time: self.end_time.unwrap_or_else(today_end_of_day),
        }
    }
}

impl Reconstructor for InstanceTypeReconstructor {
    fn name(&self) -> &'static str {
        "instance_type"
    }

    fn process(&mut self, item: &StreamItem) -> Result<Vec<Record>, FieldError> {
        let raw = match item {
            StreamItem::EndOfStream => {
                return Ok(self
                    .open
                    .take()
                    .map(OpenType::into_record)
                    .into_iter()
                    .collect());
            }
            StreamItem::Row(row) => row,
        };
        let row = TypeRow::parse(raw)?;

        let Some(open) = self.open.as_mut() else {
            self.open = Some(self.open_type(row));
            return Ok(Vec::new());
        };

        if !open.same_type(&row) {
            let closed = self.open.take().expect("open span present").into_record();
            self.open = Some(self.open_type(row));
            return Ok(vec![closed]);
        }

        if !open.same_shape(&row) {
            // The new shape took effect at row.start_time; the old one
            // ended the instant before.
            open.end_time = row.start_time - 1;
            let closed = self.open.take().expect("open span present").into_record();
            self.open = Some(self.open_type(row));
            return Ok(vec![closed]);
        }

        if open.supplies_key(&row) {
            open.instance_type_id = row.instance_type_id;
        }

        Ok(Vec::new())
    }
}
