//! Caller-configured state interval reconstruction.
//!
//! Where the other machines hard-code their column sets, this one is driven
//! entirely by stage configuration: which field carries the end time, which
//! fields open a new interval when they change, which fields must all match
//! for a row to merely extend the open interval, and which fields close it
//! outright. The open interval is the source row itself, so any column the
//! query selects flows through to the destination unchanged.

use serde::Deserialize;
use thiserror::Error;

use crate::row::{FieldError, Row, StreamItem, Value};

use super::{Record, Reconstructor};

/// Field-name lists steering the generic machine, taken verbatim from stage
/// configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StateFields {
    /// The single column holding the interval end time.
    pub end_time: String,
    /// Columns whose change always closes the open interval and opens a new
    /// one from the same row. The partition key lives here.
    #[serde(default)]
    pub new_row: Vec<String>,
    /// Columns that must all match the open interval for the row to extend
    /// it instead of replacing it.
    #[serde(default)]
    pub update_row: Vec<String>,
    /// Columns whose change closes the open interval without opening a
    /// replacement.
    #[serde(default)]
    pub reset_row: Vec<String>,
}

/// Rejected field-list configuration. Raised before any row is processed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateFieldsError {
    #[error("state reconstruction requires a non-empty end_time field name")]
    MissingEndTime,
    #[error("state reconstruction requires at least one new_row field")]
    EmptyNewRow,
    #[error("state reconstruction requires at least one update_row field")]
    EmptyUpdateRow,
    #[error("field {0:?} is not in the stage's column list")]
    UnknownField(String),
}

impl StateFields {
    /// Checks the lists against the stage's declared column set.
    pub fn validate(&self, columns: &[String]) -> Result<(), StateFieldsError> {
        if self.end_time.is_empty() {
            return Err(StateFieldsError::MissingEndTime);
        }
        if self.new_row.is_empty() {
            return Err(StateFieldsError::EmptyNewRow);
        }
        if self.update_row.is_empty() {
            return Err(StateFieldsError::EmptyUpdateRow);
        }
        let known = |f: &String| columns.contains(f);
        for field in std::iter::once(&self.end_time)
            .chain(&self.new_row)
            .chain(&self.update_row)
            .chain(&self.reset_row)
        {
            if !known(field) {
                return Err(StateFieldsError::UnknownField(field.clone()));
            }
        }
        Ok(())
    }
}

/// Reconstructs intervals for arbitrary entities using configured field
/// lists instead of a built-in schema.
#[derive(Debug)]
pub struct GenericReconstructor {
    fields: StateFields,
    /// Destination column order; emitted records follow it.
    columns: Vec<String>,
    /// Configured end override; None keeps each row's own end value.
    end_time: Option<i64>,
    open: Option<Row>,
}

impl GenericReconstructor {
    pub fn new(
        fields: StateFields,
        columns: Vec<String>,
        end_time: Option<i64>,
    ) -> Result<Self, StateFieldsError> {
        fields.validate(&columns)?;
        Ok(Self {
            fields,
            columns,
            end_time,
            open: None,
        })
    }

    fn open_from(&self, row: Row) -> Row {
        match self.end_time {
            Some(ts) => row.with(&self.fields.end_time, Value::Int(ts)),
            None => row,
        }
    }

    /// True when every named field matches between the open interval and
    /// the incoming row. Missing fields break the source contract.
    fn all_equal(open: &Row, row: &Row, fields: &[String]) -> Result<bool, FieldError> {
        for field in fields {
            if open.require(field)? != row.require(field)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn freeze(&self, open: Row) -> Result<Record, FieldError> {
        let mut record = Record::new();
        for column in &self.columns {
            record.push(column.clone(), open.require(column)?.clone());
        }
        Ok(record)
    }
}

impl Reconstructor for GenericReconstructor {
    fn name(&self) -> &'static str {
        "state_reconstruction"
    }

    fn process(&mut self, item: &StreamItem) -> Result<Vec<Record>, FieldError> {
        let row = match item {
            StreamItem::EndOfStream => {
                return Ok(match self.open.take() {
                    Some(open) => vec![self.freeze(open)?],
                    None => Vec::new(),
                });
            }
            StreamItem::Row(row) => row,
        };

        let Some(open) = self.open.as_mut() else {
            self.open = Some(self.open_from(row.clone()));
            return Ok(Vec::new());
        };

        if !self.fields.reset_row.is_empty()
            && !Self::all_equal(open, row, &self.fields.reset_row)?
        {
            // A reset field changed: the tracked state ended here and the
            // row does not describe a successor.
            let closed = self.open.take().expect("open interval present");
            return Ok(vec![self.freeze(closed)?]);
        }

        if !Self::all_equal(open, row, &self.fields.new_row)? {
            let closed = self.open.take().expect("open interval present");
            let record = self.freeze(closed)?;
            self.open = Some(self.open_from(row.clone()));
            return Ok(vec![record]);
        }

        if Self::all_equal(open, row, &self.fields.update_row)? {
            // Same entity, same state: only the end time moves forward.
            let end = row.require(&self.fields.end_time)?.clone();
            open.set(&self.fields.end_time, end);
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> StateFields {
        StateFields {
            end_time: "end_time".into(),
            new_row: vec!["account_id".into()],
            update_row: vec!["account_id".into(), "principal".into()],
            reset_row: vec!["provider_id".into()],
        }
    }

    fn columns() -> Vec<String> {
        vec![
            "provider_id".into(),
            "account_id".into(),
            "principal".into(),
            "start_time".into(),
            "end_time".into(),
        ]
    }

    fn row(provider: i64, account: i64, principal: &str, start: i64, end: i64) -> StreamItem {
        StreamItem::Row(
            Row::new()
                .with("provider_id", Value::Int(provider))
                .with("account_id", Value::Int(account))
                .with("principal", Value::Str(principal.into()))
                .with("start_time", Value::Int(start))
                .with("end_time", Value::Int(end)),
        )
    }

    fn fsm() -> GenericReconstructor {
        GenericReconstructor::new(fields(), columns(), None).unwrap()
    }

    #[test]
    fn test_validation_rejects_empty_lists() {
        let mut missing_end = fields();
        missing_end.end_time = String::new();
        assert_eq!(
            GenericReconstructor::new(missing_end, columns(), None).unwrap_err(),
            StateFieldsError::MissingEndTime
        );

        let mut no_new = fields();
        no_new.new_row.clear();
        assert_eq!(
            GenericReconstructor::new(no_new, columns(), None).unwrap_err(),
            StateFieldsError::EmptyNewRow
        );

        let mut no_update = fields();
        no_update.update_row.clear();
        assert_eq!(
            GenericReconstructor::new(no_update, columns(), None).unwrap_err(),
            StateFieldsError::EmptyUpdateRow
        );
    }

    #[test]
    fn test_validation_rejects_unknown_field() {
        let mut bad = fields();
        bad.update_row.push("user_id".into());
        assert_eq!(
            GenericReconstructor::new(bad, columns(), None).unwrap_err(),
            StateFieldsError::UnknownField("user_id".into())
        );
    }

    #[test]
    fn test_matching_rows_extend_end_time() {
        let mut fsm = fsm();
        fsm.process(&row(3, 7, "alice", 100, 100)).unwrap();
        assert!(fsm.process(&row(3, 7, "alice", 200, 200)).unwrap().is_empty());
        let out = fsm.process(&StreamItem::EndOfStream).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].int("start_time"), Some(100));
        assert_eq!(out[0].int("end_time"), Some(200));
    }

    #[test]
    fn test_new_row_field_change_reopens() {
        let mut fsm = fsm();
        fsm.process(&row(3, 7, "alice", 100, 100)).unwrap();
        let out = fsm.process(&row(3, 8, "alice", 250, 250)).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].int("account_id"), Some(7));

        let flushed = fsm.process(&StreamItem::EndOfStream).unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].int("account_id"), Some(8));
        assert_eq!(flushed[0].int("start_time"), Some(250));
    }

    #[test]
    fn test_update_row_mismatch_is_inert() {
        let mut fsm = fsm();
        fsm.process(&row(3, 7, "alice", 100, 100)).unwrap();
        // Same account, different principal: neither an extension nor a
        // boundary.
        assert!(fsm.process(&row(3, 7, "bob", 200, 200)).unwrap().is_empty());
        let out = fsm.process(&StreamItem::EndOfStream).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].int("end_time"), Some(100));
        assert_eq!(out[0].get("principal"), Some(&Value::Str("alice".into())));
    }

    #[test]
    fn test_reset_field_change_closes_without_reopening() {
        let mut fsm = fsm();
        fsm.process(&row(3, 7, "alice", 100, 100)).unwrap();
        let out = fsm.process(&row(4, 7, "alice", 200, 200)).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].int("provider_id"), Some(3));
        // Nothing was reopened, so the flush emits nothing.
        assert!(fsm.process(&StreamItem::EndOfStream).unwrap().is_empty());
    }

    #[test]
    fn test_configured_end_overrides_row_value() {
        let mut fsm = GenericReconstructor::new(fields(), columns(), Some(9_999)).unwrap();
        fsm.process(&row(3, 7, "alice", 100, 100)).unwrap();
        let out = fsm.process(&StreamItem::EndOfStream).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].int("end_time"), Some(9_999));
    }

    #[test]
    fn test_record_follows_column_order() {
        let mut fsm = fsm();
        fsm.process(&row(3, 7, "alice", 100, 100)).unwrap();
        let out = fsm.process(&StreamItem::EndOfStream).unwrap();

        let names: Vec<&str> = out[0].columns().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            ["provider_id", "account_id", "principal", "start_time", "end_time"]
        );
    }

    #[test]
    fn test_missing_configured_field_is_precondition_violation() {
        let mut fsm = fsm();
        fsm.process(&row(3, 7, "alice", 100, 100)).unwrap();
        let bad = StreamItem::Row(
            Row::new()
                .with("provider_id", Value::Int(3))
                .with("account_id", Value::Int(7)),
        );
        let err = fsm.process(&bad).unwrap_err();
        assert_eq!(err, FieldError::Missing("principal".into()));
    }
}
