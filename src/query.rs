//! Source query augmentation.
//!
//! The state machines are single-pass with no lookahead, so the only way to
//! flush the last open interval is to guarantee a terminating row after the
//! true last row of every partition. This module takes a stage's base query
//! and appends a UNION ALL all-zero row plus the composite ORDER BY that
//! pushes it to the very end: partition columns descending (zero sorts
//! last), time ascending. Ordinal positions are computed from the declared
//! column list, never assumed.

use std::fmt::Write;

use serde::Deserialize;
use thiserror::Error;

/// Sort direction for one ORDER BY column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    fn as_sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// One ORDER BY entry, named by column rather than position.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub dir: SortDir,
}

/// Rejected source query definition. Raised during configuration
/// validation, before any query is executed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("source query declares no columns")]
    NoColumns,
    #[error("source query declares no ordering; the stream contract requires one")]
    NoOrdering,
    #[error("order_by column {0:?} is not in the declared column list")]
    UnknownOrderColumn(String),
}

/// A stage's base query plus the metadata needed to augment it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceQuery {
    /// Declared output columns, in the base query's SELECT order.
    pub columns: Vec<String>,
    /// The base SELECT, already filtered; no ORDER BY of its own.
    pub base_sql: String,
    /// Composite ordering: partition columns descending first, then time
    /// ascending.
    pub order_by: Vec<OrderBy>,
}

impl SourceQuery {
    /// Produces the final SQL: base query, UNION ALL zero-row terminator,
    /// and the ordinal ORDER BY derived from the column list.
    ///
    /// Getting this wrong silently drops the final interval of every
    /// partition, so unknown order columns are a hard error rather than a
    /// skipped entry.
    pub fn augmented_sql(&self) -> Result<String, QueryError> {
        if self.columns.is_empty() {
            return Err(QueryError::NoColumns);
        }
        if self.order_by.is_empty() {
            return Err(QueryError::NoOrdering);
        }

        let mut sql = String::with_capacity(self.base_sql.len() + 128);
        sql.push_str(self.base_sql.trim_end());

        sql.push_str("\nUNION ALL\nSELECT ");
        for idx in 0..self.columns.len() {
            if idx > 0 {
                sql.push_str(", ");
            }
            sql.push('0');
        }

        sql.push_str("\nORDER BY ");
        for (idx, entry) in self.order_by.iter().enumerate() {
            let ordinal = self.ordinal(&entry.column)?;
            if idx > 0 {
                sql.push_str(", ");
            }
            // write! to a String cannot fail.
            let _ = write!(sql, "{} {}", ordinal, entry.dir.as_sql());
        }
        Ok(sql)
    }

    /// 1-based SELECT position of a declared column.
    fn ordinal(&self, column: &str) -> Result<usize, QueryError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|p| p + 1)
            .ok_or_else(|| QueryError::UnknownOrderColumn(column.to_string()))
    }
}
