//! Ordered row source.
//!
//! Executes a stage's augmented query and converts the result block into
//! the stream the state machines consume. The physical stream carries the
//! all-zero terminator row appended by the query augmentation; this layer
//! maps it (or plain exhaustion of the result set) to
//! [`StreamItem::EndOfStream`], so exactly one end marker reaches the
//! machine no matter what the warehouse returned.

use anyhow::{bail, Context, Result};
use clickhouse_rs::types::{Block, ColumnType, SqlType};
use clickhouse_rs::Pool;

use crate::query::SourceQuery;
use crate::row::{Row, StreamItem, Value};

/// Fetches ordered row streams from the warehouse.
pub struct WarehouseSource {
    pool: Pool,
}

impl WarehouseSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Runs the augmented query and returns the full ordered stream,
    /// terminated by exactly one `EndOfStream`.
    pub async fn fetch(&self, query: &SourceQuery) -> Result<Vec<StreamItem>> {
        let sql = query.augmented_sql()?;

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for source query")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("executing source query")?;

        block_to_stream(&block)
    }
}

/// Converts a result block into the machine's stream representation.
///
/// Rows after the first all-zero terminator are dropped: the ordering
/// contract puts the terminator last, so anything beyond it would mean the
/// contract was already broken.
fn block_to_stream<K: ColumnType>(block: &Block<K>) -> Result<Vec<StreamItem>> {
    let mut items = Vec::with_capacity(block.row_count() + 1);

    for row in block.rows() {
        let mut out = Row::new();
        for column in block.columns() {
            let name = column.name();
            let value = read_value(&row, name, column.sql_type())
                .with_context(|| format!("reading column {name}"))?;
            out.set(name, value);
        }
        if out.is_sentinel() {
            break;
        }
        items.push(StreamItem::Row(out));
    }

    items.push(StreamItem::EndOfStream);
    Ok(items)
}

/// Reads one cell, narrowing the warehouse's integer widths to the row
/// model's i64. Anything wider than integers and strings must be cast in
/// the source query.
fn read_value<K: ColumnType>(
    row: &clickhouse_rs::types::Row<'_, K>,
    name: &str,
    sql_type: SqlType,
) -> Result<Value> {
    let value = match sql_type {
        SqlType::Int8 => Value::Int(i64::from(row.get::<i8, _>(name)?)),
        SqlType::Int16 => Value::Int(i64::from(row.get::<i16, _>(name)?)),
        SqlType::Int32 => Value::Int(i64::from(row.get::<i32, _>(name)?)),
        SqlType::Int64 => Value::Int(row.get::<i64, _>(name)?),
        SqlType::UInt8 => Value::Int(i64::from(row.get::<u8, _>(name)?)),
        SqlType::UInt16 => Value::Int(i64::from(row.get::<u16, _>(name)?)),
        SqlType::UInt32 => Value::Int(i64::from(row.get::<u32, _>(name)?)),
        SqlType::UInt64 => Value::Int(row.get::<u64, _>(name)? as i64),
        SqlType::String | SqlType::FixedString(_) => Value::Str(row.get::<String, _>(name)?),
        SqlType::Nullable(inner) => match inner {
            SqlType::Int64 => row
                .get::<Option<i64>, _>(name)?
                .map_or(Value::Null, Value::Int),
            SqlType::Int32 => row
                .get::<Option<i32>, _>(name)?
                .map_or(Value::Null, |v| Value::Int(i64::from(v))),
            SqlType::UInt32 => row
                .get::<Option<u32>, _>(name)?
                .map_or(Value::Null, |v| Value::Int(i64::from(v))),
            SqlType::UInt64 => row
                .get::<Option<u64>, _>(name)?
                .map_or(Value::Null, |v| Value::Int(v as i64)),
            SqlType::String => row
                .get::<Option<String>, _>(name)?
                .map_or(Value::Null, Value::Str),
            other => bail!("unsupported nullable column type {other:?}"),
        },
        other => bail!("unsupported column type {other:?}"),
    };
    Ok(value)
}
