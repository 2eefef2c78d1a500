use std::fmt::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::export::health::HealthMetrics;
use crate::fsm::Record;
use crate::row::Value;

/// Sink consumes reconstructed interval records and commits them.
///
/// Destination tables use ReplacingMergeTree keyed by the interval's
/// natural key, so re-running a stage (or a late surrogate-key
/// correction) replaces the existing row instead of duplicating it.
pub trait IntervalSink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Write one batch of interval records.
    fn write_batch(
        &mut self,
        records: &[Record],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// ClickHouse batch sink for interval records.
///
/// Assembles one INSERT per batch; the column list comes from the records
/// themselves, which all share the machine's fixed output shape.
pub struct ClickHouseSink {
    pool: Pool,
    database: String,
    table: String,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseSink {
    pub fn new(
        pool: Pool,
        database: String,
        table: String,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            pool,
            database,
            table,
            health,
        }
    }

    /// Builds the INSERT statement for a non-empty batch.
    fn insert_sql(&self, records: &[Record]) -> String {
        let first = &records[0];
        let mut columns = String::with_capacity(first.len() * 16);
        for (idx, (name, _)) in first.columns().iter().enumerate() {
            if idx > 0 {
                columns.push_str(", ");
            }
            columns.push_str(name);
        }

        let mut sql = String::with_capacity(64 + columns.len() + records.len() * 64);
        let _ = write!(
            sql,
            "INSERT INTO {}.{} ({columns}) VALUES ",
            self.database, self.table
        );

        for (idx, record) in records.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            for (col, (_, value)) in record.columns().iter().enumerate() {
                if col > 0 {
                    sql.push_str(", ");
                }
                match value {
                    Value::Int(v) => {
                        let _ = write!(sql, "{v}");
                    }
                    Value::Str(s) => {
                        let _ = write!(sql, "'{}'", escape_sql(s));
                    }
                    Value::Null => sql.push_str("NULL"),
                }
            }
            sql.push(')');
        }

        sql
    }
}

impl IntervalSink for ClickHouseSink {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn write_batch(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let sql = self.insert_sql(records);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {} insert", self.table))?;

        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("sending {} batch", self.table))?;

        if let Some(health) = &self.health {
            health.sink_batch_size.observe(records.len() as f64);
        }

        tracing::debug!(table = %self.table, rows = records.len(), "flushed interval batch");

        Ok(())
    }
}

/// In-memory sink used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<Record>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

impl IntervalSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write_batch(&mut self, records: &[Record]) -> Result<()> {
        self.records.extend_from_slice(records);
        Ok(())
    }
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> ClickHouseSink {
        ClickHouseSink::new(
            Pool::new("tcp://localhost:9000/modw_cloud"),
            "modw_cloud".to_string(),
            "cloud_instance_runs".to_string(),
            None,
        )
    }

    fn record(instance: i64, start: i64, end: i64) -> Record {
        Record::new()
            .with("resource_id", Value::Int(8))
            .with("instance_id", Value::Int(instance))
            .with("start_time_ts", Value::Int(start))
            .with("end_time_ts", Value::Int(end))
    }

    #[test]
    fn test_insert_sql_single_record() {
        let sql = sink().insert_sql(&[record(5, 100, 300)]);
        assert_eq!(
            sql,
            "INSERT INTO modw_cloud.cloud_instance_runs \
             (resource_id, instance_id, start_time_ts, end_time_ts) VALUES \
             (8, 5, 100, 300)"
        );
    }

    #[test]
    fn test_insert_sql_batches_multiple_records() {
        let sql = sink().insert_sql(&[record(5, 100, 300), record(6, 400, 500)]);
        assert!(sql.ends_with("(8, 5, 100, 300), (8, 6, 400, 500)"));
    }

    #[test]
    fn test_insert_sql_strings_and_nulls() {
        let rec = Record::new()
            .with("instance_type", Value::Str("c1.m4's".into()))
            .with("description", Value::Null);
        let sql = sink().insert_sql(&[rec]);
        assert!(sql.ends_with("VALUES ('c1.m4\\'s', NULL)"));
    }

    #[test]
    fn test_escape_sql() {
        assert_eq!(escape_sql("hello"), "hello");
        assert_eq!(escape_sql("it's"), "it\\'s");
        assert_eq!(escape_sql("back\\slash"), "back\\\\slash");
    }

    #[tokio::test]
    async fn test_memory_sink_collects_batches() {
        let mut sink = MemorySink::new();
        sink.write_batch(&[record(5, 100, 300)]).await.unwrap();
        sink.write_batch(&[record(6, 400, 500)]).await.unwrap();
        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.records()[1].int("instance_id"), Some(6));
    }
}
