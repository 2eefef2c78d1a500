//! Stage orchestration.
//!
//! A stage is a straight line: augment the source query, fetch the ordered
//! stream, fold it through the stage's reconstruction machine, and batch
//! the emitted records into the sink. Stages run sequentially; ordering is
//! the machines' one correctness precondition, so nothing here buffers or
//! reorders rows.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::config::{Config, StageConfig, StageKind};
use crate::export::health::HealthMetrics;
use crate::export::WarehouseWriter;
use crate::fsm::generic::GenericReconstructor;
use crate::fsm::instance_type::InstanceTypeReconstructor;
use crate::fsm::resource_specs::ResourceSpecsReconstructor;
use crate::fsm::vm::VmReconstructor;
use crate::fsm::Reconstructor;
use crate::row::{FieldError, StreamItem};
use crate::sink::{ClickHouseSink, IntervalSink};
use crate::source::WarehouseSource;

/// Counters reported after a stage run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOutcome {
    pub rows_read: u64,
    pub intervals_emitted: u64,
}

/// Builds the reconstruction machine for a stage. The end override has
/// already been resolved against the top-level default.
pub fn build_reconstructor(
    stage: &StageConfig,
    end_time: Option<i64>,
) -> Result<Box<dyn Reconstructor>> {
    Ok(match stage.kind {
        StageKind::VmLifecycle => Box::new(VmReconstructor::new(end_time)),
        StageKind::ResourceSpecs => Box::new(ResourceSpecsReconstructor::new(end_time)),
        StageKind::InstanceType => Box::new(InstanceTypeReconstructor::new(end_time)),
        StageKind::StateReconstruction => {
            let fields = stage
                .fields
                .clone()
                .context("state_reconstruction stage missing fields")?;
            Box::new(GenericReconstructor::new(
                fields,
                stage.source.columns.clone(),
                end_time,
            )?)
        }
    })
}

/// Folds one ordered stream through a machine into a sink.
///
/// A row that violates the machine's field contract aborts the stage with
/// the offending row's rendered fields attached, so the upstream query can
/// be debugged from the error alone.
pub async fn run_stage<S: IntervalSink>(
    stage_name: &str,
    fsm: &mut dyn Reconstructor,
    stream: Vec<StreamItem>,
    sink: &mut S,
    batch_size: usize,
) -> Result<StageOutcome> {
    let mut outcome = StageOutcome::default();
    let mut batch: Vec<crate::fsm::Record> = Vec::with_capacity(batch_size);

    for item in stream {
        if matches!(item, StreamItem::Row(_)) {
            outcome.rows_read += 1;
        }

        let emitted = match fsm.process(&item) {
            Ok(emitted) => emitted,
            Err(err) => {
                // Rendered only here: the happy path pays nothing for it.
                let err = anyhow::Error::new(err);
                return Err(match &item {
                    StreamItem::Row(row) => err.context(format!("row {{{}}}", row.summary())),
                    StreamItem::EndOfStream => err,
                })
                .with_context(|| format!("stage {stage_name} ({})", fsm.name()));
            }
        };

        for record in emitted {
            outcome.intervals_emitted += 1;
            batch.push(record);
            if batch.len() >= batch_size {
                sink.write_batch(&batch).await?;
                batch.clear();
            }
        }
    }

    if !batch.is_empty() {
        sink.write_batch(&batch).await?;
    }

    Ok(outcome)
}

/// Runs every configured stage in declaration order, aborting on the
/// first failure. Nothing emitted by a failed stage's remaining rows
/// reaches the sink.
pub async fn run_all(
    cfg: &Config,
    writer: &WarehouseWriter,
    health: Option<Arc<HealthMetrics>>,
) -> Result<()> {
    let pool = writer.pool().context("warehouse writer not started")?;
    let source = WarehouseSource::new(pool.clone());

    for stage in &cfg.stages {
        let started = Instant::now();

        let result = run_one(cfg, &source, pool, stage, health.clone()).await;

        match result {
            Ok(outcome) => {
                let elapsed = started.elapsed();
                if let Some(health) = health.as_deref() {
                    health
                        .rows_read
                        .with_label_values(&[&stage.name])
                        .inc_by(outcome.rows_read as f64);
                    health
                        .intervals_emitted
                        .with_label_values(&[&stage.name])
                        .inc_by(outcome.intervals_emitted as f64);
                    health
                        .stage_duration
                        .with_label_values(&[&stage.name])
                        .observe(elapsed.as_secs_f64());
                }
                tracing::info!(
                    stage = %stage.name,
                    kind = stage.kind.as_str(),
                    rows = outcome.rows_read,
                    intervals = outcome.intervals_emitted,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "stage completed"
                );
            }
            Err(err) => {
                if let Some(health) = health.as_deref() {
                    let kind = if err.downcast_ref::<FieldError>().is_some() {
                        "precondition"
                    } else {
                        "io"
                    };
                    health
                        .stage_failures
                        .with_label_values(&[&stage.name, kind])
                        .inc();
                }
                return Err(err).with_context(|| format!("running stage {}", stage.name));
            }
        }
    }

    Ok(())
}

async fn run_one(
    cfg: &Config,
    source: &WarehouseSource,
    pool: &clickhouse_rs::Pool,
    stage: &StageConfig,
    health: Option<Arc<HealthMetrics>>,
) -> Result<StageOutcome> {
    let end_time = stage.resolved_end(cfg.end_date.as_deref());
    let mut fsm = build_reconstructor(stage, end_time)?;

    tracing::debug!(stage = %stage.name, end_time, "fetching source stream");
    let stream = source.fetch(&stage.source).await?;

    let mut sink = ClickHouseSink::new(
        pool.clone(),
        cfg.warehouse.database.clone(),
        stage.destination.clone(),
        health,
    );

    run_stage(
        &stage.name,
        fsm.as_mut(),
        stream,
        &mut sink,
        cfg.sink.batch_size,
    )
    .await
}
