//! VM lifecycle interval reconstruction.
//!
//! Consumes raw lifecycle events ordered by (resource, instance) and time
//! and pairs each opening event with the next closing event for that
//! instance, producing one record per run cycle. Stop-like events open
//! intervals too: the span an instance spends stopped/suspended is tracked
//! as an inactive run, and a heartbeat arriving during such a span means
//! the instance restarted without a captured start event.

use crate::event::LifecycleEvent;
use crate::row::{FieldError, Row, StreamItem, Value};

use super::{end_of_day, Record, Reconstructor};

/// Typed view of a lifecycle source row.
struct VmRow {
    resource_id: i64,
    instance_id: i64,
    time: i64,
    code: i64,
    event: Option<LifecycleEvent>,
}

impl VmRow {
    fn parse(row: &Row) -> Result<Self, FieldError> {
        let code = row.int("event_type_id")?;
        Ok(Self {
            resource_id: row.int("resource_id")?,
            instance_id: row.int("instance_id")?,
            time: row.int("event_time_ts")?,
            code,
            event: LifecycleEvent::from_code(code),
        })
    }

    fn is_terminal(&self) -> bool {
        self.event.is_some_and(LifecycleEvent::is_terminal)
    }
}

/// The single open run cycle held between rows.
#[derive(Debug, Clone)]
struct OpenRun {
    resource_id: i64,
    instance_id: i64,
    start_time_ts: i64,
    start_event_id: i64,
    end_time_ts: i64,
    end_event_id: i64,
}

impl OpenRun {
    fn same_instance(&self, row: &VmRow) -> bool {
        self.resource_id == row.resource_id && self.instance_id == row.instance_id
    }

    fn close_at(&mut self, row: &VmRow) {
        self.end_time_ts = row.time;
        self.end_event_id = row.code;
    }

    fn into_record(self) -> Record {
        Record::new()
            .with("resource_id", Value::Int(self.resource_id))
            .with("instance_id", Value::Int(self.instance_id))
            .with("start_time_ts", Value::Int(self.start_time_ts))
            .with("start_event_id", Value::Int(self.start_event_id))
            .with("end_time_ts", Value::Int(self.end_time_ts))
            .with("end_event_id", Value::Int(self.end_event_id))
    }
}

/// Reconstructs discrete VM run cycles from ordered lifecycle events.
pub struct VmReconstructor {
    /// Configured end override for unterminated runs; None falls back to
    /// the end of the opening event's day.
    end_time: Option<i64>,
    open: Option<OpenRun>,
}

impl VmReconstructor {
    pub fn new(end_time: Option<i64>) -> Self {
        Self {
            end_time,
            open: None,
        }
    }

    fn open_run(&self, row: &VmRow) -> OpenRun {
        OpenRun {
            resource_id: row.resource_id,
            instance_id: row.instance_id,
            start_time_ts: row.time,
            start_event_id: row.code,
            end_time_ts: self.end_time.unwrap_or_else(|| end_of_day(row.time)),
            end_event_id: LifecycleEvent::Stop as i64,
        }
    }
}

impl Reconstructor for VmReconstructor {
    fn name(&self) -> &'static str {
        "vm_lifecycle"
    }

    fn process(&mut self, item: &StreamItem) -> Result<Vec<Record>, FieldError> {
        let raw = match item {
            StreamItem::EndOfStream => {
                return Ok(self.open.take().map(OpenRun::into_record).into_iter().collect());
            }
            StreamItem::Row(row) => row,
        };
        let row = VmRow::parse(raw)?;

        let Some(open) = self.open.as_mut() else {
            if row.event.is_some_and(LifecycleEvent::opens_interval) {
                self.open = Some(self.open_run(&row));
            }
            return Ok(Vec::new());
        };

        if !open.same_instance(&row) {
            let closed = self.open.take().expect("open run present").into_record();
            if !row.is_terminal() {
                self.open = Some(self.open_run(&row));
            }
            return Ok(vec![closed]);
        }

        let Some(event) = row.event else {
            return Ok(Vec::new());
        };

        if event.is_heartbeat() {
            open.close_at(&row);
            let started_inactive = LifecycleEvent::from_code(open.start_event_id)
                .is_some_and(LifecycleEvent::implies_inactive);
            if started_inactive {
                // The heartbeat proves the instance is running again, so the
                // inactive span ends here and a fresh run begins.
                let closed = self.open.take().expect("open run present").into_record();
                self.open = Some(self.open_run(&row));
                return Ok(vec![closed]);
            }
            return Ok(Vec::new());
        }

        if event.closes_interval() {
            open.close_at(&row);
            let closed = self.open.take().expect("open run present").into_record();
            if event.opens_interval() {
                self.open = Some(self.open_run(&row));
            }
            return Ok(vec![closed]);
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LifecycleEvent as Ev;

    fn row(resource: i64, instance: i64, code: i64, time: i64) -> StreamItem {
        StreamItem::Row(
            Row::new()
                .with("resource_id", Value::Int(resource))
                .with("instance_id", Value::Int(instance))
                .with("event_type_id", Value::Int(code))
                .with("event_time_ts", Value::Int(time)),
        )
    }

    fn drain(fsm: &mut VmReconstructor, items: Vec<StreamItem>) -> Vec<Record> {
        let mut out = Vec::new();
        for item in items {
            out.extend(fsm.process(&item).expect("well-formed row"));
        }
        out
    }

    #[test]
    fn test_start_report_stop_cycle() {
        let mut fsm = VmReconstructor::new(None);
        let out = drain(
            &mut fsm,
            vec![
                row(1, 5, Ev::Start as i64, 100),
                row(1, 5, Ev::StateReport as i64, 200),
                row(1, 5, Ev::Stop as i64, 300),
                StreamItem::EndOfStream,
            ],
        );

        // The run cycle, then the trailing stopped span flushed at end of
        // stream.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].int("start_time_ts"), Some(100));
        assert_eq!(out[0].int("start_event_id"), Some(Ev::Start as i64));
        assert_eq!(out[0].int("end_time_ts"), Some(300));
        assert_eq!(out[0].int("end_event_id"), Some(Ev::Stop as i64));

        assert_eq!(out[1].int("start_time_ts"), Some(300));
        assert_eq!(out[1].int("start_event_id"), Some(Ev::Stop as i64));
        assert_eq!(out[1].int("end_time_ts"), Some(end_of_day(300)));
    }

    #[test]
    fn test_heartbeat_extends_active_run() {
        let mut fsm = VmReconstructor::new(None);
        let out = drain(
            &mut fsm,
            vec![
                row(1, 5, Ev::Start as i64, 100),
                row(1, 5, Ev::StateReport as i64, 500),
                StreamItem::EndOfStream,
            ],
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].int("start_time_ts"), Some(100));
        assert_eq!(out[0].int("end_time_ts"), Some(500));
        assert_eq!(out[0].int("end_event_id"), Some(Ev::StateReport as i64));
    }

    #[test]
    fn test_heartbeat_during_inactive_span_reopens() {
        let mut fsm = VmReconstructor::new(None);
        let out = drain(
            &mut fsm,
            vec![
                row(1, 5, Ev::Stop as i64, 100),
                row(1, 5, Ev::StateReport as i64, 200),
                StreamItem::EndOfStream,
            ],
        );

        assert_eq!(out.len(), 2);
        // The stopped span ends at the heartbeat.
        assert_eq!(out[0].int("start_time_ts"), Some(100));
        assert_eq!(out[0].int("start_event_id"), Some(Ev::Stop as i64));
        assert_eq!(out[0].int("end_time_ts"), Some(200));
        // And the fresh run starts from the heartbeat row.
        assert_eq!(out[1].int("start_time_ts"), Some(200));
        assert_eq!(out[1].int("start_event_id"), Some(Ev::StateReport as i64));
    }

    #[test]
    fn test_terminal_event_cannot_open() {
        let mut fsm = VmReconstructor::new(None);
        let out = drain(
            &mut fsm,
            vec![
                row(1, 5, Ev::Terminate as i64, 100),
                StreamItem::EndOfStream,
            ],
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_terminate_closes_without_reopening() {
        let mut fsm = VmReconstructor::new(None);
        let out = drain(
            &mut fsm,
            vec![
                row(1, 5, Ev::Start as i64, 100),
                row(1, 5, Ev::Terminate as i64, 400),
                StreamItem::EndOfStream,
            ],
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].int("end_time_ts"), Some(400));
        assert_eq!(out[0].int("end_event_id"), Some(Ev::Terminate as i64));
    }

    #[test]
    fn test_instance_change_closes_previous() {
        let mut fsm = VmReconstructor::new(Some(10_000));
        let out = drain(
            &mut fsm,
            vec![
                row(1, 5, Ev::Start as i64, 100),
                row(1, 6, Ev::Start as i64, 250),
                StreamItem::EndOfStream,
            ],
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].int("instance_id"), Some(5));
        // No closing event was seen: the configured end applies.
        assert_eq!(out[0].int("end_time_ts"), Some(10_000));
        assert_eq!(out[1].int("instance_id"), Some(6));
        assert_eq!(out[1].int("start_time_ts"), Some(250));
    }

    #[test]
    fn test_flush_without_sentinel_loses_last_run() {
        // Regression guard for the ordering contract: without the final
        // flush the last open run is never emitted.
        let stream = vec![
            row(1, 5, Ev::Start as i64, 100),
            row(1, 5, Ev::Stop as i64, 300),
        ];

        let mut with_flush = VmReconstructor::new(None);
        let mut flushed = drain(&mut with_flush, stream.clone());
        flushed.extend(with_flush.process(&StreamItem::EndOfStream).unwrap());

        let mut without_flush = VmReconstructor::new(None);
        let unflushed = drain(&mut without_flush, stream);

        assert_eq!(flushed.len(), unflushed.len() + 1);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut fsm = VmReconstructor::new(None);
        fsm.process(&row(1, 5, Ev::Start as i64, 100)).unwrap();
        assert_eq!(fsm.process(&StreamItem::EndOfStream).unwrap().len(), 1);
        assert!(fsm.process(&StreamItem::EndOfStream).unwrap().is_empty());
    }

    #[test]
    fn test_missing_field_is_precondition_violation() {
        let mut fsm = VmReconstructor::new(None);
        let bad = StreamItem::Row(
            Row::new()
                .with("resource_id", Value::Int(1))
                .with("event_type_id", Value::Int(2)),
        );
        let err = fsm.process(&bad).unwrap_err();
        assert_eq!(err, FieldError::Missing("instance_id".into()));
    }
}
