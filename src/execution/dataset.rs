use tracing::debug;

use crate::{error::ExecError, types::Time};

use super::{group_key::GroupKey, message::DatasetId, signal::CancellationToken, table::{Accumulator, TableBuilderCache}, transport::TransformationSet, trigger::TriggerSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccumulationMode {
    /// Data for a key is dropped once its table was sent.
    #[default]
    Discarding,
    /// Data is kept and earlier tables are retracted. Not implemented.
    Accumulating,
}

/// The output side of a stateful operator.
///
/// Holds one accumulator and trigger per group key, and decides from the
/// watermark, the processing time and the end of the input when the accumulated
/// tables are sent downstream.
pub struct Dataset<A: Accumulator> {
    id: DatasetId,
    ts: TransformationSet,
    acc_mode: AccumulationMode,
    watermark: Time,
    processing_time: Time,
    cache: TableBuilderCache<A>,
    cancel: CancellationToken,
}

impl<A: Accumulator> Dataset<A> {
    pub fn new(id: DatasetId, acc_mode: AccumulationMode, cache: TableBuilderCache<A>, ts: TransformationSet) -> Dataset<A> {
        Dataset {
            id,
            ts,
            acc_mode,
            watermark: Time::MIN,
            processing_time: Time::MIN,
            cache,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop flushing tables once this token is cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Dataset<A> {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    /// Number of keys still holding a builder and a trigger.
    pub fn buffered_keys(&self) -> usize {
        self.cache.len()
    }

    pub fn set_trigger_spec(&mut self, spec: TriggerSpec) {
        self.cache.set_trigger_spec(spec);
    }

    /// The accumulator for a key, for the operator to add rows to.
    pub fn table_builder(&mut self, key: &GroupKey) -> &mut A {
        self.cache.table_builder(key)
    }

    pub fn update_watermark(&mut self, mark: Time) -> Result<(), ExecError> {
        self.watermark = mark;
        self.eval_triggers()?;
        self.ts.update_watermark(&self.id, mark)
    }

    pub fn update_processing_time(&mut self, time: Time) -> Result<(), ExecError> {
        self.processing_time = time;
        self.eval_triggers()?;
        self.ts.update_processing_time(&self.id, time)
    }

    pub fn retract_table(&mut self, key: GroupKey) -> Result<(), ExecError> {
        self.cache.discard_table(&key);
        self.ts.retract_table(&self.id, key)
    }

    /// Flushes every remaining key and finishes the downstreams. On error nothing is
    /// flushed, the error is passed on right away.
    pub fn finish(&mut self, err: Option<ExecError>) {
        let err = match err {
            Some(err) => Some(err),
            None => {
                let (id, ts, acc_mode, cancel) = (&self.id, &self.ts, self.acc_mode, &self.cancel);
                self.cache.range(|cache, key| {
                    cancel.check()?;
                    let result = trigger_table(cache, ts, id, acc_mode, key);
                    cache.expire_table(key);
                    result
                }).err()
            },
        };
        if let Some(err) = &err {
            debug!(dataset = %self.id, error = %err, "finishing dataset with error");
        }
        self.ts.finish(&self.id, err);
    }

    fn eval_triggers(&mut self) -> Result<(), ExecError> {
        let (id, ts, acc_mode, cancel) = (&self.id, &self.ts, self.acc_mode, &self.cancel);
        let (watermark, processing_time) = (self.watermark, self.processing_time);
        self.cache.range(|cache, key| {
            cancel.check()?;
            let (triggered, finished) = match cache.evaluate_trigger(key, watermark, processing_time) {
                Some(outcome) => outcome,
                None => return Ok(()),
            };
            if triggered {
                trigger_table(cache, ts, id, acc_mode, key)?;
            }
            if finished {
                cache.expire_table(key);
            }
            Ok(())
        })
    }
}

fn trigger_table<A: Accumulator>(cache: &mut TableBuilderCache<A>, ts: &TransformationSet, id: &DatasetId,
        acc_mode: AccumulationMode, key: &GroupKey) -> Result<(), ExecError> {
    let table = match cache.table(key)? {
        Some(table) => table,
        None => return Ok(()),
    };
    match acc_mode {
        AccumulationMode::Discarding => {
            ts.process(id, table)?;
            cache.discard_table(key);
            Ok(())
        },
        AccumulationMode::Accumulating => Err(ExecError::Unimplemented("accumulating mode".to_string())),
    }
}
