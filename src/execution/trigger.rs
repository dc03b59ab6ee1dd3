use crate::types::Time;

use super::group_key::GroupKey;

/// Trigger configuration attached to a plan node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSpec {
    Narrow,
    AfterWatermark { allowed_lateness: Time },
    AfterProcessingTime { duration: Time },
    AfterAtLeastCount { count: usize },
    Repeated { inner: Box<TriggerSpec> },
    OrFinally { main: Box<TriggerSpec>, finally: Box<TriggerSpec> },
}

impl Default for TriggerSpec {
    fn default() -> Self {
        TriggerSpec::AfterWatermark { allowed_lateness: 0 }
    }
}

/// What a trigger knows about the table it guards.
#[derive(Debug, Clone)]
pub struct TableContext {
    pub key: GroupKey,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub table: TableContext,
    pub watermark: Time,
    pub current_processing_time: Time,
}

/// Decides when the buffered data of one group key is emitted and when it is released.
#[derive(Debug, Clone)]
pub enum Trigger {
    Narrow,
    AfterWatermark { allowed_lateness: Time, finished: bool },
    AfterProcessingTime { duration: Time, target: Option<Time>, finished: bool },
    AfterAtLeastCount { count: usize, finished: bool },
    Repeatedly { inner: Box<Trigger> },
    OrFinally { main: Box<Trigger>, finally: Box<Trigger>, finished: bool },
}

impl Trigger {
    pub fn new(spec: &TriggerSpec) -> Trigger {
        match spec {
            TriggerSpec::Narrow => Trigger::Narrow,
            TriggerSpec::AfterWatermark { allowed_lateness } =>
                Trigger::AfterWatermark { allowed_lateness: *allowed_lateness, finished: false },
            TriggerSpec::AfterProcessingTime { duration } =>
                Trigger::AfterProcessingTime { duration: *duration, target: None, finished: false },
            TriggerSpec::AfterAtLeastCount { count } =>
                Trigger::AfterAtLeastCount { count: *count, finished: false },
            TriggerSpec::Repeated { inner } => Trigger::Repeatedly { inner: Box::new(Trigger::new(inner)) },
            TriggerSpec::OrFinally { main, finally } => Trigger::OrFinally {
                main: Box::new(Trigger::new(main)),
                finally: Box::new(Trigger::new(finally)),
                finished: false,
            },
        }
    }

    pub fn triggered(&mut self, ctx: &TriggerContext) -> bool {
        match self {
            Trigger::Narrow => true,
            Trigger::AfterWatermark { allowed_lateness, finished } => {
                // Keys without a time bound wait for the end of the stream.
                let stop = match ctx.table.key.stop() {
                    Some(stop) => stop,
                    None => return false,
                };
                if ctx.watermark >= stop.saturating_add(*allowed_lateness) {
                    *finished = true;
                }
                ctx.watermark >= stop
            },
            Trigger::AfterProcessingTime { duration, target, finished } => {
                let target = *target.get_or_insert(ctx.current_processing_time.saturating_add(*duration));
                if ctx.current_processing_time >= target {
                    *finished = true;
                    return true;
                }
                false
            },
            Trigger::AfterAtLeastCount { count, finished } => {
                if ctx.table.count >= *count {
                    *finished = true;
                    return true;
                }
                false
            },
            Trigger::Repeatedly { inner } => {
                let triggered = inner.triggered(ctx);
                if inner.finished() {
                    inner.reset();
                }
                triggered
            },
            Trigger::OrFinally { main, finally, finished } => {
                if finally.triggered(ctx) {
                    *finished = true;
                    return true;
                }
                main.triggered(ctx)
            },
        }
    }

    pub fn finished(&self) -> bool {
        match self {
            Trigger::Narrow => true,
            Trigger::AfterWatermark { finished, .. }
            | Trigger::AfterProcessingTime { finished, .. }
            | Trigger::AfterAtLeastCount { finished, .. }
            | Trigger::OrFinally { finished, .. } => *finished,
            Trigger::Repeatedly { .. } => false,
        }
    }

    pub fn reset(&mut self) {
        match self {
            Trigger::Narrow => {},
            Trigger::AfterWatermark { finished, .. } | Trigger::AfterAtLeastCount { finished, .. } => *finished = false,
            Trigger::AfterProcessingTime { target, finished, .. } => {
                *target = None;
                *finished = false;
            },
            Trigger::Repeatedly { inner } => inner.reset(),
            Trigger::OrFinally { main, finally, finished } => {
                main.reset();
                finally.reset();
                *finished = false;
            },
        }
    }
}
