use std::{collections::HashSet, sync::Arc};

use parking_lot::RwLock;

use crate::{error::ExecError, types::Time};

use super::{group_key::GroupKey, group_lookup::RandomAccessGroupLookup, message::{DatasetId, Message}, table::{BuilderCache, Chunk, Table}};

/// Receives the messages addressed to one operator.
///
/// Every path through `process_message` consumes the message, so its payload is
/// released no matter whether processing succeeded.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    fn process_message(&mut self, m: Message) -> Result<(), ExecError>;
}

/// Where a dataset sends its messages: a per-edge transport or a query result.
pub trait Downstream: Send + Sync {
    fn send(&self, m: Message) -> Result<(), ExecError>;
}

/// The downstreams of one dataset. Cloning shares the set, so the executor can
/// add downstreams after the operator owning the dataset was created.
#[derive(Clone, Default)]
pub struct TransformationSet {
    downstreams: Arc<RwLock<Vec<Arc<dyn Downstream>>>>,
}

impl TransformationSet {
    pub fn new() -> TransformationSet {
        TransformationSet::default()
    }

    pub fn add(&self, downstream: Arc<dyn Downstream>) {
        self.downstreams.write().push(downstream);
    }

    pub fn len(&self) -> usize {
        self.downstreams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn send(&self, m: Message) -> Result<(), ExecError> {
        let downstreams = self.downstreams.read();
        match downstreams.as_slice() {
            [] => {
                m.ack();
                Ok(())
            },
            [only] => only.send(m),
            many => {
                let result = many.iter().try_for_each(|d| d.send(m.dup()));
                m.ack();
                result
            },
        }
    }

    pub fn process(&self, src: &DatasetId, table: Table) -> Result<(), ExecError> {
        self.send(Message::Process { src: src.clone(), table })
    }

    pub fn retract_table(&self, src: &DatasetId, key: GroupKey) -> Result<(), ExecError> {
        self.send(Message::RetractTable { src: src.clone(), key })
    }

    pub fn update_watermark(&self, src: &DatasetId, time: Time) -> Result<(), ExecError> {
        self.send(Message::UpdateWatermark { src: src.clone(), time })
    }

    pub fn update_processing_time(&self, src: &DatasetId, time: Time) -> Result<(), ExecError> {
        self.send(Message::UpdateProcessingTime { src: src.clone(), time })
    }

    // Finishing can't be refused, a downstream that already stopped just drops it.
    pub fn finish(&self, src: &DatasetId, err: Option<ExecError>) {
        let _ = self.send(Message::Finish { src: src.clone(), err });
    }
}

/// The output of a chunk based operator.
#[derive(Clone)]
pub struct TransportDataset {
    id: DatasetId,
    ts: TransformationSet,
}

impl TransportDataset {
    pub fn new(id: DatasetId, ts: TransformationSet) -> TransportDataset {
        TransportDataset { id, ts }
    }

    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    pub fn process(&self, chunk: Chunk) -> Result<(), ExecError> {
        self.ts.send(Message::ProcessChunk { src: self.id.clone(), chunk })
    }

    pub fn flush_key(&self, key: GroupKey) -> Result<(), ExecError> {
        self.ts.send(Message::FlushKey { src: self.id.clone(), key })
    }

    pub fn retract_table(&self, key: GroupKey) -> Result<(), ExecError> {
        self.ts.retract_table(&self.id, key)
    }

    pub fn update_watermark(&self, time: Time) -> Result<(), ExecError> {
        self.ts.update_watermark(&self.id, time)
    }

    pub fn update_processing_time(&self, time: Time) -> Result<(), ExecError> {
        self.ts.update_processing_time(&self.id, time)
    }

    pub fn finish(&self, err: Option<ExecError>) {
        self.ts.finish(&self.id, err)
    }
}

/// One chunk in, any number of chunks out, with the group key unchanged.
pub trait NarrowTransformation: Send {
    fn process(&mut self, chunk: Chunk, d: &TransportDataset) -> Result<(), ExecError>;
}

pub struct NarrowTransport<T> {
    t: T,
    d: TransportDataset,
}

impl<T: NarrowTransformation> NarrowTransport<T> {
    pub fn new(t: T, d: TransportDataset) -> NarrowTransport<T> {
        NarrowTransport { t, d }
    }
}

impl<T: NarrowTransformation> Transport for NarrowTransport<T> {
    fn process_message(&mut self, m: Message) -> Result<(), ExecError> {
        match m {
            Message::ProcessChunk { chunk, .. } => self.t.process(chunk, &self.d),
            Message::Process { table, .. } => table.into_chunks().into_iter()
                .try_for_each(|chunk| self.t.process(chunk, &self.d)),
            // the key lifecycle below maps 1:1 onto ours
            Message::FlushKey { key, .. } => self.d.flush_key(key),
            Message::RetractTable { key, .. } => self.d.retract_table(key),
            Message::UpdateWatermark { time, .. } => self.d.update_watermark(time),
            Message::UpdateProcessingTime { time, .. } => self.d.update_processing_time(time),
            Message::Finish { err, .. } => {
                self.d.finish(err);
                Ok(())
            },
        }
    }
}

/// A narrow transformation that keeps state per group key across chunks.
pub trait NarrowStateTransformation: Send {
    type State: Send;

    /// Gets the state stored for the chunk's key, if any, and returns the state to
    /// store from now on. Returning `None` drops it.
    fn process(&mut self, chunk: Chunk, state: Option<Self::State>, d: &TransportDataset)
        -> Result<Option<Self::State>, ExecError>;
}

pub struct NarrowStateTransport<T: NarrowStateTransformation> {
    t: T,
    d: TransportDataset,
    states: RandomAccessGroupLookup<Option<T::State>>,
}

impl<T: NarrowStateTransformation> NarrowStateTransport<T> {
    pub fn new(t: T, d: TransportDataset) -> NarrowStateTransport<T> {
        NarrowStateTransport { t, d, states: RandomAccessGroupLookup::new() }
    }

    fn process_chunk(&mut self, chunk: Chunk) -> Result<(), ExecError> {
        let key = chunk.key().clone();
        let state = self.states.lookup_mut(&key).and_then(Option::take);
        match self.t.process(chunk, state, &self.d)? {
            Some(state) => self.states.set(key, Some(state)),
            None => {
                self.states.delete(&key);
            },
        }
        Ok(())
    }
}

impl<T: NarrowStateTransformation> Transport for NarrowStateTransport<T> {
    fn process_message(&mut self, m: Message) -> Result<(), ExecError> {
        match m {
            Message::ProcessChunk { chunk, .. } => self.process_chunk(chunk),
            Message::Process { table, .. } => table.into_chunks().into_iter()
                .try_for_each(|chunk| self.process_chunk(chunk)),
            Message::FlushKey { key, .. } => {
                self.d.flush_key(key.clone())?;
                // dropping the state releases whatever it holds
                self.states.delete(&key);
                Ok(())
            },
            Message::RetractTable { key, .. } => self.d.retract_table(key),
            Message::UpdateWatermark { time, .. } => self.d.update_watermark(time),
            Message::UpdateProcessingTime { time, .. } => self.d.update_processing_time(time),
            Message::Finish { err, .. } => {
                self.states.clear();
                self.d.finish(err);
                Ok(())
            },
        }
    }
}

/// A transformation that may produce output under a different group key than its input.
pub trait GroupTransformation: Send {
    fn process(&mut self, chunk: Chunk, d: &TransportDataset) -> Result<(), ExecError>;

    /// Called once when the input is finished.
    fn close(&mut self) -> Result<(), ExecError> {
        Ok(())
    }
}

pub struct GroupTransport<T> {
    t: T,
    d: TransportDataset,
}

impl<T: GroupTransformation> GroupTransport<T> {
    pub fn new(t: T, d: TransportDataset) -> GroupTransport<T> {
        GroupTransport { t, d }
    }
}

impl<T: GroupTransformation> Transport for GroupTransport<T> {
    fn process_message(&mut self, m: Message) -> Result<(), ExecError> {
        match m {
            Message::ProcessChunk { chunk, .. } => self.t.process(chunk, &self.d),
            Message::Process { table, .. } => table.into_chunks().into_iter()
                .try_for_each(|chunk| self.t.process(chunk, &self.d)),
            // Input keys don't correspond to output keys here.
            Message::FlushKey { .. } => Ok(()),
            Message::RetractTable { key, .. } => self.d.retract_table(key),
            Message::UpdateWatermark { time, .. } => self.d.update_watermark(time),
            Message::UpdateProcessingTime { time, .. } => self.d.update_processing_time(time),
            Message::Finish { err, .. } => {
                let close_err = self.t.close().err();
                self.d.finish(err.or(close_err));
                Ok(())
            },
        }
    }
}

/// Whole-table transformation interface used by dataset backed operators.
pub trait Transformation: Send {
    fn retract_table(&mut self, id: &DatasetId, key: GroupKey) -> Result<(), ExecError>;
    fn process(&mut self, id: &DatasetId, table: Table) -> Result<(), ExecError>;
    fn update_watermark(&mut self, id: &DatasetId, time: Time) -> Result<(), ExecError>;
    fn update_processing_time(&mut self, id: &DatasetId, time: Time) -> Result<(), ExecError>;
    fn finish(&mut self, id: &DatasetId, err: Option<ExecError>);
}

/// Feeds chunk messages into a [`Transformation`] by buffering them per key until
/// the key is flushed.
pub struct TransformationAdapter<T> {
    t: T,
    cache: BuilderCache,
}

impl<T: Transformation> TransformationAdapter<T> {
    pub fn new(t: T) -> TransformationAdapter<T> {
        TransformationAdapter { t, cache: BuilderCache::new() }
    }

    pub fn buffered_keys(&self) -> usize {
        self.cache.len()
    }
}

impl<T: Transformation> Transport for TransformationAdapter<T> {
    fn process_message(&mut self, m: Message) -> Result<(), ExecError> {
        match m {
            Message::RetractTable { src, key } => self.t.retract_table(&src, key),
            Message::Process { src, table } => self.t.process(&src, table),
            Message::UpdateWatermark { src, time } => self.t.update_watermark(&src, time),
            Message::UpdateProcessingTime { src, time } => self.t.update_processing_time(&src, time),
            Message::ProcessChunk { chunk, .. } => self.cache.append(chunk),
            Message::FlushKey { src, key } => match self.cache.take_table(&key)? {
                Some(table) => self.t.process(&src, table),
                None => Ok(()),
            },
            Message::Finish { src, err } => {
                // Buffers nobody flushed still belong to the output, unless we are failing.
                if err.is_none() {
                    for table in self.cache.take_all()? {
                        self.t.process(&src, table)?;
                    }
                } else {
                    self.cache.take_all()?;
                }
                self.t.finish(&src, err);
                Ok(())
            },
        }
    }
}

/// Sits in front of an operator with several parents. The operator sees a single
/// `Finish`: once every parent finished, or right away on the first error.
pub struct FinishBarrier {
    t: Box<dyn Transport>,
    pending: HashSet<DatasetId>,
    finished: bool,
}

impl FinishBarrier {
    pub fn new(t: Box<dyn Transport>, parents: impl IntoIterator<Item = DatasetId>) -> FinishBarrier {
        FinishBarrier { t, pending: parents.into_iter().collect(), finished: false }
    }
}

impl Transport for FinishBarrier {
    fn process_message(&mut self, m: Message) -> Result<(), ExecError> {
        if self.finished {
            m.ack();
            return Ok(());
        }
        match m {
            Message::Finish { src, err: Some(err) } => {
                self.finished = true;
                self.t.process_message(Message::Finish { src, err: Some(err) })
            },
            Message::Finish { src, err: None } => {
                self.pending.remove(&src);
                if !self.pending.is_empty() {
                    return Ok(());
                }
                self.finished = true;
                self.t.process_message(Message::Finish { src, err: None })
            },
            m => self.t.process_message(m),
        }
    }
}
