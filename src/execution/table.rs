use std::sync::Arc;

use crate::{error::ExecError, memory::{Allocator, Reservation}, types::{DataType, Time, Value}};

use super::{group_key::{ColMeta, GroupKey}, group_lookup::GroupLookup, trigger::{TableContext, Trigger, TriggerContext, TriggerSpec}};

/// A typed column. One variant per element type, nulls are `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Bool(Vec<Option<bool>>),
    Int(Vec<Option<i64>>),
    UInt(Vec<Option<u64>>),
    Float(Vec<Option<f64>>),
    String(Vec<Option<String>>),
    Time(Vec<Option<Time>>),
}

impl Column {
    pub fn new(data_type: DataType) -> Column {
        match data_type {
            DataType::Bool => Column::Bool(Vec::new()),
            DataType::Int => Column::Int(Vec::new()),
            DataType::UInt => Column::UInt(Vec::new()),
            DataType::Float => Column::Float(Vec::new()),
            DataType::String => Column::String(Vec::new()),
            DataType::Time => Column::Time(Vec::new()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Column::Bool(_) => DataType::Bool,
            Column::Int(_) => DataType::Int,
            Column::UInt(_) => DataType::UInt,
            Column::Float(_) => DataType::Float,
            Column::String(_) => DataType::String,
            Column::Time(_) => DataType::Time,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Bool(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::UInt(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::String(v) => v.len(),
            Column::Time(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self, row: usize) -> Value {
        fn get<T: Clone>(v: &[Option<T>], row: usize, f: impl FnOnce(T) -> Value) -> Value {
            v.get(row).cloned().flatten().map(f).unwrap_or(Value::Null)
        }
        match self {
            Column::Bool(v) => get(v, row, Value::Bool),
            Column::Int(v) => get(v, row, Value::Int),
            Column::UInt(v) => get(v, row, Value::UInt),
            Column::Float(v) => get(v, row, Value::Float),
            Column::String(v) => get(v, row, Value::String),
            Column::Time(v) => get(v, row, Value::Time),
        }
    }

    /// Appends a value of the column's type or a null.
    pub fn push(&mut self, value: Value) -> Result<(), ExecError> {
        match (self, value) {
            (Column::Bool(v), Value::Null) => v.push(None),
            (Column::Int(v), Value::Null) => v.push(None),
            (Column::UInt(v), Value::Null) => v.push(None),
            (Column::Float(v), Value::Null) => v.push(None),
            (Column::String(v), Value::Null) => v.push(None),
            (Column::Time(v), Value::Null) => v.push(None),
            (Column::Bool(v), Value::Bool(b)) => v.push(Some(b)),
            (Column::Int(v), Value::Int(i)) => v.push(Some(i)),
            (Column::UInt(v), Value::UInt(u)) => v.push(Some(u)),
            (Column::Float(v), Value::Float(f)) => v.push(Some(f)),
            (Column::String(v), Value::String(s)) => v.push(Some(s)),
            (Column::Time(v), Value::Time(t)) => v.push(Some(t)),
            (col, value) => return Err(ExecError::internal(format!(
                "cannot append {} value to a {} column", value.data_type().map(|t| t.to_string()).unwrap_or_default(), col.data_type()))),
        }
        Ok(())
    }

    pub fn extend_from(&mut self, other: &Column) -> Result<(), ExecError> {
        match (self, other) {
            (Column::Bool(a), Column::Bool(b)) => a.extend_from_slice(b),
            (Column::Int(a), Column::Int(b)) => a.extend_from_slice(b),
            (Column::UInt(a), Column::UInt(b)) => a.extend_from_slice(b),
            (Column::Float(a), Column::Float(b)) => a.extend_from_slice(b),
            (Column::String(a), Column::String(b)) => a.extend_from_slice(b),
            (Column::Time(a), Column::Time(b)) => a.extend_from_slice(b),
            (a, b) => return Err(ExecError::internal(format!(
                "cannot append {} column to a {} column", b.data_type(), a.data_type()))),
        }
        Ok(())
    }

    // Rough size used for memory accounting: value bytes plus one null byte per row.
    pub fn byte_size(&self) -> u64 {
        let fixed = |n: usize, width: usize| (n * (width + 1)) as u64;
        match self {
            Column::Bool(v) => fixed(v.len(), 1),
            Column::Int(v) => fixed(v.len(), 8),
            Column::UInt(v) => fixed(v.len(), 8),
            Column::Float(v) => fixed(v.len(), 8),
            Column::Time(v) => fixed(v.len(), 8),
            Column::String(v) => v.iter().map(|s| s.as_ref().map(|s| s.len()).unwrap_or(0) as u64 + 1).sum(),
        }
    }
}

#[derive(Debug)]
struct ChunkInner {
    key: GroupKey,
    cols: Vec<ColMeta>,
    columns: Vec<Column>,
    len: usize,
    reservation: Reservation,
}

/// An immutable, reference counted slice of a table.
///
/// Cloning retains the chunk, dropping releases it. The memory reserved for the
/// column data goes back to the allocator when the last reference is gone.
#[derive(Debug, Clone)]
pub struct Chunk(Arc<ChunkInner>);

impl Chunk {
    pub fn new(key: GroupKey, cols: Vec<ColMeta>, columns: Vec<Column>, allocator: &Arc<Allocator>) -> Result<Chunk, ExecError> {
        if cols.len() != columns.len() {
            return Err(ExecError::internal(format!(
                "chunk has {} column descriptions but {} columns", cols.len(), columns.len())));
        }
        let len = columns.first().map(|c| c.len()).unwrap_or(0);
        for (meta, col) in cols.iter().zip(columns.iter()) {
            if col.len() != len {
                return Err(ExecError::internal(format!(
                    "column {} has {} rows, expected {}", meta.label, col.len(), len)));
            }
            if col.data_type() != meta.data_type {
                return Err(ExecError::internal(format!(
                    "column {} is declared as {} but holds {} values", meta.label, meta.data_type, col.data_type())));
            }
        }
        let bytes = columns.iter().map(|c| c.byte_size()).sum();
        let reservation = allocator.reserve(bytes)?;
        Ok(Chunk(Arc::new(ChunkInner { key, cols, columns, len, reservation })))
    }

    pub fn key(&self) -> &GroupKey {
        &self.0.key
    }

    pub fn cols(&self) -> &[ColMeta] {
        &self.0.cols
    }

    pub fn columns(&self) -> &[Column] {
        &self.0.columns
    }

    pub fn col(&self, idx: usize) -> &Column {
        &self.0.columns[idx]
    }

    pub fn col_index(&self, label: &str) -> Option<usize> {
        self.0.cols.iter().position(|c| c.label == label)
    }

    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    pub fn byte_size(&self) -> u64 {
        self.0.reservation.bytes()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// A whole table for one group key, made of zero or more chunks that share a schema.
#[derive(Debug, Clone)]
pub struct Table {
    key: GroupKey,
    cols: Vec<ColMeta>,
    chunks: Vec<Chunk>,
}

impl Table {
    pub fn new(key: GroupKey, cols: Vec<ColMeta>, chunks: Vec<Chunk>) -> Table {
        Table { key, cols, chunks }
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values of one column across all chunks.
    pub fn column_values(&self, label: &str) -> Vec<Value> {
        self.chunks.iter()
            .filter_map(|chunk| chunk.col_index(label).map(|idx| (chunk, idx)))
            .flat_map(|(chunk, idx)| (0..chunk.len()).map(move |row| chunk.col(idx).value(row)))
            .collect()
    }
}

/// Per-key state of a stateful operator that can be turned into a table.
pub trait Accumulator: Send {
    fn table(&mut self) -> Result<Table, ExecError>;
    fn clear(&mut self);
    fn row_count(&self) -> usize;
}

/// Accumulator that keeps the chunks it is given.
#[derive(Debug)]
pub struct BufferedBuilder {
    key: GroupKey,
    cols: Vec<ColMeta>,
    chunks: Vec<Chunk>,
}

impl BufferedBuilder {
    pub fn new(key: GroupKey) -> BufferedBuilder {
        BufferedBuilder { key, cols: Vec::new(), chunks: Vec::new() }
    }

    pub fn append_chunk(&mut self, chunk: Chunk) -> Result<(), ExecError> {
        if self.chunks.is_empty() {
            self.cols = chunk.cols().to_vec();
        } else if self.cols != chunk.cols() {
            return Err(ExecError::internal(format!("schema collision for table {}", self.key)));
        }
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
        Ok(())
    }
}

impl Accumulator for BufferedBuilder {
    fn table(&mut self) -> Result<Table, ExecError> {
        Ok(Table::new(self.key.clone(), self.cols.clone(), self.chunks.clone()))
    }

    fn clear(&mut self) {
        self.chunks.clear();
    }

    fn row_count(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

/// Buffered builders keyed by group key.
#[derive(Debug, Default)]
pub struct BuilderCache {
    builders: GroupLookup<BufferedBuilder>,
}

impl BuilderCache {
    pub fn new() -> BuilderCache {
        BuilderCache::default()
    }

    pub fn append(&mut self, chunk: Chunk) -> Result<(), ExecError> {
        let key = chunk.key().clone();
        self.builders.lookup_or_create(&key, || BufferedBuilder::new(key.clone())).append_chunk(chunk)
    }

    /// Takes the buffered table for the key out of the cache.
    pub fn take_table(&mut self, key: &GroupKey) -> Result<Option<Table>, ExecError> {
        match self.builders.delete(key) {
            Some(mut builder) => builder.table().map(Some),
            None => Ok(None),
        }
    }

    /// Takes every buffered table, in key order.
    pub fn take_all(&mut self) -> Result<Vec<Table>, ExecError> {
        self.builders.drain().map(|(_, mut b)| b.table()).collect()
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

struct TableState<A> {
    builder: A,
    trigger: Trigger,
}

/// The data cache of a [`Dataset`](super::dataset::Dataset): one accumulator and
/// one trigger per group key.
pub struct TableBuilderCache<A: Accumulator> {
    tables: GroupLookup<TableState<A>>,
    trigger_spec: TriggerSpec,
    new_builder: Box<dyn Fn(&GroupKey) -> A + Send>,
}

impl<A: Accumulator> TableBuilderCache<A> {
    pub fn new(new_builder: impl Fn(&GroupKey) -> A + Send + 'static) -> TableBuilderCache<A> {
        TableBuilderCache {
            tables: GroupLookup::new(),
            trigger_spec: TriggerSpec::default(),
            new_builder: Box::new(new_builder),
        }
    }

    pub fn set_trigger_spec(&mut self, spec: TriggerSpec) {
        self.trigger_spec = spec;
    }

    /// The accumulator for the key, created along with a fresh trigger if it is missing.
    pub fn table_builder(&mut self, key: &GroupKey) -> &mut A {
        let (spec, new_builder) = (&self.trigger_spec, &self.new_builder);
        &mut self.tables.lookup_or_create(key, || TableState {
            builder: new_builder(key),
            trigger: Trigger::new(spec),
        }).builder
    }

    pub fn table(&mut self, key: &GroupKey) -> Result<Option<Table>, ExecError> {
        match self.tables.lookup_mut(key) {
            Some(state) => state.builder.table().map(Some),
            None => Ok(None),
        }
    }

    /// Drops the accumulated data but keeps the key and its trigger.
    pub fn discard_table(&mut self, key: &GroupKey) {
        if let Some(state) = self.tables.lookup_mut(key) {
            state.builder.clear();
        }
    }

    /// Releases everything held for the key.
    pub fn expire_table(&mut self, key: &GroupKey) {
        self.tables.delete(key);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Returns (triggered, finished) for the key, None if it is unknown.
    pub fn evaluate_trigger(&mut self, key: &GroupKey, watermark: Time, processing_time: Time) -> Option<(bool, bool)> {
        let state = self.tables.lookup_mut(key)?;
        let ctx = TriggerContext {
            table: TableContext { key: key.clone(), count: state.builder.row_count() },
            watermark,
            current_processing_time: processing_time,
        };
        let triggered = state.trigger.triggered(&ctx);
        Some((triggered, state.trigger.finished()))
    }

    /// Calls `f` for every key in ascending order. `f` may discard or expire any key.
    pub fn range<E>(&mut self, mut f: impl FnMut(&mut Self, &GroupKey) -> Result<(), E>) -> Result<(), E> {
        self.tables.begin_range();
        let mut result = Ok(());
        while let Some(key) = self.tables.range_next() {
            if let Err(e) = f(self, &key) {
                result = Err(e);
                break;
            }
        }
        self.tables.end_range();
        result
    }
}
