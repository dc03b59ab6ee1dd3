use std::{any::Any, sync::Arc};

use tracing::debug;

use crate::{error::ExecError, memory::Allocator, types::{DataType, Time}};

use super::{
    context::ExecutionContext,
    dataset::{AccumulationMode, Dataset},
    group_key::{ColMeta, GroupKey},
    message::DatasetId,
    plan::ProcedureSpec,
    registry::{downcast_spec, Registry, Source},
    signal::CancellationToken,
    table::{Accumulator, Chunk, Column, Table, TableBuilderCache},
    transport::{NarrowTransformation, NarrowTransport, Transformation, TransformationAdapter, Transport, TransportDataset},
};

pub const VALUES_KIND: &str = "values";
pub const PASS_KIND: &str = "pass";
pub const COUNT_KIND: &str = "count";

pub fn register_builtins(registry: &mut Registry) -> Result<(), ExecError> {
    registry.register_source(VALUES_KIND, create_values_source)?;
    registry.register_transformation(PASS_KIND, create_pass_transformation)?;
    registry.register_transformation(COUNT_KIND, create_count_transformation)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ValuesTable {
    pub key: GroupKey,
    pub cols: Vec<ColMeta>,
    pub columns: Vec<Column>,
}

impl ValuesTable {
    /// A single int column named `label`.
    pub fn ints(key: GroupKey, label: &str, values: Vec<i64>) -> ValuesTable {
        ValuesTable {
            key,
            cols: vec![ColMeta::new(label, DataType::Int)],
            columns: vec![Column::Int(values.into_iter().map(Some).collect())],
        }
    }
}

/// Emits fixed tables. Copy `g` of `n` parallel copies emits every table whose
/// position modulo `n` is `g`.
#[derive(Debug, Clone, Default)]
pub struct ValuesSpec {
    pub tables: Vec<ValuesTable>,
    /// Sent after the last table.
    pub watermark: Option<Time>,
}

impl ProcedureSpec for ValuesSpec {
    fn kind(&self) -> &str {
        VALUES_KIND
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ValuesSource {
    tables: Vec<ValuesTable>,
    watermark: Option<Time>,
    d: TransportDataset,
    allocator: Arc<Allocator>,
    cancel: CancellationToken,
}

impl ValuesSource {
    fn emit(&self) -> Result<(), ExecError> {
        for table in &self.tables {
            self.cancel.check()?;
            let chunk = Chunk::new(table.key.clone(), table.cols.clone(), table.columns.clone(), &self.allocator)?;
            self.d.process(chunk)?;
            self.d.flush_key(table.key.clone())?;
        }
        if let Some(mark) = self.watermark {
            self.d.update_watermark(mark)?;
        }
        Ok(())
    }
}

impl Source for ValuesSource {
    fn run(&mut self) {
        let result = self.emit();
        if let Err(err) = &result {
            debug!(dataset = %self.d.id(), error = %err, "values source failed");
        }
        self.d.finish(result.err());
    }
}

fn create_values_source(spec: &dyn ProcedureSpec, id: DatasetId, ctx: &ExecutionContext) -> Result<Box<dyn Source>, ExecError> {
    let spec = downcast_spec::<ValuesSpec>(spec)?;
    let opts = ctx.parallel_opts;
    let tables = spec.tables.iter()
        .enumerate()
        .filter(|(i, _)| i % opts.factor.max(1) == opts.group)
        .map(|(_, t)| t.clone())
        .collect();
    Ok(Box::new(ValuesSource {
        tables,
        watermark: spec.watermark,
        d: TransportDataset::new(id, ctx.outputs.clone()),
        allocator: ctx.allocator.clone(),
        cancel: ctx.cancel.clone(),
    }))
}

#[derive(Debug, Clone, Default)]
pub struct PassSpec;

impl ProcedureSpec for PassSpec {
    fn kind(&self) -> &str {
        PASS_KIND
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Pass;

impl NarrowTransformation for Pass {
    fn process(&mut self, chunk: Chunk, d: &TransportDataset) -> Result<(), ExecError> {
        d.process(chunk)
    }
}

fn create_pass_transformation(spec: &dyn ProcedureSpec, id: DatasetId, ctx: &ExecutionContext) -> Result<Box<dyn Transport>, ExecError> {
    downcast_spec::<PassSpec>(spec)?;
    Ok(Box::new(NarrowTransport::new(Pass, TransportDataset::new(id, ctx.outputs.clone()))))
}

/// Counts the rows of every table. Output is one row per group key.
#[derive(Debug, Clone, Default)]
pub struct CountSpec;

impl ProcedureSpec for CountSpec {
    fn kind(&self) -> &str {
        COUNT_KIND
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CountAccumulator {
    key: GroupKey,
    count: i64,
    allocator: Arc<Allocator>,
}

impl Accumulator for CountAccumulator {
    fn table(&mut self) -> Result<Table, ExecError> {
        let cols = vec![ColMeta::new("_value", DataType::Int)];
        let chunk = Chunk::new(self.key.clone(), cols.clone(), vec![Column::Int(vec![Some(self.count)])], &self.allocator)?;
        Ok(Table::new(self.key.clone(), cols, vec![chunk]))
    }

    fn clear(&mut self) {
        self.count = 0;
    }

    fn row_count(&self) -> usize {
        self.count as usize
    }
}

struct Count {
    d: Dataset<CountAccumulator>,
}

impl Transformation for Count {
    fn retract_table(&mut self, _: &DatasetId, key: GroupKey) -> Result<(), ExecError> {
        self.d.retract_table(key)
    }

    fn process(&mut self, _: &DatasetId, table: Table) -> Result<(), ExecError> {
        self.d.table_builder(table.key()).count += table.len() as i64;
        Ok(())
    }

    fn update_watermark(&mut self, _: &DatasetId, time: Time) -> Result<(), ExecError> {
        self.d.update_watermark(time)
    }

    fn update_processing_time(&mut self, _: &DatasetId, time: Time) -> Result<(), ExecError> {
        self.d.update_processing_time(time)
    }

    fn finish(&mut self, _: &DatasetId, err: Option<ExecError>) {
        self.d.finish(err)
    }
}

fn create_count_transformation(spec: &dyn ProcedureSpec, id: DatasetId, ctx: &ExecutionContext) -> Result<Box<dyn Transport>, ExecError> {
    downcast_spec::<CountSpec>(spec)?;
    let allocator = ctx.allocator.clone();
    let cache = TableBuilderCache::new(move |key: &GroupKey| CountAccumulator {
        key: key.clone(),
        count: 0,
        allocator: allocator.clone(),
    });
    let mut d = Dataset::new(id, AccumulationMode::Discarding, cache, ctx.outputs.clone())
        .with_cancellation(ctx.cancel.clone());
    d.set_trigger_spec(ctx.trigger_spec.clone());
    Ok(Box::new(TransformationAdapter::new(Count { d })))
}
