/*
    The physical plan handed to the executor. It is a DAG of procedure nodes: sources have no
    predecessors, terminal nodes (the roots) have no successors. The executor only needs to know a
    node's procedure kind to find a factory for it. Everything else about the procedure stays
    opaque behind the ProcedureSpec trait, so new operators don't have to touch this module.
 */

use std::{any::Any, collections::HashMap, fmt::{Debug, Display}, sync::Arc};

use petgraph::{algo::toposort, graph::{DiGraph, NodeIndex}, visit::EdgeRef, Direction};

use crate::{error::ExecError, types::Time};

use super::trigger::TriggerSpec;

pub const YIELD_KIND: &str = "yield";
pub const DEFAULT_YIELD_NAME: &str = "_result";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Arc<str>);

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(Arc::from(id))
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(Arc::from(id))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The procedure a plan node executes. Factories downcast through `as_any` to
/// their concrete spec.
pub trait ProcedureSpec: Send + Sync + Debug {
    fn kind(&self) -> &str;

    /// Set for yields, which don't execute anything but name a result.
    fn yield_name(&self) -> Option<&str> {
        None
    }

    /// Terminal nodes with side effects get a result named after the node.
    fn has_side_effect(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub struct YieldSpec {
    pub name: String,
}

impl YieldSpec {
    pub fn new(name: impl Into<String>) -> YieldSpec {
        YieldSpec { name: name.into() }
    }
}

impl ProcedureSpec for YieldSpec {
    fn kind(&self) -> &str {
        YIELD_KIND
    }

    fn yield_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// One frame of the script call stack that produced a plan node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEntry {
    pub function_name: String,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub start: Time,
    pub stop: Time,
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub id: NodeId,
    pub spec: Arc<dyn ProcedureSpec>,
    pub trigger_spec: Option<TriggerSpec>,
    /// Run this many copies of the node side by side.
    pub parallel_run: Option<usize>,
    /// Merge this many copies of the predecessor into one output.
    pub parallel_merge: Option<usize>,
    pub bounds: Option<Bounds>,
    pub call_stack: Vec<StackEntry>,
}

impl PlanNode {
    pub fn new(id: impl Into<NodeId>, spec: impl ProcedureSpec + 'static) -> PlanNode {
        PlanNode {
            id: id.into(),
            spec: Arc::new(spec),
            trigger_spec: None,
            parallel_run: None,
            parallel_merge: None,
            bounds: None,
            call_stack: Vec::new(),
        }
    }

    pub fn with_trigger_spec(mut self, spec: TriggerSpec) -> PlanNode {
        self.trigger_spec = Some(spec);
        self
    }

    pub fn with_parallel_run(mut self, factor: usize) -> PlanNode {
        self.parallel_run = Some(factor);
        self
    }

    pub fn with_parallel_merge(mut self, factor: usize) -> PlanNode {
        self.parallel_merge = Some(factor);
        self
    }

    pub fn with_bounds(mut self, start: Time, stop: Time) -> PlanNode {
        self.bounds = Some(Bounds { start, stop });
        self
    }

    pub fn with_call_stack(mut self, call_stack: Vec<StackEntry>) -> PlanNode {
        self.call_stack = call_stack;
        self
    }

    pub fn kind(&self) -> &str {
        self.spec.kind()
    }

    pub fn is_yield(&self) -> bool {
        self.spec.yield_name().is_some()
    }
}

/// Resource limits of one execution. Zero means "pick a default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub concurrency_quota: usize,
    pub memory_bytes_quota: u64,
}

#[derive(Debug, Default)]
pub struct PhysicalPlan {
    graph: DiGraph<PlanNode, usize>,
    index: HashMap<NodeId, NodeIndex>,
    pub resources: Resources,
    pub now: Time,
}

impl PhysicalPlan {
    pub fn new() -> PhysicalPlan {
        PhysicalPlan::default()
    }

    pub fn add_node(&mut self, node: PlanNode) -> Result<NodeId, ExecError> {
        let id = node.id.clone();
        if self.index.contains_key(&id) {
            return Err(ExecError::invalid(format!("duplicate plan node {}", id)));
        }
        let idx = self.graph.add_node(node);
        self.index.insert(id.clone(), idx);
        Ok(id)
    }

    /// Connects `from` as the next predecessor of `to`.
    pub fn add_edge(&mut self, from: &NodeId, to: &NodeId) -> Result<(), ExecError> {
        let (a, b) = (self.index_of(from)?, self.index_of(to)?);
        let seq = self.graph.edge_count();
        self.graph.add_edge(a, b, seq);
        Ok(())
    }

    fn index_of(&self, id: &NodeId) -> Result<NodeIndex, ExecError> {
        self.index.get(id).copied()
            .ok_or_else(|| ExecError::invalid(format!("unknown plan node {}", id)))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, id: &NodeId) -> Option<&PlanNode> {
        self.index.get(id).map(|idx| &self.graph[*idx])
    }

    /// Predecessors in the order their edges were added.
    pub fn predecessors(&self, id: &NodeId) -> Vec<&PlanNode> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn successors(&self, id: &NodeId) -> Vec<&PlanNode> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &NodeId, dir: Direction) -> Vec<&PlanNode> {
        let idx = match self.index.get(id) {
            Some(idx) => *idx,
            None => return Vec::new(),
        };
        let mut edges: Vec<_> = self.graph.edges_directed(idx, dir)
            .map(|e| {
                let other = if dir == Direction::Incoming { e.source() } else { e.target() };
                (*e.weight(), other)
            })
            .collect();
        edges.sort_by_key(|(seq, _)| *seq);
        edges.into_iter().map(|(_, n)| &self.graph[n]).collect()
    }

    /// Nodes without successors, in insertion order.
    pub fn roots(&self) -> Vec<&PlanNode> {
        self.graph.node_indices()
            .filter(|idx| self.graph.neighbors_directed(*idx, Direction::Outgoing).next().is_none())
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Walks from the sources to the roots, so every node comes after its predecessors.
    pub fn bottom_up(&self) -> Result<Vec<&PlanNode>, ExecError> {
        let order = toposort(&self.graph, None)
            .map_err(|cycle| ExecError::invalid(format!("plan has a cycle at node {}", self.graph[cycle.node_id()].id)))?;
        Ok(order.into_iter().map(|idx| &self.graph[idx]).collect())
    }

    pub fn top_down(&self) -> Result<Vec<&PlanNode>, ExecError> {
        let mut order = self.bottom_up()?;
        order.reverse();
        Ok(order)
    }

    /// Follows yields down to the node that actually produces their data.
    pub fn skip_yields<'a>(&'a self, mut node: &'a PlanNode) -> Result<&'a PlanNode, ExecError> {
        while node.is_yield() {
            node = self.predecessors(&node.id).into_iter().next()
                .ok_or_else(|| ExecError::invalid(format!("yield {} has no predecessor", node.id)))?;
        }
        Ok(node)
    }
}
