use std::{collections::{BTreeMap, HashMap, HashSet}, panic::{catch_unwind, AssertUnwindSafe}, sync::Arc, thread::{self, JoinHandle}, time::Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

use crate::{config::ExecConfig, error::{from_panic, ExecError}, memory::Allocator};

use super::{
    consecutive_transport::{ConsecutiveTransport, TransportProfile},
    context::{ExecutionContext, ParallelOpts},
    dispatcher::{Dispatcher, PoolDispatcher},
    message::DatasetId,
    plan::{NodeId, PhysicalPlan, PlanNode, Resources, DEFAULT_YIELD_NAME},
    registry::{Registry, Source},
    result::QueryResult,
    signal::{CancellationToken, Notify},
    transport::{FinishBarrier, TransformationSet, Transport},
};

/// What an execution reports once everything stopped.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    /// Sources first, then one entry per transport.
    pub profiles: Vec<TransportProfile>,
    pub concurrency_quota: usize,
    pub memory_quota: Option<u64>,
    pub max_allocated: u64,
}

/// Turns physical plans into running executions.
pub struct Executor {
    config: ExecConfig,
    registry: Arc<Registry>,
}

impl Executor {
    pub fn new(config: ExecConfig, registry: Registry) -> Executor {
        Executor { config, registry: Arc::new(registry) }
    }

    /// Builds the execution graph for the plan and starts it. The returned handle
    /// holds one result stream per result name.
    pub fn execute(&self, plan: &PhysicalPlan, cancel: CancellationToken) -> Result<Execution, ExecError> {
        let state = ExecutionState::new(plan, &self.config, &self.registry, cancel)?;
        Ok(state.run())
    }
}

struct SourceNode {
    source: Box<dyn Source>,
    node_type: String,
    label: String,
}

struct ExecutionState {
    cancel: CancellationToken,
    allocator: Arc<Allocator>,
    resources: Resources,
    results: BTreeMap<String, QueryResult>,
    sources: Vec<SourceNode>,
    transports: Vec<Arc<ConsecutiveTransport>>,
    dispatcher: PoolDispatcher,
}

impl ExecutionState {
    fn new(plan: &PhysicalPlan, config: &ExecConfig, registry: &Registry, cancel: CancellationToken) -> Result<ExecutionState, ExecError> {
        let resources = choose_default_resources(plan, config)?;
        let memory_quota = match resources.memory_bytes_quota {
            u64::MAX => None,
            quota => Some(quota),
        };
        let mut state = ExecutionState {
            cancel,
            allocator: Allocator::new(memory_quota),
            resources,
            results: BTreeMap::new(),
            sources: Vec::new(),
            transports: Vec::new(),
            dispatcher: PoolDispatcher::new(config.dispatcher_throughput),
        };
        let mut builder = GraphBuilder {
            plan,
            config,
            registry,
            dispatcher: Arc::new(state.dispatcher.clone()),
            outputs: HashMap::new(),
        };
        for node in plan.bottom_up()? {
            builder.visit(&mut state, node)?;
        }
        state.validate()?;
        info!(concurrency_quota = state.resources.concurrency_quota, memory_quota = ?memory_quota,
            sources = state.sources.len(), transports = state.transports.len(), "created execution state");
        Ok(state)
    }

    fn validate(&self) -> Result<(), ExecError> {
        if self.resources.concurrency_quota == 0 {
            return Err(ExecError::invalid("execution state must have a non-zero concurrency quota"));
        }
        Ok(())
    }

    fn run(self) -> Execution {
        let results = self.results.clone();
        let cancel = self.cancel.clone();
        let aborter = Aborter {
            results: self.results.values().cloned().collect(),
            cancel: self.cancel.clone(),
            first_err: Arc::new(Mutex::new(None)),
        };
        let first_err = aborter.first_err.clone();
        let handle = {
            let aborter = aborter.clone();
            thread::Builder::new()
                .name("oxid-flow-supervisor".to_string())
                .spawn(move || self.supervise(aborter))
        };
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                aborter.abort(ExecError::internal(format!("failed to start supervisor: {}", e)));
                None
            },
        };
        Execution { results, cancel, handle, first_err }
    }

    fn supervise(self, aborter: Aborter) -> Statistics {
        let ExecutionState { cancel, allocator, resources, results, sources, transports, dispatcher } = self;

        let source_profiles = Arc::new(Mutex::new(Vec::new()));
        let mut source_threads: Vec<JoinHandle<()>> = Vec::new();
        for SourceNode { mut source, node_type, label } in sources {
            let (thread_aborter, profiles) = (aborter.clone(), source_profiles.clone());
            let thread_label = label.clone();
            let spawned = thread::Builder::new()
                .name(format!("oxid-flow-source-{}", thread_label))
                .spawn(move || {
                    let span = info_span!("source", op = %node_type, label = %label);
                    let _enter = span.enter();
                    let mut profile = TransportProfile::new(node_type, label);
                    let start = Instant::now();
                    match catch_unwind(AssertUnwindSafe(|| source.run())) {
                        Ok(()) => {
                            profile.record(start.elapsed());
                            profiles.lock().push(profile);
                        },
                        Err(payload) => {
                            let err = from_panic(payload);
                            error!(error = %err, stack = err.stack().unwrap_or_default(), "source panicked");
                            thread_aborter.abort(err);
                        },
                    }
                });
            match spawned {
                Ok(handle) => source_threads.push(handle),
                Err(e) => aborter.abort(ExecError::internal(format!("failed to start source {}: {}", thread_label, e))),
            }
        }

        if let Err(err) = dispatcher.start(resources.concurrency_quota, &cancel) {
            aborter.abort(err);
        }

        // Everything the supervisor waits for bumps the same counter.
        let notify = Notify::new();
        for t in &transports {
            let notify = notify.clone();
            t.finished().on_fire(move || notify.notify());
        }
        {
            let notify = notify.clone();
            cancel.on_cancel(move || notify.notify());
        }
        {
            let notify = notify.clone();
            dispatcher.err_latch().on_fire(move || notify.notify());
        }

        let mut seen = notify.generation();
        'transports: for t in &transports {
            loop {
                if t.finished().is_fired() {
                    if let Some(err) = t.err() {
                        aborter.abort(err);
                    }
                    break;
                }
                if cancel.is_cancelled() {
                    aborter.abort(ExecError::Cancelled);
                    break 'transports;
                }
                if let Some(err) = dispatcher.err() {
                    aborter.abort(err);
                    break 'transports;
                }
                seen = notify.wait_for(seen);
            }
        }

        if let Err(err) = dispatcher.stop() {
            aborter.abort(err);
        }
        for handle in source_threads {
            // panics are caught inside the thread
            let _ = handle.join();
        }
        for t in transports.iter().filter(|t| !t.finished().is_fired()) {
            t.abandon();
        }
        // Failures that only travelled as Finish messages end up in the results.
        if let Some(err) = results.values().find_map(|r| r.err()) {
            aborter.abort(err);
        }

        let mut profiles = std::mem::take(&mut *source_profiles.lock());
        profiles.extend(transports.iter().map(|t| t.profile()));
        debug!(max_allocated = allocator.max_allocated(), "execution finished");
        Statistics {
            profiles,
            concurrency_quota: resources.concurrency_quota,
            memory_quota: allocator.limit(),
            max_allocated: allocator.max_allocated(),
        }
    }
}

/// Ends an execution with its first error.
#[derive(Clone)]
struct Aborter {
    results: Vec<QueryResult>,
    cancel: CancellationToken,
    first_err: Arc<Mutex<Option<ExecError>>>,
}

impl Aborter {
    fn abort(&self, err: ExecError) {
        let err = {
            let mut first = self.first_err.lock();
            if first.is_none() {
                warn!(error = %err, "aborting execution");
            }
            first.get_or_insert(err).clone()
        };
        for r in &self.results {
            r.abort(err.clone());
        }
        self.cancel.cancel();
    }
}

struct GraphBuilder<'a> {
    plan: &'a PhysicalPlan,
    config: &'a ExecConfig,
    registry: &'a Registry,
    dispatcher: Arc<dyn Dispatcher>,
    // the output of every copy of every node built so far
    outputs: HashMap<NodeId, Vec<TransformationSet>>,
}

impl<'a> GraphBuilder<'a> {
    fn visit(&mut self, state: &mut ExecutionState, node: &'a PlanNode) -> Result<(), ExecError> {
        // Yields don't run, they only name the result of the node below them.
        if let Some(name) = node.spec.yield_name() {
            return self.generate_result(state, name, node);
        }

        let copies = node.parallel_run.unwrap_or(1).max(1);
        let (is_parallel_merge, pred_copies) = match node.parallel_merge {
            Some(factor) => (true, factor.max(1)),
            None => (false, 1),
        };
        let preds = self.plan.predecessors(&node.id).into_iter()
            .map(|p| self.plan.skip_yields(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut outputs = Vec::with_capacity(copies);
        for i in 0..copies {
            let mut ctx = ExecutionContext::new(state.allocator.clone(), state.cancel.clone());
            ctx.now = self.plan.now;
            ctx.parents = preds.iter()
                .flat_map(|p| (0..pred_copies).map(move |j| DatasetId::new(p.id.clone(), i + j)))
                .collect();
            ctx.trigger_spec = node.trigger_spec.clone().unwrap_or_default();
            ctx.parallel_opts = ParallelOpts { group: i, factor: copies };
            ctx.bounds = node.bounds;
            ctx.label = node.id.to_string();
            let id = DatasetId::new(node.id.clone(), i);

            if preds.is_empty() {
                let factory = self.registry.source(node.kind())
                    .ok_or_else(|| ExecError::invalid(format!("unsupported source kind {}", node.kind())))?;
                let source = factory(node.spec.as_ref(), id, &ctx)?;
                state.sources.push(SourceNode { source, node_type: node.kind().to_string(), label: node.id.to_string() });
            } else {
                let factory = self.registry.transformation(node.kind())
                    .ok_or_else(|| ExecError::invalid(format!("unsupported procedure {}", node.kind())))?;
                let mut t: Box<dyn Transport> = factory(node.spec.as_ref(), id, &ctx)?;
                if ctx.parents.len() > 1 {
                    t = Box::new(FinishBarrier::new(t, ctx.parents.iter().cloned()));
                }
                let t = Arc::new(Mutex::new(t));
                for p in &preds {
                    for j in 0..pred_copies {
                        let upstream = self.outputs.get(&p.id).and_then(|copies| copies.get(i + j))
                            .ok_or_else(|| ExecError::internal(format!("no execution node for {}/{}", p.id, i + j)))?;
                        let transport = ConsecutiveTransport::new(self.dispatcher.clone(), t.clone(), node.kind(),
                            node.id.to_string(), node.call_stack.clone(), self.config.message_queue_capacity);
                        upstream.add(transport.clone());
                        state.transports.push(transport);
                    }
                }
            }
            outputs.push(ctx.outputs);
        }
        self.outputs.insert(node.id.clone(), outputs);

        // Terminal nodes without a yield still need somewhere to send their tables.
        if self.plan.successors(&node.id).is_empty() {
            let name = self.result_name(node, is_parallel_merge)?;
            self.generate_result(state, &name, node)?;
        }
        Ok(())
    }

    fn generate_result(&self, state: &mut ExecutionState, name: &str, node: &PlanNode) -> Result<(), ExecError> {
        if state.results.contains_key(name) {
            return Err(ExecError::invalid(format!("tried to produce more than one result with the name {:?}", name)));
        }
        let target = self.plan.skip_yields(node)?;
        let outputs = self.outputs.get(&target.id).and_then(|copies| copies.first())
            .ok_or_else(|| ExecError::internal(format!("no execution node for {}", target.id)))?;
        let result = QueryResult::new(name);
        outputs.add(Arc::new(result.clone()));
        state.results.insert(name.to_string(), result);
        Ok(())
    }

    // Side effect nodes name their result after themselves. A parallel merge was put
    // there by the planner, so its predecessor decides whether it has a side effect.
    fn result_name(&self, node: &PlanNode, is_parallel_merge: bool) -> Result<String, ExecError> {
        let mut decides = node;
        if is_parallel_merge {
            let preds = self.plan.predecessors(&node.id);
            if preds.len() != 1 {
                return Err(ExecError::internal("parallel merge must have a single predecessor"));
            }
            decides = preds[0];
        }
        if decides.spec.has_side_effect() {
            Ok(node.id.to_string())
        } else {
            Ok(DEFAULT_YIELD_NAME.to_string())
        }
    }
}

fn choose_default_resources(plan: &PhysicalPlan, config: &ExecConfig) -> Result<Resources, ExecError> {
    let mut resources = plan.resources;
    if resources.memory_bytes_quota == 0 {
        resources.memory_bytes_quota = config.default_memory_quota.unwrap_or(u64::MAX);
    }
    if resources.concurrency_quota == 0 {
        resources.concurrency_quota = compute_concurrency_quota(plan, config)?;
    }
    Ok(resources)
}

struct QuotaVisitor<'a> {
    plan: &'a PhysicalPlan,
    seen: HashSet<NodeId>,
    quota: usize,
    // extra workers parallel merges already brought in
    parallelization_accounted_for: usize,
}

impl<'a> QuotaVisitor<'a> {
    fn visit(&mut self, node: &'a PlanNode) {
        if !self.seen.insert(node.id.clone()) {
            return;
        }
        let preds = self.plan.predecessors(&node.id);
        if node.is_yield() {
            // yields are skipped in the execution graph, their input becomes the result
            for pred in preds {
                self.visit(pred);
            }
        } else if preds.len() > 1 {
            // every predecessor may block a worker while delivering into this result
            self.quota += preds.len();
        } else if let Some(factor) = node.parallel_merge {
            self.quota += factor;
            self.parallelization_accounted_for += factor.saturating_sub(1);
        } else {
            self.quota += 1;
        }
    }
}

/// Number of dispatcher workers for a plan that doesn't set one: one per result,
/// one per extra input into a result, twice the largest parallel factor, plus the
/// configured increase.
fn compute_concurrency_quota(plan: &PhysicalPlan, config: &ExecConfig) -> Result<usize, ExecError> {
    let mut visitor = QuotaVisitor { plan, seen: HashSet::new(), quota: 0, parallelization_accounted_for: 0 };
    for root in plan.roots() {
        visitor.visit(root);
    }
    let nodes = plan.top_down()?;
    for node in nodes.iter().filter(|n| n.is_yield()) {
        visitor.visit(node);
    }

    let max_parallel_factor = nodes.iter().filter_map(|n| n.parallel_run).max().unwrap_or(0);
    let parallelization = max_parallel_factor * 2;
    let mut quota = visitor.quota;
    if parallelization > visitor.parallelization_accounted_for {
        quota += parallelization - visitor.parallelization_accounted_for;
    }
    quota += config.effective_concurrency_increase();
    if let Some(max) = config.max_concurrency {
        quota = quota.min(max);
    }
    Ok(quota)
}

/// A running execution.
pub struct Execution {
    results: BTreeMap<String, QueryResult>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Statistics>>,
    first_err: Arc<Mutex<Option<ExecError>>>,
}

impl Execution {
    pub fn results(&self) -> &BTreeMap<String, QueryResult> {
        &self.results
    }

    pub fn result(&self, name: &str) -> Option<&QueryResult> {
        self.results.get(name)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits until every source, transport and worker stopped. Fails with the first
    /// error the execution saw.
    pub fn wait(mut self) -> Result<Statistics, ExecError> {
        let stats = match self.handle.take() {
            Some(handle) => handle.join().map_err(from_panic)?,
            None => Statistics::default(),
        };
        match self.first_err.lock().clone() {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }
}

#[cfg(test)]
mod test {
    use std::any::Any;

    use crate::{
        execution::{
            builtin::{register_builtins, CountSpec, PassSpec, ValuesSpec, ValuesTable, COUNT_KIND, PASS_KIND, VALUES_KIND},
            group_key::GroupKey,
            mock::string_key,
            plan::{test::op, ProcedureSpec, YieldSpec},
            table::Chunk,
            transport::{NarrowTransformation, NarrowTransport, TransportDataset},
        },
        types::Value,
    };

    use super::*;

    fn add_chain(plan: &mut PhysicalPlan, nodes: Vec<PlanNode>) -> Vec<NodeId> {
        let ids: Vec<NodeId> = nodes.into_iter().map(|n| plan.add_node(n).unwrap()).collect();
        for pair in ids.windows(2) {
            plan.add_edge(&pair[0], &pair[1]).unwrap();
        }
        ids
    }

    fn yield_node(name: &str) -> PlanNode {
        PlanNode::new(format!("yield_{}", name), YieldSpec::new(name))
    }

    fn union(plan: &mut PhysicalPlan, id: &str, inputs: &[&NodeId]) -> NodeId {
        let u = plan.add_node(op(id, "union")).unwrap();
        for input in inputs {
            plan.add_edge(input, &u).unwrap();
        }
        u
    }

    // from |> to |> partition merge, with from and to running `factor` times
    fn parallel_from_to(plan: &mut PhysicalPlan, n: usize, factor: usize) -> NodeId {
        let ids = add_chain(plan, vec![
            op(&format!("from{}", n), "from").with_parallel_run(factor),
            op(&format!("to{}", n), "to").with_parallel_run(factor),
            op(&format!("merge{}", n), "partitionMerge").with_parallel_merge(factor),
        ]);
        ids[2].clone()
    }

    fn quota(plan: &PhysicalPlan, increase: usize) -> usize {
        let config = ExecConfig { concurrency_increase: increase, ..ExecConfig::default() };
        choose_default_resources(plan, &config).unwrap().concurrency_quota
    }

    fn four_sources(plan: &mut PhysicalPlan) -> Vec<NodeId> {
        (1..=4).map(|i| plan.add_node(op(&format!("s{}", i), "from")).unwrap()).collect()
    }

    #[test]
    fn test_quota_from_plan() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![op("from", "from"), op("filter", "filter")]);
        plan.resources.concurrency_quota = 9;
        assert_eq!(quota(&plan, 0), 9);
    }

    #[test]
    fn test_quota_results() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![op("from", "from"), op("filter", "filter")]);
        assert_eq!(quota(&plan, 0), 1);

        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![op("from1", "from"), op("filter1", "filter")]);
        add_chain(&mut plan, vec![op("from2", "from"), op("filter2", "filter")]);
        assert_eq!(quota(&plan, 0), 2);

        let mut plan = PhysicalPlan::new();
        for i in 0..5 {
            plan.add_node(op(&format!("from{}", i), "from")).unwrap();
        }
        assert_eq!(quota(&plan, 0), 5);

        let mut plan = PhysicalPlan::new();
        for i in 1..=5 {
            add_chain(&mut plan, vec![op(&format!("from{}", i), "from"), yield_node(&format!("n{}", i))]);
        }
        assert_eq!(quota(&plan, 0), 5);
    }

    #[test]
    fn test_quota_chained_yields() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![op("from1", "from"), yield_node("n1"), yield_node("n2"), yield_node("n3")]);
        add_chain(&mut plan, vec![op("from2", "from"), yield_node("n4"), yield_node("n5")]);
        assert_eq!(quota(&plan, 0), 2);
    }

    #[test]
    fn test_quota_unions() {
        let mut plan = PhysicalPlan::new();
        let s1 = plan.add_node(op("s1", "from")).unwrap();
        let s2 = plan.add_node(op("s2", "from")).unwrap();
        union(&mut plan, "u1", &[&s1, &s2]);
        assert_eq!(quota(&plan, 0), 2);

        let mut plan = PhysicalPlan::new();
        let s = four_sources(&mut plan);
        union(&mut plan, "u1", &[&s[0], &s[1]]);
        union(&mut plan, "u2", &[&s[0], &s[1], &s[2], &s[3]]);
        assert_eq!(quota(&plan, 0), 6);
    }

    #[test]
    fn test_quota_unions_behind_yields() {
        let mut plan = PhysicalPlan::new();
        let s = four_sources(&mut plan);
        let u1 = union(&mut plan, "u1", &[&s[0], &s[1]]);
        union(&mut plan, "u2", &[&s[0], &s[1], &s[2], &s[3]]);
        let n1 = plan.add_node(yield_node("n1")).unwrap();
        plan.add_edge(&u1, &n1).unwrap();
        assert_eq!(quota(&plan, 0), 6);

        let mut plan = PhysicalPlan::new();
        let s = four_sources(&mut plan);
        let u1 = union(&mut plan, "u1", &[&s[0], &s[1]]);
        let u2 = union(&mut plan, "u2", &[&s[0], &s[1], &s[2], &s[3]]);
        let ys = add_chain(&mut plan, vec![yield_node("n1"), yield_node("n2")]);
        plan.add_edge(&u1, &ys[0]).unwrap();
        let n3 = plan.add_node(yield_node("n3")).unwrap();
        plan.add_edge(&u2, &n3).unwrap();
        assert_eq!(quota(&plan, 0), 6);
    }

    #[test]
    fn test_quota_inline_yields() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![op("from", "from"), yield_node("n1"), op("filter", "filter")]);
        assert_eq!(quota(&plan, 0), 2);

        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![op("from", "from"), yield_node("n1"), op("filter", "filter"), yield_node("n2")]);
        assert_eq!(quota(&plan, 0), 2);

        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![op("from", "from"), yield_node("n1"), yield_node("n2"), op("filter", "filter"), yield_node("n3")]);
        assert_eq!(quota(&plan, 0), 2);

        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![
            op("from", "from"), yield_node("n1"), op("filter1", "filter"), yield_node("n2"), op("filter2", "filter"), yield_node("n3"),
        ]);
        assert_eq!(quota(&plan, 0), 3);
    }

    fn unions_with_inline_yields() -> PhysicalPlan {
        let mut plan = PhysicalPlan::new();
        let s = four_sources(&mut plan);
        let u1 = union(&mut plan, "u1", &[&s[0], &s[1]]);
        union(&mut plan, "u2", &[&s[0], &s[1], &s[2], &s[3]]);
        let chain = add_chain(&mut plan, vec![yield_node("n1"), yield_node("n2"), op("filter", "filter")]);
        plan.add_edge(&u1, &chain[0]).unwrap();
        plan
    }

    #[test]
    fn test_quota_unions_with_inline_yields() {
        assert_eq!(quota(&unions_with_inline_yields(), 0), 7);
    }

    #[test]
    fn test_quota_increase() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![op("from", "from"), op("filter", "filter")]);
        assert_eq!(quota(&plan, 1), 2);

        let mut plan = PhysicalPlan::new();
        plan.add_node(op("from1", "from")).unwrap();
        plan.add_node(op("from2", "from")).unwrap();
        assert_eq!(quota(&plan, 2), 4);

        assert_eq!(quota(&unions_with_inline_yields(), 3), 10);
        // out of range increases are ignored
        assert_eq!(quota(&unions_with_inline_yields(), 257), 7);
    }

    #[test]
    fn test_quota_parallelization() {
        // merge is not a result, all 8 extra workers come from the parallel factor
        let mut plan = PhysicalPlan::new();
        let merge = parallel_from_to(&mut plan, 0, 4);
        let filter = plan.add_node(op("filter", "filter")).unwrap();
        plan.add_edge(&merge, &filter).unwrap();
        assert_eq!(quota(&plan, 0), 9);

        // the merge result accounts for 3 of them
        let mut plan = PhysicalPlan::new();
        parallel_from_to(&mut plan, 0, 4);
        assert_eq!(quota(&plan, 0), 9);

        let mut plan = PhysicalPlan::new();
        for i in 1..=3 {
            let merge = parallel_from_to(&mut plan, i, 4);
            let y = plan.add_node(yield_node(&format!("n{}", i))).unwrap();
            plan.add_edge(&merge, &y).unwrap();
        }
        assert_eq!(quota(&plan, 0), 12);
    }

    #[test]
    fn test_quota_parallel_behind_unions() {
        let build = |extra_results: usize| {
            let mut plan = PhysicalPlan::new();
            let m1 = parallel_from_to(&mut plan, 1, 4);
            let m2 = parallel_from_to(&mut plan, 2, 4);
            let s3 = plan.add_node(op("s3", "from")).unwrap();
            let s4 = plan.add_node(op("s4", "from")).unwrap();
            union(&mut plan, "u1", &[&m1, &m2]);
            union(&mut plan, "u2", &[&m1, &m2, &s3, &s4]);
            for i in 0..extra_results {
                parallel_from_to(&mut plan, 10 + i, 4);
            }
            plan
        };
        assert_eq!(quota(&build(0), 0), 14);
        assert_eq!(quota(&build(3), 0), 18);
    }

    #[test]
    fn test_quota_clamped_and_memory_default() {
        let plan = unions_with_inline_yields();
        let config = ExecConfig { max_concurrency: Some(4), default_memory_quota: Some(1024), ..ExecConfig::default() };
        let resources = choose_default_resources(&plan, &config).unwrap();
        assert_eq!(resources.concurrency_quota, 4);
        assert_eq!(resources.memory_bytes_quota, 1024);
        let resources = choose_default_resources(&plan, &ExecConfig::default()).unwrap();
        assert_eq!(resources.memory_bytes_quota, u64::MAX);
    }

    fn window(stop: i64) -> GroupKey {
        GroupKey::from_pairs(vec![
            ("_start", Value::Time(stop - 10)),
            ("_stop", Value::Time(stop)),
            ("t0", Value::String("a".to_string())),
        ])
    }

    fn values(tables: Vec<(GroupKey, Vec<i64>)>) -> ValuesSpec {
        ValuesSpec {
            tables: tables.into_iter().map(|(key, v)| ValuesTable::ints(key, "_value", v)).collect(),
            watermark: None,
        }
    }

    fn executor() -> Executor {
        let mut registry = Registry::new();
        register_builtins(&mut registry).unwrap();
        register_test_procedures(&mut registry);
        Executor::new(ExecConfig::default(), registry)
    }

    #[test]
    fn test_execute_count_per_key() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![
            PlanNode::new("values", values(vec![(string_key("b"), vec![1, 2]), (string_key("a"), vec![3]), (string_key("b"), vec![4])])),
            PlanNode::new(COUNT_KIND, CountSpec),
            yield_node("counts"),
        ]);
        let execution = executor().execute(&plan, CancellationToken::new()).unwrap();
        assert_eq!(execution.results().keys().collect::<Vec<_>>(), vec!["counts"]);
        let tables = execution.result("counts").unwrap().collect().unwrap();
        let counts: Vec<_> = tables.iter().map(|t| (t.key().clone(), t.column_values("_value"))).collect();
        assert_eq!(counts, vec![(string_key("a"), vec![Value::Int(1)]), (string_key("b"), vec![Value::Int(3)])]);

        let stats = execution.wait().unwrap();
        assert_eq!(stats.concurrency_quota, 1);
        assert_eq!(stats.profiles.len(), 2);
        assert_eq!(stats.profiles[0].label, "values");
        assert_eq!(stats.profiles[1].node_type, COUNT_KIND);
        assert_eq!(stats.profiles[1].count, 7);
    }

    #[test]
    fn test_execute_watermark_trigger() {
        let mut plan = PhysicalPlan::new();
        let mut spec = values(vec![(window(100), vec![1, 2]), (window(200), vec![3])]);
        spec.watermark = Some(150);
        add_chain(&mut plan, vec![PlanNode::new("values", spec), PlanNode::new("count", CountSpec)]);
        let execution = executor().execute(&plan, CancellationToken::new()).unwrap();
        let tables = execution.result(DEFAULT_YIELD_NAME).unwrap().collect().unwrap();
        let stops: Vec<_> = tables.iter().map(|t| (t.key().stop(), t.column_values("_value"))).collect();
        assert_eq!(stops, vec![(Some(100), vec![Value::Int(2)]), (Some(200), vec![Value::Int(1)])]);
        execution.wait().unwrap();
    }

    #[test]
    fn test_execute_parallel_merge() {
        let mut plan = PhysicalPlan::new();
        let keys = ["a", "b", "c", "d", "e"];
        add_chain(&mut plan, vec![
            PlanNode::new("values", values(keys.iter().map(|k| (string_key(k), vec![1, 2])).collect())).with_parallel_run(2),
            PlanNode::new("pass", PassSpec).with_parallel_run(2),
            PlanNode::new("count", CountSpec).with_parallel_merge(2),
        ]);
        let execution = executor().execute(&plan, CancellationToken::new()).unwrap();
        let tables = execution.result(DEFAULT_YIELD_NAME).unwrap().collect().unwrap();
        assert_eq!(tables.len(), 5);
        assert!(tables.iter().all(|t| t.column_values("_value") == vec![Value::Int(2)]));
        let stats = execution.wait().unwrap();
        // two pass edges, two merge edges
        assert_eq!(stats.profiles.iter().filter(|p| p.node_type == PASS_KIND).count(), 2);
        assert_eq!(stats.profiles.iter().filter(|p| p.node_type == COUNT_KIND).count(), 2);
        // the merge result accounts for one of the four parallel workers
        assert_eq!(stats.concurrency_quota, 5);
    }

    #[test]
    fn test_execute_side_effect_result_name() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![
            PlanNode::new("values", values(vec![(string_key("a"), vec![1])])),
            PlanNode::new("sink", SinkSpec),
        ]);
        let execution = executor().execute(&plan, CancellationToken::new()).unwrap();
        assert!(execution.result("sink").is_some());
        assert_eq!(execution.result("sink").unwrap().collect().unwrap().len(), 1);
        execution.wait().unwrap();
    }

    #[test]
    fn test_execute_side_effect_behind_parallel_merge() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![
            PlanNode::new("values", values(vec![(string_key("a"), vec![1]), (string_key("b"), vec![2])])).with_parallel_run(2),
            PlanNode::new("sink", SinkSpec).with_parallel_run(2),
            PlanNode::new("merge", PassSpec).with_parallel_merge(2),
        ]);
        let execution = executor().execute(&plan, CancellationToken::new()).unwrap();
        assert_eq!(execution.results().keys().collect::<Vec<_>>(), vec!["merge"]);
        assert_eq!(execution.result("merge").unwrap().collect().unwrap().len(), 2);
        execution.wait().unwrap();
    }

    #[test]
    fn test_execute_operator_error() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![
            PlanNode::new("values", values(vec![(string_key("a"), vec![1]), (string_key("b"), vec![2])])),
            PlanNode::new("fail", FailSpec),
            PlanNode::new("pass", PassSpec),
            yield_node("n1"),
        ]);
        let execution = executor().execute(&plan, CancellationToken::new()).unwrap();
        let err = execution.result("n1").unwrap().collect().unwrap_err();
        assert_eq!(err.root_cause().to_string(), "expected");
        let err = execution.wait().unwrap_err();
        assert!(matches!(err, ExecError::Runtime { .. }));
        assert_eq!(err.root_cause().to_string(), "expected");
    }

    #[test]
    fn test_execute_source_panic() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![PlanNode::new("panic", PanicSpec), PlanNode::new("pass", PassSpec)]);
        let execution = executor().execute(&plan, CancellationToken::new()).unwrap();
        let err = execution.result(DEFAULT_YIELD_NAME).unwrap().collect().unwrap_err();
        assert_eq!(err.to_string(), "panic: expected");
        let err = execution.wait().unwrap_err();
        assert_eq!(err.to_string(), "panic: expected");
        assert!(err.stack().is_some());
    }

    #[test]
    fn test_execute_cancel() {
        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![PlanNode::new("block", BlockSpec), PlanNode::new("pass", PassSpec)]);
        let execution = executor().execute(&plan, CancellationToken::new()).unwrap();
        execution.cancel();
        let err = execution.result(DEFAULT_YIELD_NAME).unwrap().collect().unwrap_err();
        assert!(err.is_cancelled());
        assert!(execution.wait().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_execute_memory_quota() {
        let mut plan = PhysicalPlan::new();
        // 27 bytes per table, the result holds on to the first one
        add_chain(&mut plan, vec![
            PlanNode::new("values", values(vec![(string_key("a"), vec![1, 2, 3]), (string_key("b"), vec![4, 5, 6])])),
            PlanNode::new("pass", PassSpec),
        ]);
        plan.resources.memory_bytes_quota = 40;
        let execution = executor().execute(&plan, CancellationToken::new()).unwrap();
        let err = execution.wait().unwrap_err();
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn test_invalid_plans() {
        let executor = executor();

        let mut plan = PhysicalPlan::new();
        let v = plan.add_node(PlanNode::new("values", values(vec![]))).unwrap();
        for name in ["y1", "y2"] {
            let y = plan.add_node(PlanNode::new(name, YieldSpec::new("same"))).unwrap();
            plan.add_edge(&v, &y).unwrap();
        }
        let err = executor.execute(&plan, CancellationToken::new()).err().unwrap();
        assert!(matches!(err, ExecError::Invalid(_)));

        let mut plan = PhysicalPlan::new();
        add_chain(&mut plan, vec![PlanNode::new("values", values(vec![])), op("filter", "filter")]);
        assert!(matches!(executor.execute(&plan, CancellationToken::new()).err().unwrap(), ExecError::Invalid(_)));

        let err = executor.execute(&PhysicalPlan::new(), CancellationToken::new()).err().unwrap();
        assert_eq!(err.to_string(), "invalid: execution state must have a non-zero concurrency quota");
    }

    macro_rules! test_spec {
        ($name:ident, $kind:expr, $side_effect:expr) => {
            #[derive(Debug)]
            struct $name;

            impl ProcedureSpec for $name {
                fn kind(&self) -> &str {
                    $kind
                }

                fn has_side_effect(&self) -> bool {
                    $side_effect
                }

                fn as_any(&self) -> &dyn Any {
                    self
                }
            }
        };
    }

    test_spec!(FailSpec, "fail", false);
    test_spec!(SinkSpec, "sink", true);
    test_spec!(PanicSpec, "panic", false);
    test_spec!(BlockSpec, "block", false);

    struct Fail;

    impl NarrowTransformation for Fail {
        fn process(&mut self, _: Chunk, _: &TransportDataset) -> Result<(), ExecError> {
            Err(ExecError::operator("expected"))
        }
    }

    struct Panic;

    impl Source for Panic {
        fn run(&mut self) {
            panic!("expected");
        }
    }

    struct Block {
        d: TransportDataset,
        cancel: CancellationToken,
    }

    impl Source for Block {
        fn run(&mut self) {
            self.cancel.wait_cancelled();
            self.d.finish(Some(ExecError::Cancelled));
        }
    }

    fn register_test_procedures(registry: &mut Registry) {
        registry.register_transformation("fail", |_, id, ctx| {
            Ok(Box::new(NarrowTransport::new(Fail, TransportDataset::new(id, ctx.outputs.clone()))) as Box<dyn Transport>)
        }).unwrap();
        registry.register_transformation("sink", |_, id, ctx| {
            Ok(Box::new(NarrowTransport::new(PassThrough, TransportDataset::new(id, ctx.outputs.clone()))) as Box<dyn Transport>)
        }).unwrap();
        registry.register_source("panic", |_, _, _| Ok(Box::new(Panic) as Box<dyn Source>)).unwrap();
        registry.register_source("block", |_, id, ctx| {
            Ok(Box::new(Block { d: TransportDataset::new(id, ctx.outputs.clone()), cancel: ctx.cancel.clone() }) as Box<dyn Source>)
        }).unwrap();
        assert!(registry.source(VALUES_KIND).is_some());
    }

    struct PassThrough;

    impl NarrowTransformation for PassThrough {
        fn process(&mut self, chunk: Chunk, d: &TransportDataset) -> Result<(), ExecError> {
            d.process(chunk)
        }
    }
}
