use std::sync::Arc;

use crate::{memory::Allocator, types::Time};

use super::{message::DatasetId, plan::Bounds, signal::CancellationToken, transport::TransformationSet, trigger::TriggerSpec};

/// Which copy of a parallel node is being built, out of how many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelOpts {
    pub group: usize,
    pub factor: usize,
}

impl Default for ParallelOpts {
    fn default() -> Self {
        ParallelOpts { group: 0, factor: 1 }
    }
}

/// Everything a factory gets to build one copy of a plan node.
#[derive(Clone)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub allocator: Arc<Allocator>,
    pub now: Time,
    /// Datasets feeding this node, one per predecessor copy.
    pub parents: Vec<DatasetId>,
    /// Where the node's output goes. The executor fills it in after the factory ran.
    pub outputs: TransformationSet,
    pub trigger_spec: TriggerSpec,
    pub parallel_opts: ParallelOpts,
    pub bounds: Option<Bounds>,
    pub label: String,
}

impl ExecutionContext {
    pub fn new(allocator: Arc<Allocator>, cancel: CancellationToken) -> ExecutionContext {
        ExecutionContext {
            cancel,
            allocator,
            now: 0,
            parents: Vec::new(),
            outputs: TransformationSet::new(),
            trigger_spec: TriggerSpec::default(),
            parallel_opts: ParallelOpts::default(),
            bounds: None,
            label: String::new(),
        }
    }

    /// Turns a time relative to the execution's `now` into an absolute one.
    pub fn resolve_time(&self, relative: Time) -> Time {
        self.now.saturating_add(relative)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resolve_time() {
        let mut ctx = ExecutionContext::new(Allocator::unlimited(), CancellationToken::new());
        ctx.now = 1_000;
        assert_eq!(ctx.resolve_time(-100), 900);
        assert_eq!(ctx.resolve_time(i64::MAX), i64::MAX);
        assert_eq!(ctx.parallel_opts, ParallelOpts { group: 0, factor: 1 });
    }
}
