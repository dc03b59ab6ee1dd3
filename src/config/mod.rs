// Upper bound for the additive concurrency increase. Anything above this is ignored
// so that a typo in the environment can't spin up thousands of worker threads.
pub const MAX_CONCURRENCY_INCREASE: usize = 256;

const DEFAULT_DISPATCHER_THROUGHPUT: usize = 10;
const DEFAULT_MESSAGE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecConfig {
    // How many messages a per-edge actor may handle before it yields its worker
    pub dispatcher_throughput: usize,
    // Initial size of each per-edge mailbox. It grows on demand.
    pub message_queue_capacity: usize,
    // Extra workers added on top of the computed concurrency quota
    pub concurrency_increase: usize,
    pub max_concurrency: Option<usize>,
    // Used when the plan does not carry a memory quota. None means unlimited.
    pub default_memory_quota: Option<u64>,
}

impl ExecConfig {
    pub fn new() -> ExecConfig {
        // Read the OXIDFLOW_* environment variables.
        // Anything that isn't set or doesn't parse falls back to the defaults.
        let defaults = ExecConfig::default();
        ExecConfig {
            dispatcher_throughput: env_var("OXIDFLOW_DISPATCHER_THROUGHPUT")
                .filter(|t| *t > 0)
                .unwrap_or(defaults.dispatcher_throughput),
            message_queue_capacity: env_var("OXIDFLOW_MESSAGE_QUEUE_CAPACITY")
                .filter(|c| *c > 0)
                .unwrap_or(defaults.message_queue_capacity),
            concurrency_increase: env_var("OXIDFLOW_CONCURRENCY_INCREASE")
                .unwrap_or(defaults.concurrency_increase),
            max_concurrency: env_var("OXIDFLOW_MAX_CONCURRENCY").filter(|m| *m > 0),
            default_memory_quota: env_var("OXIDFLOW_DEFAULT_MEMORY_QUOTA").filter(|m| *m > 0),
        }
    }

    // The increase only counts when it is inside 1..=MAX_CONCURRENCY_INCREASE
    pub fn effective_concurrency_increase(&self) -> usize {
        if (1..=MAX_CONCURRENCY_INCREASE).contains(&self.concurrency_increase) {
            self.concurrency_increase
        } else {
            0
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            dispatcher_throughput: DEFAULT_DISPATCHER_THROUGHPUT,
            message_queue_capacity: DEFAULT_MESSAGE_QUEUE_CAPACITY,
            concurrency_increase: 0,
            max_concurrency: None,
            default_memory_quota: None,
        }
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}
