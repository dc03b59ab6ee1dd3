/*
    Push based streaming execution. A physical plan is turned into one dataset per
    copy of every node. Sources push their output into per-edge transports, which
    deliver it to the downstream operators on a shared worker pool. Results are
    read from named result streams while the execution is still running.
 */

pub mod builtin;
pub mod consecutive_transport;
pub mod context;
pub mod dataset;
pub mod dispatcher;
pub mod executor;
pub mod group_key;
pub mod group_lookup;
pub mod message;
pub mod plan;
pub mod registry;
pub mod result;
pub mod ring;
pub mod signal;
pub mod table;
pub mod transport;
pub mod trigger;

#[cfg(test)]
mod mock;
