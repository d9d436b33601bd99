//! coal-store node: durable counters and sequences plus in-memory lease
//! locks, served over a RESP2 socket and backed by the coalescing update
//! engine in `coal_engine`.

pub mod counters;
pub mod keys;
pub mod locks;
pub mod node;
pub mod resp_server;
pub mod sequences;

pub use counters::Counters;
pub use locks::LeaseLocks;
pub use node::{run_node, run_node_with_shutdown, NodeArgs, NodeState};
pub use sequences::Sequences;
