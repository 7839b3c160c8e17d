//! A replicated key-value store built on the Raft consensus algorithm.
//! See the module docs of [`consensus`] for the role state machine,
//! [`storage`] for the durable log, and [`node`] for how a process wires
//! the pieces together.

pub mod rpc_capnp {
    include!(concat!(env!("OUT_DIR"), "/rpc_capnp.rs"));
}
pub mod raft_capnp {
    include!(concat!(env!("OUT_DIR"), "/raft_capnp.rs"));
}

pub mod applier;
pub mod batcher;
pub mod common;
pub mod config;
pub mod consensus;
pub mod node;
pub mod rpc;
pub mod state_machine;
pub mod storage;

pub use node::{Node, NodeOptions};
