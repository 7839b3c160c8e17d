//! Shared constants, id types, and the error hierarchy used across the
//! storage, transport, and consensus layers.

use std::time::Duration;
use thiserror::Error;

/// Unique id of a cluster member. Matches the `id` field of the topology
/// file (see [`crate::config`]).
pub type NodeId = u64;

/// `votedFor` sentinel meaning "has not voted this term". The on-disk
/// encoding and the original prototype both use `-2` rather than `-1`.
pub const NOT_VOTED: i64 = -2;

pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(150);
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(1000);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Bound on how long a leader will wait for a read-quorum round to
/// complete before failing every request in the batch.
pub const READ_QUORUM_TIMEOUT: Duration = Duration::from_millis(500);

pub const DEFAULT_WRITE_BATCH_SIZE: usize = 128;
pub const DEFAULT_READ_BATCH_SIZE: usize = 128;
pub const DEFAULT_LINGER: Duration = Duration::from_millis(15);

pub const APPEND_ENTRIES_OPCODE: i16 = 0;
pub const REQUEST_VOTE_OPCODE: i16 = 1;
pub const READ_OPCODE: i16 = 2;

/// Failures from the durable store. Per the durability invariant, any of
/// these is fatal to the node that observes it: the triggering RPC must
/// not be acknowledged.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("durable store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures from the transport layer. All of these are "no information" —
/// the consensus algorithm treats an `RpcError` exactly like a dropped
/// packet, never like a `success: false` reply.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to dial peer: {0}")]
    Dial(std::io::Error),
    #[error("failed to send rpc: {0}")]
    Send(std::io::Error),
    #[error("failed to receive rpc reply: {0}")]
    Receive(std::io::Error),
    #[error("malformed capnp message: {0}")]
    Capnp(#[from] capnp::Error),
    #[error("peer has no known address")]
    UnknownPeer,
    #[error("no handler registered for opcode {0}")]
    UnknownOpcode(i16),
    /// A durable-store failure observed while handling an inbound RPC.
    /// Per the durability invariant this must not be acknowledged; the
    /// connection is closed without a reply and the node shuts down.
    #[error("fatal durable-store failure: {0}")]
    Fatal(String),
}

/// Node-level error, returned from fallible setup paths (`Node::new`,
/// `Node::run`). Nothing inside the replication/election loops surfaces
/// through this type: those failures are handled locally per spec.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid cluster topology: {0}")]
    Config(String),
}
