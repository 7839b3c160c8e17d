//! Top-level wiring: assembles the durable store, replicated log,
//! transport, consensus core, batcher, and applier into one running
//! node, and exposes the in-process client surface (`submit`) plus a
//! thin TCP front end for out-of-process clients.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::applier;
use crate::batcher::{self, BatcherConfig, BatcherHandle};
use crate::common::{
    NodeId, RaftError, APPEND_ENTRIES_OPCODE, DEFAULT_LINGER, DEFAULT_READ_BATCH_SIZE, DEFAULT_WRITE_BATCH_SIZE,
    ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN, HEARTBEAT_INTERVAL, READ_OPCODE, READ_QUORUM_TIMEOUT, REQUEST_VOTE_OPCODE,
};
use crate::config::ClusterConfig;
use crate::consensus::peer;
use crate::consensus::state::{RaftState, Role, Shared};
use crate::consensus::{AppendEntriesHandler, ReadHandler, RequestVoteHandler};
use crate::rpc::client::DialTable;
use crate::rpc::server::RpcServer;
use crate::state_machine::Response;
use crate::storage::log::ReplicatedLog;
use crate::storage::DurableStore;

pub struct NodeOptions {
    pub id: NodeId,
    pub data_dir: PathBuf,
    pub async_log: bool,
    pub write_batch_size: usize,
    pub read_batch_size: usize,
    pub linger: Duration,
}

impl NodeOptions {
    pub fn new(id: NodeId, data_dir: PathBuf) -> NodeOptions {
        NodeOptions {
            id,
            data_dir,
            async_log: false,
            write_batch_size: DEFAULT_WRITE_BATCH_SIZE,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            linger: DEFAULT_LINGER,
        }
    }
}

/// A running node. Dropping this without calling [`Node::shutdown`]
/// leaves its background threads running until the process exits.
pub struct Node {
    shared: Arc<Shared>,
    batcher: BatcherHandle,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Node {
    pub fn new(options: NodeOptions, cluster: &ClusterConfig) -> Result<Node, RaftError> {
        let my_info = cluster.node(options.id)?;
        let rpc_addr = my_info.rpc_addr()?;
        let client_addr = my_info.client_addr()?;
        let peer_addrs = cluster.peer_addrs(options.id)?;
        let peer_ids: Vec<NodeId> = peer_addrs.keys().copied().collect();

        let mut storage = DurableStore::open(options.id, &options.data_dir, options.async_log)?;
        let (current_term, voted_for) = storage.load_state()?;
        let log = ReplicatedLog::from_entries(storage.load_log()?);

        let election_timeout_range = (ELECTION_TIMEOUT_MIN, ELECTION_TIMEOUT_MAX);
        let mut state = RaftState {
            role: Role::Follower,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            pending_responses: HashMap::new(),
            election_deadline: Instant::now(),
            storage,
        };
        state.reset_election_deadline(election_timeout_range);

        let mut wake_txs = HashMap::new();
        let mut wake_rxs = HashMap::new();
        for &peer_id in &peer_ids {
            let (tx, rx) = mpsc::channel();
            wake_txs.insert(peer_id, tx);
            wake_rxs.insert(peer_id, rx);
        }

        let dial_table = DialTable::new(peer_addrs);
        let shared = Arc::new(Shared::new(
            options.id,
            peer_ids.clone(),
            state,
            dial_table,
            election_timeout_range,
            HEARTBEAT_INTERVAL,
            READ_QUORUM_TIMEOUT,
            wake_txs,
        ));

        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        let mut rpc_server = RpcServer::new_with_services(vec![
            (APPEND_ENTRIES_OPCODE, Box::new(AppendEntriesHandler { shared: shared.clone() })),
            (REQUEST_VOTE_OPCODE, Box::new(RequestVoteHandler { shared: shared.clone() })),
            (READ_OPCODE, Box::new(ReadHandler { shared: shared.clone() })),
        ]);
        rpc_server.bind(rpc_addr)?;
        threads.push(rpc_server.serve(stop.clone()));

        for (peer_id, wake_rx) in wake_rxs.drain() {
            threads.push(peer::spawn(shared.clone(), peer_id, wake_rx, stop.clone()));
        }

        threads.push({
            let shared = shared.clone();
            let stop = stop.clone();
            thread::spawn(move || crate::consensus::run_election_driver(shared, stop))
        });

        threads.push(applier::spawn(shared.clone(), stop.clone()));

        let (batcher, batcher_thread) = batcher::spawn(
            shared.clone(),
            BatcherConfig {
                write_batch_size: options.write_batch_size,
                read_batch_size: options.read_batch_size,
                linger: options.linger,
            },
            stop.clone(),
        );
        threads.push(batcher_thread);

        threads.push(spawn_client_listener(client_addr, batcher.clone(), stop.clone())?);

        log::info!("[Node: {}] started, rpc {} client {}", options.id, rpc_addr, client_addr);
        Ok(Node { shared, batcher, stop, threads })
    }

    /// Submits one command through the batcher and blocks for its
    /// response. This is the in-process client surface used directly by
    /// the integration tests; the TCP front end wraps the same call.
    pub fn submit(&self, command: Vec<u8>) -> Response {
        self.batcher.submit(command)
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn is_fatal(&self) -> bool {
        self.shared.is_fatal()
    }

    /// Reads a key directly from this node's local state machine,
    /// bypassing the leader-only quorum-read path. Not part of the
    /// client protocol: a way to inspect replication convergence on a
    /// specific replica (tests; an operational debug endpoint would use
    /// the same call).
    pub fn debug_get(&self, key: &str) -> Response {
        self.shared.machine.lock().unwrap().get(key)
    }

    pub fn is_leader(&self) -> bool {
        self.shared.state.lock().unwrap().role == crate::consensus::state::Role::Leader
    }

    /// This node's currently persisted term. Test introspection only, the
    /// same rationale as [`Node::debug_get`].
    pub fn debug_current_term(&self) -> u64 {
        self.shared.state.lock().unwrap().current_term
    }

    /// This node's highest local log index, committed or not. Lets a test
    /// wait for an entry to have actually been appended before acting on
    /// the node (e.g. crashing it), rather than racing a fixed sleep.
    pub fn debug_last_log_index(&self) -> u64 {
        self.shared.state.lock().unwrap().log.last_index()
    }

    /// A cloned handle to this node's batcher, independent of the `Node`
    /// itself. Lets a test fire a request that is expected to never
    /// return (the node is about to be cut off) from a detached thread
    /// instead of borrowing the node for as long as the call blocks.
    pub fn batcher_handle(&self) -> BatcherHandle {
        self.batcher.clone()
    }

    /// Stops every background thread and waits for them to exit. Durable
    /// files are flushed by their owning operations as they go, so there
    /// is nothing left to flush here beyond waking anything waiting on
    /// the commit condvar.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.shared.commit_cv.notify_all();
        self.shared.wake_all_peers();
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

/// A minimal newline-delimited text front end: one command per line, one
/// reply per line (`OK <value>` or `ERR`). This is the collaborator named
/// in the external interfaces, not part of the consensus core's tested
/// surface.
fn spawn_client_listener(
    addr: std::net::SocketAddr,
    batcher: BatcherHandle,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, RaftError> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let batcher = batcher.clone();
                    let stop = stop.clone();
                    thread::spawn(move || serve_client(stream, batcher, stop));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(_) => break,
            }
        }
    }))
}

fn serve_client(stream: TcpStream, batcher: BatcherHandle, stop: Arc<AtomicBool>) {
    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while !stop.load(Ordering::Relaxed) {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end().as_bytes().to_vec();
        if command.is_empty() {
            continue;
        }
        let response = batcher.submit(command);
        let line_out = if response.success {
            format!("OK {}\n", response.value)
        } else {
            "ERR\n".to_string()
        };
        if writer.write_all(line_out.as_bytes()).is_err() {
            return;
        }
    }
}
