//! The batcher (spec §4.4): the single entry point from the client path
//! into the log. Two independent buckets — write and read — each with
//! its own size threshold and linger timer; whichever fires first for a
//! bucket triggers its flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::common::{RpcError, NodeId, READ_OPCODE};
use crate::consensus::state::{Role, Shared};
use crate::raft_capnp::{read, read_reply};
use crate::rpc::Rpc;
use crate::state_machine::Response;
use crate::storage::log::LogEntry;

struct ClientRequest {
    command: Vec<u8>,
    respond_to: Sender<Response>,
}

/// The client-facing handle: `submit` blocks the caller until the
/// applier (for a write) or the quorum-read path (for a read) delivers
/// a response.
#[derive(Clone)]
pub struct BatcherHandle {
    submit_tx: Sender<ClientRequest>,
}

impl BatcherHandle {
    pub fn submit(&self, command: Vec<u8>) -> Response {
        let (tx, rx) = mpsc::channel();
        if self.submit_tx.send(ClientRequest { command, respond_to: tx }).is_err() {
            return Response { success: false, value: String::new() };
        }
        rx.recv().unwrap_or(Response { success: false, value: String::new() })
    }
}

pub struct BatcherConfig {
    pub write_batch_size: usize,
    pub read_batch_size: usize,
    pub linger: Duration,
}

pub fn spawn(shared: Arc<Shared>, config: BatcherConfig, stop: Arc<AtomicBool>) -> (BatcherHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || run(shared, rx, config, stop));
    (BatcherHandle { submit_tx: tx }, handle)
}

fn is_read(command: &[u8]) -> bool {
    command.split(|&b| b == b' ' || b == b'\t').find(|tok| !tok.is_empty()).map(|tok| tok == b"GET").unwrap_or(false)
}

fn run(shared: Arc<Shared>, rx: Receiver<ClientRequest>, config: BatcherConfig, stop: Arc<AtomicBool>) {
    let mut writes: Vec<ClientRequest> = Vec::new();
    let mut reads: Vec<ClientRequest> = Vec::new();
    let mut write_deadline: Option<Instant> = None;
    let mut read_deadline: Option<Instant> = None;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let wait = next_wait(write_deadline, read_deadline);
        match rx.recv_timeout(wait) {
            Ok(req) => {
                if is_read(&req.command) {
                    if reads.is_empty() {
                        read_deadline = Some(Instant::now() + config.linger);
                    }
                    reads.push(req);
                    if reads.len() >= config.read_batch_size {
                        flush_reads(&shared, std::mem::take(&mut reads));
                        read_deadline = None;
                    }
                } else {
                    if writes.is_empty() {
                        write_deadline = Some(Instant::now() + config.linger);
                    }
                    writes.push(req);
                    if writes.len() >= config.write_batch_size {
                        flush_writes(&shared, std::mem::take(&mut writes));
                        write_deadline = None;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                if !writes.is_empty() && write_deadline.is_some_and(|d| now >= d) {
                    flush_writes(&shared, std::mem::take(&mut writes));
                    write_deadline = None;
                }
                if !reads.is_empty() && read_deadline.is_some_and(|d| now >= d) {
                    flush_reads(&shared, std::mem::take(&mut reads));
                    read_deadline = None;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn next_wait(write_deadline: Option<Instant>, read_deadline: Option<Instant>) -> Duration {
    let now = Instant::now();
    let candidates = [write_deadline, read_deadline].into_iter().flatten().map(|d| d.saturating_duration_since(now));
    candidates.min().unwrap_or(Duration::from_millis(50))
}

/// Appends the whole batch to the log and durable store in one call,
/// records a pending-response entry per request, and wakes every peer's
/// replication thread (spec §4.4 "on write-bucket flush").
fn flush_writes(shared: &Arc<Shared>, batch: Vec<ClientRequest>) {
    let mut st = shared.state.lock().unwrap();
    if st.role != Role::Leader {
        drop(st);
        for req in batch {
            let _ = req.respond_to.send(Response { success: false, value: String::new() });
        }
        return;
    }
    let term = st.current_term;
    let mut next_index = st.log.last_index() + 1;
    let mut entries = Vec::with_capacity(batch.len());
    let mut senders = Vec::with_capacity(batch.len());
    for req in batch {
        entries.push(LogEntry { term, command: req.command });
        senders.push((next_index, req.respond_to));
        next_index += 1;
    }

    if let Err(e) = st.storage.append_entries(&entries) {
        shared.mark_fatal(&e);
        for (_, tx) in senders {
            let _ = tx.send(Response { success: false, value: String::new() });
        }
        return;
    }
    st.log.append_all(entries);
    for (index, tx) in senders {
        st.pending_responses.insert(index, tx);
    }
    drop(st);
    shared.wake_all_peers();
}

/// Runs one read-quorum round (spec §4.3.7) and resolves every request
/// in the batch from the result.
fn flush_reads(shared: &Arc<Shared>, batch: Vec<ClientRequest>) {
    let (term, is_leader) = {
        let st = shared.state.lock().unwrap();
        (st.current_term, st.role == Role::Leader)
    };

    let confirmed = is_leader && run_read_quorum(shared, term);

    for req in batch {
        let response = if confirmed {
            match extract_get_key(&req.command) {
                Some(key) => shared.machine.lock().unwrap().get(&key),
                None => Response { success: false, value: String::new() },
            }
        } else {
            Response { success: false, value: String::new() }
        };
        let _ = req.respond_to.send(response);
    }
}

fn extract_get_key(command: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(command).ok()?;
    let mut parts = text.split_whitespace();
    if parts.next()? != "GET" {
        return None;
    }
    parts.next().map(|s| s.to_string())
}

/// Sends a no-op Read RPC to every peer and waits for a majority
/// (including self) to acknowledge within `read_quorum_timeout`, or for
/// a role/term change to make the round moot.
fn run_read_quorum(shared: &Arc<Shared>, term: u64) -> bool {
    let (tx, rx) = mpsc::channel::<bool>();
    for peer_id in shared.peer_ids.clone() {
        let shared = shared.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            let granted = send_read(&shared, peer_id, term);
            let _ = tx.send(granted);
        });
    }
    drop(tx);

    let quorum = shared.quorum_size();
    let mut acks = 1; // self
    let deadline = Instant::now() + shared.read_quorum_timeout;
    while acks < quorum && Instant::now() < deadline {
        {
            let st = shared.state.lock().unwrap();
            if st.role != Role::Leader || st.current_term != term {
                return false;
            }
        }
        match rx.recv_timeout(Duration::from_millis(5)) {
            Ok(true) => acks += 1,
            Ok(false) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    acks >= quorum
}

fn send_read(shared: &Shared, peer_id: NodeId, term: u64) -> bool {
    let mut rpc = Rpc::new(READ_OPCODE);
    {
        let mut params = rpc.param_builder().init_as::<read::Builder>();
        params.set_term(term);
        params.set_leader_id(shared.id);
    }
    match shared.dial_table.call(peer_id, &rpc) {
        Ok(msg) => match Rpc::result_reader(&msg).and_then(|r| r.get_as::<read_reply::Reader>().map_err(RpcError::Capnp)) {
            Ok(reply) => reply.get_success(),
            Err(_) => false,
        },
        Err(_) => false,
    }
}
