//! One replication thread per peer (spec §4.3.3, §5: "each peer has at
//! most one in-flight replication at a time, tracked by a guard flag").
//! The thread lives for the node's lifetime; it is a no-op whenever this
//! node is not the leader, and otherwise ticks on the heartbeat interval
//! or an early wake from a freshly appended entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;

use crate::common::{NodeId, RaftError, APPEND_ENTRIES_OPCODE};
use crate::raft_capnp::{append_entries, append_entries_reply};
use crate::rpc::Rpc;

use super::state::{Role, Shared};

/// Spawns the replication thread for `peer_id`. `wake_rx` is this peer's
/// half of the channel [`Shared::wake_peer`] sends on.
pub fn spawn(shared: Arc<Shared>, peer_id: NodeId, wake_rx: Receiver<()>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || run(shared, peer_id, wake_rx, stop))
}

fn run(shared: Arc<Shared>, peer_id: NodeId, wake_rx: Receiver<()>, stop: Arc<AtomicBool>) {
    let in_flight = AtomicBool::new(false);
    while !stop.load(Ordering::Relaxed) && !shared.is_fatal() {
        let _ = wake_rx.recv_timeout(shared.heartbeat_interval);
        if stop.load(Ordering::Relaxed) || shared.is_fatal() {
            return;
        }
        let is_leader = shared.state.lock().unwrap().role == Role::Leader;
        if !is_leader {
            continue;
        }
        if in_flight.swap(true, Ordering::AcqRel) {
            continue;
        }
        replicate_once(&shared, peer_id);
        in_flight.store(false, Ordering::Release);
    }
}

fn mark_fatal_if_err(shared: &Shared, result: Result<(), RaftError>) {
    if let Err(e) = result {
        shared.mark_fatal(&e);
    }
}

/// Takes a snapshot of the tail to send, releases the lock, makes the
/// blocking network call, then re-acquires the lock to interpret the
/// reply (spec §4.3.3 steps 1-5).
fn replicate_once(shared: &Arc<Shared>, peer_id: NodeId) {
    let (term, prev_index, prev_term, entries, leader_commit) = {
        let st = shared.state.lock().unwrap();
        if st.role != Role::Leader {
            return;
        }
        let next = *st.next_index.get(&peer_id).unwrap_or(&1);
        let prev = next.saturating_sub(1);
        let prev_term = st.log.term_at(prev).unwrap_or(0);
        (st.current_term, prev, prev_term, st.log.entries_from(next), st.commit_index)
    };

    let mut rpc = Rpc::new(APPEND_ENTRIES_OPCODE);
    {
        let mut params = rpc.param_builder().init_as::<append_entries::Builder>();
        params.set_term(term);
        params.set_leader_id(shared.id);
        params.set_prev_log_index(prev_index);
        params.set_prev_log_term(prev_term);
        params.set_leader_commit(leader_commit);
        let mut list = params.reborrow().init_entries(entries.len() as u32);
        for (i, e) in entries.iter().enumerate() {
            let mut b = list.reborrow().get(i as u32);
            b.set_term(e.term as i64);
            b.set_command(&e.command);
        }
    }

    let msg = match shared.dial_table.call(peer_id, &rpc) {
        Ok(msg) => msg,
        Err(_) => return, // transient: next tick retries
    };
    let reply = match Rpc::result_reader(&msg).and_then(|r| r.get_as::<append_entries_reply::Reader>().map_err(Into::into)) {
        Ok(r) => r,
        Err(_) => return,
    };

    let mut st = shared.state.lock().unwrap();
    if st.role != Role::Leader || st.current_term != term {
        return; // stale: role or term changed mid-flight, discard (spec §4.3.3 step 5)
    }
    if reply.get_term() > st.current_term {
        mark_fatal_if_err(shared, st.adopt_term(reply.get_term()));
        return;
    }
    if reply.get_success() {
        let matched = prev_index + entries.len() as u64;
        st.match_index.insert(peer_id, matched);
        st.next_index.insert(peer_id, matched + 1);
        shared.try_advance_commit_index(&mut st);
        shared.commit_cv.notify_all();
    } else {
        let cur = *st.next_index.get(&peer_id).unwrap_or(&1);
        st.next_index.insert(peer_id, cur.saturating_sub(1).max(1));
    }
}
