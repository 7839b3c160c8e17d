//! The Raft role state machine: RPC handlers (spec §4.3.4-§4.3.7) and the
//! election/heartbeat driver (spec §4.3.1-§4.3.3). Per-peer replication is
//! in [`peer`].

pub mod peer;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use capnp::any_pointer;

use crate::common::{RpcError, REQUEST_VOTE_OPCODE};
use crate::raft_capnp::{append_entries, append_entries_reply, read, read_reply, request_vote, request_vote_reply};
use crate::rpc::server::RpcObject;
use crate::rpc::Rpc;
use crate::storage::log::LogEntry;

pub use state::{RaftState, Role, Shared};

/// Poll interval for the election driver while the node is a leader (it
/// has nothing to do itself — heartbeats are driven by the per-peer
/// replication threads) or waiting out an unexpired election deadline.
const DRIVER_POLL_INTERVAL: Duration = Duration::from_millis(5);

fn persist_or_fatal(shared: &Shared, result: Result<(), crate::common::RaftError>) -> Result<(), RpcError> {
    result.map_err(|e| {
        shared.mark_fatal(&e);
        RpcError::Fatal(e.to_string())
    })
}

/// Handles `AppendEntries` (spec §4.3.4).
pub struct AppendEntriesHandler {
    pub shared: Arc<Shared>,
}

impl RpcObject for AppendEntriesHandler {
    fn handle_rpc(&self, params: any_pointer::Reader, result: any_pointer::Builder) -> Result<(), RpcError> {
        let args = params.get_as::<append_entries::Reader>().map_err(RpcError::Capnp)?;
        let mut reply = result.init_as::<append_entries_reply::Builder>();
        let mut st = self.shared.state.lock().unwrap();

        if args.get_term() > st.current_term {
            persist_or_fatal(&self.shared, st.adopt_term(args.get_term()))?;
        }
        if args.get_term() < st.current_term {
            reply.set_term(st.current_term);
            reply.set_success(false);
            return Ok(());
        }
        if st.role == Role::Candidate {
            st.role = Role::Follower;
        }

        let prev_index = args.get_prev_log_index();
        let prev_term_ok = st.log.term_at(prev_index) == Some(args.get_prev_log_term());
        if prev_index > st.log.last_index() || !prev_term_ok {
            reply.set_term(st.current_term);
            reply.set_success(false);
            st.reset_election_deadline(self.shared.election_timeout_range);
            return Ok(());
        }

        let incoming = args.get_entries().map_err(RpcError::Capnp)?;
        let mut conflict_at = None;
        for (k, entry) in incoming.iter().enumerate() {
            let index = prev_index + 1 + k as u64;
            let term = entry.get_term() as u64;
            if let Some(existing_term) = st.log.term_at(index) {
                if existing_term != term {
                    conflict_at = Some(index);
                    break;
                }
            }
        }
        if let Some(index) = conflict_at {
            st.log.truncate(index);
            persist_or_fatal(&self.shared, st.storage.truncate((index - 1) as usize).map_err(Into::into))?;
            let stale: Vec<u64> = st.pending_responses.keys().copied().filter(|&i| i >= index).collect();
            for i in stale {
                if let Some(tx) = st.pending_responses.remove(&i) {
                    let _ = tx.send(crate::state_machine::Response { success: false, value: String::new() });
                }
            }
        }

        let start = st.log.last_index() + 1;
        let mut new_entries = Vec::new();
        for k in 0..incoming.len() {
            let index = prev_index + 1 + k as u64;
            if index < start {
                continue;
            }
            let entry = incoming.get(k);
            let command = entry.get_command().map_err(RpcError::Capnp)?.to_vec();
            new_entries.push(LogEntry { term: entry.get_term() as u64, command });
        }
        if !new_entries.is_empty() {
            persist_or_fatal(&self.shared, st.storage.append_entries(&new_entries).map_err(Into::into))?;
            st.log.append_all(new_entries);
        }

        let leader_commit = args.get_leader_commit();
        if leader_commit > st.commit_index {
            st.commit_index = leader_commit.min(st.log.last_index());
            self.shared.commit_cv.notify_all();
        }

        reply.set_term(st.current_term);
        reply.set_success(true);
        st.reset_election_deadline(self.shared.election_timeout_range);
        Ok(())
    }
}

/// Handles `RequestVote` (spec §4.3.5).
pub struct RequestVoteHandler {
    pub shared: Arc<Shared>,
}

impl RpcObject for RequestVoteHandler {
    fn handle_rpc(&self, params: any_pointer::Reader, result: any_pointer::Builder) -> Result<(), RpcError> {
        let args = params.get_as::<request_vote::Reader>().map_err(RpcError::Capnp)?;
        let mut reply = result.init_as::<request_vote_reply::Builder>();
        let mut st = self.shared.state.lock().unwrap();

        if args.get_term() > st.current_term {
            persist_or_fatal(&self.shared, st.adopt_term(args.get_term()))?;
        }
        if args.get_term() < st.current_term {
            reply.set_term(st.current_term);
            reply.set_vote_granted(false);
            return Ok(());
        }

        let candidate = args.get_candidate_id();
        let already_voted_elsewhere = matches!(st.voted_for, Some(v) if v != candidate);
        let fresh = st.log.is_candidate_log_fresh(args.get_last_log_term(), args.get_last_log_index());
        let grant = !already_voted_elsewhere && fresh;

        if grant {
            st.voted_for = Some(candidate);
            persist_or_fatal(&self.shared, st.persist())?;
            st.reset_election_deadline(self.shared.election_timeout_range);
        }
        reply.set_term(st.current_term);
        reply.set_vote_granted(grant);
        Ok(())
    }
}

/// Handles the no-op `Read` RPC used for linearisable reads (spec §4.3.7).
pub struct ReadHandler {
    pub shared: Arc<Shared>,
}

impl RpcObject for ReadHandler {
    fn handle_rpc(&self, params: any_pointer::Reader, result: any_pointer::Builder) -> Result<(), RpcError> {
        let args = params.get_as::<read::Reader>().map_err(RpcError::Capnp)?;
        let mut reply = result.init_as::<read_reply::Builder>();
        let mut st = self.shared.state.lock().unwrap();

        if args.get_term() < st.current_term {
            reply.set_term(st.current_term);
            reply.set_success(false);
            return Ok(());
        }
        if args.get_term() > st.current_term {
            persist_or_fatal(&self.shared, st.adopt_term(args.get_term()))?;
        }
        reply.set_term(st.current_term);
        reply.set_success(true);
        st.reset_election_deadline(self.shared.election_timeout_range);
        Ok(())
    }
}

/// Runs forever (until `stop` is set) driving the Follower→Candidate→
/// Leader lifecycle. Heartbeats themselves are sent by the per-peer
/// replication threads in [`peer`]; this loop only watches the election
/// deadline and runs elections.
pub fn run_election_driver(shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) && !shared.is_fatal() {
        let timed_out = {
            let st = shared.state.lock().unwrap();
            match st.role {
                Role::Leader => false,
                Role::Follower | Role::Candidate => st.election_timed_out(),
            }
        };
        if timed_out {
            start_election(&shared, &stop);
        } else {
            thread::sleep(DRIVER_POLL_INTERVAL);
        }
    }
}

fn start_election(shared: &Arc<Shared>, stop: &Arc<AtomicBool>) {
    let (term, last_log_index, last_log_term) = {
        let mut st = shared.state.lock().unwrap();
        if let Err(e) = st.transition_to_candidate(shared.id, shared.election_timeout_range) {
            shared.mark_fatal(&e);
            return;
        }
        log::info!("[Node: {} Term: {}] starting election", shared.id, st.current_term);
        (st.current_term, st.log.last_index(), st.log.last_term())
    };

    let (tx, rx) = mpsc::channel::<bool>();
    for peer_id in shared.peer_ids.clone() {
        let shared = shared.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            let mut rpc = Rpc::new(REQUEST_VOTE_OPCODE);
            {
                let mut params = rpc.param_builder().init_as::<request_vote::Builder>();
                params.set_term(term);
                params.set_candidate_id(shared.id);
                params.set_last_log_index(last_log_index);
                params.set_last_log_term(last_log_term);
            }
            let granted = match shared.dial_table.call(peer_id, &rpc) {
                Ok(msg) => match Rpc::result_reader(&msg).and_then(|r| r.get_as::<request_vote_reply::Reader>().map_err(RpcError::Capnp)) {
                    Ok(reply) => {
                        if reply.get_term() > term {
                            let mut st = shared.state.lock().unwrap();
                            if reply.get_term() > st.current_term {
                                let _ = st.adopt_term(reply.get_term());
                            }
                        }
                        reply.get_vote_granted()
                    }
                    Err(_) => false,
                },
                Err(_) => false,
            };
            let _ = tx.send(granted);
        });
    }
    drop(tx);

    let quorum = shared.quorum_size();
    let mut votes = 1; // self
    let deadline = std::time::Instant::now() + shared.election_timeout_range.0;
    while votes < quorum && std::time::Instant::now() < deadline {
        if stop.load(Ordering::Relaxed) || shared.is_fatal() {
            return;
        }
        {
            let st = shared.state.lock().unwrap();
            if st.role != Role::Candidate || st.current_term != term {
                return; // someone else's RPC already moved us on
            }
        }
        match rx.recv_timeout(Duration::from_millis(5)) {
            Ok(true) => votes += 1,
            Ok(false) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    if votes >= quorum {
        let mut st = shared.state.lock().unwrap();
        if st.role == Role::Candidate && st.current_term == term {
            log::info!("[Node: {} Term: {}] elected leader", shared.id, st.current_term);
            st.transition_to_leader(&shared.peer_ids);
            drop(st);
            shared.wake_all_peers();
        }
    }
}
