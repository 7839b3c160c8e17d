//! The Raft control block (spec §3, §5): the single piece of state
//! guarded by one coarse mutex, shared by the RPC handlers, the
//! election/heartbeat driver, the per-peer replication threads, the
//! batcher, and the applier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::common::{NodeId, RaftError};
use crate::rpc::client::DialTable;
use crate::state_machine::Response;
use crate::storage::log::ReplicatedLog;
use crate::storage::DurableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Everything the safety invariants of spec §3 talk about, in one place.
pub struct RaftState {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: ReplicatedLog,
    pub commit_index: u64,
    pub last_applied: u64,
    pub next_index: HashMap<NodeId, u64>,
    pub match_index: HashMap<NodeId, u64>,
    pub pending_responses: HashMap<u64, Sender<Response>>,
    pub election_deadline: Instant,
    pub storage: DurableStore,
}

impl RaftState {
    /// Persists `(currentTerm, votedFor)`. Per the durability invariant
    /// this must complete before any RPC reply that depends on it.
    pub fn persist(&mut self) -> Result<(), RaftError> {
        Ok(self.storage.save_state(self.current_term, self.voted_for)?)
    }

    /// Adopts a higher term observed on an incoming or outgoing RPC,
    /// stepping down to Follower and clearing the vote. Any client still
    /// waiting on this node as leader gets a failure response: a demoted
    /// leader can no longer promise delivery for its pending writes
    /// (spec §7, "leader demotion before commit").
    pub fn adopt_term(&mut self, term: u64) -> Result<(), RaftError> {
        debug_assert!(term > self.current_term);
        self.current_term = term;
        self.voted_for = None;
        self.role = Role::Follower;
        self.fail_all_pending();
        self.persist()
    }

    fn fail_all_pending(&mut self) {
        for (_, tx) in self.pending_responses.drain() {
            let _ = tx.send(Response { success: false, value: String::new() });
        }
    }

    pub fn transition_to_candidate(&mut self, me: NodeId, timeout_range: (Duration, Duration)) -> Result<(), RaftError> {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(me);
        self.persist()?;
        self.reset_election_deadline(timeout_range);
        Ok(())
    }

    pub fn transition_to_leader(&mut self, peers: &[NodeId]) {
        self.role = Role::Leader;
        let next = self.log.last_index() + 1;
        for &p in peers {
            self.next_index.insert(p, next);
            self.match_index.insert(p, 0);
        }
    }

    pub fn reset_election_deadline(&mut self, timeout_range: (Duration, Duration)) {
        let (min, max) = timeout_range;
        let timeout = if max > min {
            min + rand::thread_rng().gen_range(Duration::ZERO..(max - min))
        } else {
            min
        };
        self.election_deadline = Instant::now() + timeout;
    }

    pub fn election_timed_out(&self) -> bool {
        Instant::now() >= self.election_deadline
    }
}

/// The shared handle every task clones (`Arc<Shared>`): the mutex-guarded
/// [`RaftState`], a condvar signalled whenever `commit_index` advances,
/// the KV state machine (mutated only by the applier, but readable by the
/// quorum-read path), and everything needed to talk to peers.
pub struct Shared {
    pub id: NodeId,
    pub peer_ids: Vec<NodeId>,
    pub state: Mutex<RaftState>,
    pub commit_cv: Condvar,
    pub machine: Mutex<crate::state_machine::KeyValueStateMachine>,
    pub dial_table: DialTable,
    pub election_timeout_range: (Duration, Duration),
    pub heartbeat_interval: Duration,
    pub read_quorum_timeout: Duration,
    /// One non-blocking wake channel per peer, used to nudge that peer's
    /// replication thread immediately instead of waiting for the next
    /// heartbeat tick (spec §4.3.3: "or immediately when a new entry is
    /// appended locally").
    peer_wakers: HashMap<NodeId, Sender<()>>,
    fatal: AtomicBool,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        peer_ids: Vec<NodeId>,
        state: RaftState,
        dial_table: DialTable,
        election_timeout_range: (Duration, Duration),
        heartbeat_interval: Duration,
        read_quorum_timeout: Duration,
        peer_wakers: HashMap<NodeId, Sender<()>>,
    ) -> Shared {
        Shared {
            id,
            peer_ids,
            state: Mutex::new(state),
            commit_cv: Condvar::new(),
            machine: Mutex::new(crate::state_machine::KeyValueStateMachine::new()),
            dial_table,
            election_timeout_range,
            heartbeat_interval,
            read_quorum_timeout,
            peer_wakers,
            fatal: AtomicBool::new(false),
        }
    }

    /// Nudges `peer`'s replication thread. Non-blocking: if a wake is
    /// already pending the send is simply dropped, which is fine since
    /// the effect (replicate soon) is idempotent.
    pub fn wake_peer(&self, peer: NodeId) {
        if let Some(tx) = self.peer_wakers.get(&peer) {
            let _ = tx.send(());
        }
    }

    pub fn wake_all_peers(&self) {
        for &p in &self.peer_ids {
            self.wake_peer(p);
        }
    }

    pub fn quorum_size(&self) -> usize {
        (self.peer_ids.len() + 1) / 2 + 1
    }

    /// Marks the node as having observed a fatal durable-store failure.
    /// Checked by the driver loops so the node stops participating in
    /// the cluster rather than silently diverging.
    pub fn mark_fatal(&self, err: impl std::fmt::Display) {
        log::error!("[Node: {}] fatal error, node must shut down: {}", self.id, err);
        self.fatal.store(true, Ordering::SeqCst);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Advances `commit_index` to the highest index N such that
    /// `log[N].term == currentTerm` and a majority of match_index
    /// (including self) are `>= N`. Never commits a prior-term entry by
    /// matchIndex alone (spec §4.3.6).
    pub fn try_advance_commit_index(&self, state: &mut RaftState) {
        if state.role != Role::Leader {
            return;
        }
        let quorum = self.quorum_size();
        let last_index = state.log.last_index();
        let mut n = state.commit_index + 1;
        while n <= last_index {
            if state.log.term_at(n) == Some(state.current_term) {
                let mut count = 1; // the leader itself always matches its own log
                for &p in &self.peer_ids {
                    if *state.match_index.get(&p).unwrap_or(&0) >= n {
                        count += 1;
                    }
                }
                if count >= quorum {
                    state.commit_index = n;
                }
            }
            n += 1;
        }
    }
}
