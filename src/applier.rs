//! The committed-entry consumer (spec §4.5): a single thread that walks
//! `lastApplied` up to `commitIndex` strictly in order, applying each
//! entry to the key-value state machine and delivering the response to
//! whichever client is waiting on it, if any.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::consensus::state::Shared;

pub fn spawn(shared: Arc<Shared>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || run(shared, stop))
}

fn run(shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    loop {
        let mut st = shared.state.lock().unwrap();
        while st.last_applied >= st.commit_index {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            // Bounded wait so we notice shutdown/fatal even if no commit
            // ever arrives again.
            let (guard, _timeout) = shared.commit_cv.wait_timeout(st, std::time::Duration::from_millis(50)).unwrap();
            st = guard;
            if shared.is_fatal() {
                return;
            }
        }

        let next = st.last_applied + 1;
        let entry = st.log.get(next).cloned();
        let is_leader = st.role == crate::consensus::state::Role::Leader;
        let waiter = st.pending_responses.remove(&next);
        drop(st);

        let Some(entry) = entry else {
            // Should not happen (commit_index never exceeds last_log_index)
            // but guards against applying past the tail.
            continue;
        };
        let response = {
            let mut machine = shared.machine.lock().unwrap();
            machine.apply(&entry.command)
        };
        if is_leader {
            if let Some(tx) = waiter {
                let _ = tx.send(response);
            }
        }

        shared.state.lock().unwrap().last_applied = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::state::{RaftState, Role};
    use crate::rpc::client::DialTable;
    use crate::storage::log::{LogEntry, ReplicatedLog};
    use crate::storage::DurableStore;
    use std::collections::HashMap;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn shared_with_committed_entries(dir: &tempfile::TempDir, commands: &[&[u8]]) -> Arc<Shared> {
        let storage = DurableStore::open(1, dir.path(), false).unwrap();
        let mut log = ReplicatedLog::new();
        for c in commands {
            log.append(LogEntry { term: 1, command: c.to_vec() });
        }
        let commit_index = log.last_index();
        let state = RaftState {
            role: Role::Leader,
            current_term: 1,
            voted_for: Some(1),
            log,
            commit_index,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            pending_responses: HashMap::new(),
            election_deadline: Instant::now() + Duration::from_secs(10),
            storage,
        };
        Arc::new(Shared::new(
            1,
            vec![],
            state,
            DialTable::new(HashMap::new()),
            (Duration::from_millis(150), Duration::from_millis(200)),
            Duration::from_millis(10),
            Duration::from_millis(500),
            HashMap::new(),
        ))
    }

    #[test]
    fn applies_entries_in_order_and_advances_last_applied() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_with_committed_entries(&dir, &[b"SET k 1", b"SET k 2", b"GET k"]);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn(shared.clone(), stop.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while shared.state.lock().unwrap().last_applied < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(shared.state.lock().unwrap().last_applied, 3);
        assert_eq!(shared.machine.lock().unwrap().get("k"), crate::state_machine::Response { success: true, value: "2".into() });

        stop.store(true, Ordering::Relaxed);
        shared.commit_cv.notify_all();
        handle.join().unwrap();
    }

    #[test]
    fn delivers_response_through_pending_channel_when_leader() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_with_committed_entries(&dir, &[b"SET k v"]);
        let (tx, rx) = mpsc::channel();
        shared.state.lock().unwrap().pending_responses.insert(1, tx);

        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn(shared.clone(), stop.clone());
        let response = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(response.success);

        stop.store(true, Ordering::Relaxed);
        shared.commit_cv.notify_all();
        handle.join().unwrap();
    }
}
