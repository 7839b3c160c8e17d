//! End-to-end scenarios over in-process multi-node clusters, each node
//! bound to a loopback port with its own temp directory for durable
//! state, per the multi-node test-harness requirement.

use std::collections::HashMap;
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use raft::config::{ClusterConfig, NodeInfo};
use raft::node::NodeOptions;
use raft::state_machine::Response;
use raft::Node;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn topology(ids: &[u64]) -> ClusterConfig {
    let nodes = ids
        .iter()
        .map(|&id| {
            (
                id,
                NodeInfo { id, ip: "127.0.0.1".to_string(), port: free_port(), client_port: free_port() },
            )
        })
        .collect();
    ClusterConfig { nodes }
}

struct Cluster {
    nodes: Vec<Node>,
    cluster: ClusterConfig,
    dirs: HashMap<u64, tempfile::TempDir>,
}

impl Cluster {
    fn start(n: u64) -> Cluster {
        let ids: Vec<u64> = (1..=n).collect();
        let cluster = topology(&ids);
        let mut nodes = Vec::new();
        let mut dirs = HashMap::new();
        for &id in &ids {
            let dir = tempfile::tempdir().unwrap();
            let options = NodeOptions::new(id, dir.path().to_path_buf());
            nodes.push(Node::new(options, &cluster).unwrap());
            dirs.insert(id, dir);
        }
        Cluster { nodes, cluster, dirs }
    }

    fn await_leader(&self, timeout: Duration) -> &Node {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(n) = self.nodes.iter().find(|n| n.is_leader()) {
                return n;
            }
            assert!(Instant::now() < deadline, "no leader elected within {timeout:?}");
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn await_convergence(&self, key: &str, want: &Response, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.nodes.iter().all(|n| &n.debug_get(key) == want) {
                return;
            }
            assert!(Instant::now() < deadline, "replicas never converged on {key}");
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn remove(&mut self, id: u64) -> Node {
        let idx = self.nodes.iter().position(|n| n.id() == id).unwrap();
        self.nodes.remove(idx)
    }

    fn restart(&mut self, id: u64) {
        let dir = self.dirs.get(&id).unwrap();
        let options = NodeOptions::new(id, dir.path().to_path_buf());
        let node = Node::new(options, &self.cluster).unwrap();
        self.nodes.push(node);
    }

    fn shutdown(self) {
        for node in self.nodes {
            node.shutdown();
        }
    }
}

fn ok(value: &str) -> Response {
    Response { success: true, value: value.to_string() }
}

#[test]
fn single_leader_commit() {
    let cluster = Cluster::start(3);
    let leader = cluster.await_leader(Duration::from_secs(3));

    let response = leader.submit(b"SET x value7".to_vec());
    assert!(response.success);

    cluster.await_convergence("x", &ok("value7"), Duration::from_secs(2));
    cluster.shutdown();
}

#[test]
fn leader_crash_and_recovery() {
    let mut cluster = Cluster::start(3);
    let leader_id = cluster.await_leader(Duration::from_secs(3)).id();
    let response = cluster.nodes.iter().find(|n| n.id() == leader_id).unwrap().submit(b"SET a 1".to_vec());
    assert!(response.success);
    cluster.await_convergence("a", &ok("1"), Duration::from_secs(2));

    let crashed = cluster.remove(leader_id);
    crashed.shutdown();

    let new_leader = cluster.await_leader(Duration::from_secs(3));
    assert_ne!(new_leader.id(), leader_id);
    let response = new_leader.submit(b"GET a".to_vec());
    assert!(response.success);
    assert_eq!(response.value, "1");

    cluster.restart(leader_id);
    cluster.await_convergence("a", &ok("1"), Duration::from_secs(3));
    cluster.shutdown();
}

#[test]
fn read_freshness_with_a_reachable_majority() {
    let cluster = Cluster::start(3);
    let leader = cluster.await_leader(Duration::from_secs(3));
    assert!(leader.submit(b"SET k v".to_vec()).success);

    // Quiescent period with no further writes, then a read: the leader
    // must still confirm freshness via a Read round before answering.
    thread::sleep(Duration::from_millis(100));
    let response = leader.submit(b"GET k".to_vec());
    assert!(response.success);
    assert_eq!(response.value, "v");
    cluster.shutdown();
}

#[test]
fn followers_refuse_writes_and_reads_directly() {
    let cluster = Cluster::start(3);
    let leader_id = cluster.await_leader(Duration::from_secs(3)).id();
    let follower = cluster.nodes.iter().find(|n| n.id() != leader_id).unwrap();

    assert!(!follower.submit(b"SET k v".to_vec()).success);
    assert!(!follower.submit(b"GET k".to_vec()).success);
    cluster.shutdown();
}

#[test]
fn batched_write_ordering_is_preserved() {
    let cluster = Cluster::start(3);
    let leader = cluster.await_leader(Duration::from_secs(3));

    assert!(leader.submit(b"SET k 1".to_vec()).success);
    assert!(leader.submit(b"SET k 2".to_vec()).success);
    assert!(leader.submit(b"SET k 3".to_vec()).success);

    cluster.await_convergence("k", &ok("3"), Duration::from_secs(2));
    cluster.shutdown();
}

#[test]
fn durable_vote_survives_a_restart() {
    let cluster = Cluster::start(3);
    // Let an election happen once so every node has persisted a vote,
    // then crash and restart the whole cluster from the same data
    // directories and confirm nobody double-votes in an already-seen
    // term (the durable vote is reloaded, not reset to NONE).
    let leader_id = cluster.await_leader(Duration::from_secs(3)).id();
    let mut cluster = cluster;
    let ids: Vec<u64> = cluster.nodes.iter().map(|n| n.id()).collect();
    for &id in &ids {
        let n = cluster.remove(id);
        n.shutdown();
    }
    for &id in &ids {
        cluster.restart(id);
    }

    // The core property (spec §8 scenario 5): a node that persisted
    // `votedFor = leader_id` in term T refuses a second candidate's
    // RequestVote in that same term T. Probe this directly over the wire
    // against a freshly restarted follower, before any new election in
    // this process has a chance to bump its term.
    let follower_id = ids.iter().copied().find(|&id| id != leader_id).unwrap();
    let follower_term = cluster.nodes.iter().find(|n| n.id() == follower_id).unwrap().debug_current_term();
    let impostor_id = ids.iter().copied().find(|&id| id != leader_id && id != follower_id).unwrap();
    let follower_addr = cluster.cluster.node(follower_id).unwrap().rpc_addr().unwrap();

    let mut rpc = raft::rpc::Rpc::new(raft::common::REQUEST_VOTE_OPCODE);
    {
        let mut params = rpc.param_builder().init_as::<raft::raft_capnp::request_vote::Builder>();
        params.set_term(follower_term);
        params.set_candidate_id(impostor_id);
        params.set_last_log_index(0);
        params.set_last_log_term(0);
    }
    let stream = std::net::TcpStream::connect(follower_addr).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = std::io::BufReader::new(stream);
    let msg = rpc.send(&mut writer, &mut reader).unwrap();
    let result = raft::rpc::Rpc::result_reader(&msg).unwrap();
    let reply = result.get_as::<raft::raft_capnp::request_vote_reply::Reader>().unwrap();
    assert!(!reply.get_vote_granted(), "a node must not grant a second vote in a term it already voted in");
    assert_eq!(reply.get_term(), follower_term, "a same-term vote refusal must not bump the term");

    let leader = cluster.await_leader(Duration::from_secs(5));
    assert!(leader.submit(b"SET z 9".to_vec()).success);
    cluster.await_convergence("z", &ok("9"), Duration::from_secs(2));
    cluster.shutdown();
}

#[test]
fn conflicting_tail_is_truncated_after_partition_heals() {
    let mut cluster = Cluster::start(3);
    let leader_id = cluster.await_leader(Duration::from_secs(3)).id();

    let initial = cluster.nodes.iter().find(|n| n.id() == leader_id).unwrap().submit(b"SET x original".to_vec());
    assert!(initial.success);
    cluster.await_convergence("x", &ok("original"), Duration::from_secs(2));

    // Append an entry on the leader that will never replicate or commit:
    // fire it from a detached thread (it will block forever, since no
    // response is ever coming) and only wait for the append itself to
    // land on the leader's own log before cutting it off.
    let (before_index, handle) = {
        let leader = cluster.nodes.iter().find(|n| n.id() == leader_id).unwrap();
        (leader.debug_last_log_index(), leader.batcher_handle())
    };
    thread::spawn(move || {
        let _ = handle.submit(b"SET x bad".to_vec());
    });
    {
        let leader = cluster.nodes.iter().find(|n| n.id() == leader_id).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while leader.debug_last_log_index() <= before_index {
            assert!(Instant::now() < deadline, "leader never appended the doomed entry");
            thread::sleep(Duration::from_millis(2));
        }
    }

    // "Partition": this harness has no network-partition primitive, so as
    // in `leader_crash_and_recovery`, shutting the node down produces the
    // same externally observable effect on the remaining majority (it is
    // unreachable, so it re-elects) while the old leader's durable files —
    // including the doomed, uncommitted entry — survive on disk for it to
    // reload on "reconnection" (restart).
    let crashed = cluster.remove(leader_id);
    crashed.shutdown();

    let new_leader = cluster.await_leader(Duration::from_secs(3));
    assert_ne!(new_leader.id(), leader_id);
    assert!(new_leader.submit(b"SET x good".to_vec()).success);
    cluster.await_convergence("x", &ok("good"), Duration::from_secs(2));

    // Heal the partition: the old leader reconnects with a conflicting
    // entry at the index the new leader has since committed a different
    // entry for. It must truncate its own entry and adopt the winner's
    // (the conflict-detection path in `AppendEntriesHandler`).
    cluster.restart(leader_id);
    cluster.await_convergence("x", &ok("good"), Duration::from_secs(3));
    cluster.shutdown();
}
