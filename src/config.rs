//! The JSON cluster-topology loader. Out of scope as an engineering
//! concern per the specification (it is a thin collaborator, not part of
//! the consensus core's test surface), but `start` still needs it to
//! build a node's dial-out table and bind its own addresses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::common::{NodeId, RaftError};

/// One entry of the topology file: `{id, ip, port, client_port}`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
    pub client_port: u16,
}

impl NodeInfo {
    pub fn rpc_addr(&self) -> Result<SocketAddr, RaftError> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|e| RaftError::Config(format!("bad rpc address for node {}: {}", self.id, e)))
    }

    pub fn client_addr(&self) -> Result<SocketAddr, RaftError> {
        format!("{}:{}", self.ip, self.client_port)
            .parse()
            .map_err(|e| RaftError::Config(format!("bad client address for node {}: {}", self.id, e)))
    }
}

/// The parsed topology: every node in the cluster, keyed by id.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub nodes: HashMap<NodeId, NodeInfo>,
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<ClusterConfig, RaftError> {
        let contents = std::fs::read_to_string(path)?;
        let parsed: Vec<NodeInfo> = serde_json::from_str(&contents)
            .map_err(|e| RaftError::Config(format!("malformed topology file: {e}")))?;
        if parsed.is_empty() {
            return Err(RaftError::Config("topology file has no nodes".into()));
        }
        let nodes = parsed.into_iter().map(|n| (n.id, n)).collect();
        Ok(ClusterConfig { nodes })
    }

    pub fn peer_addrs(&self, me: NodeId) -> Result<HashMap<NodeId, SocketAddr>, RaftError> {
        self.nodes
            .values()
            .filter(|n| n.id != me)
            .map(|n| Ok((n.id, n.rpc_addr()?)))
            .collect()
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeInfo, RaftError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| RaftError::Config(format!("node {id} not present in topology file")))
    }
}
