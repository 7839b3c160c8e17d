//! Outbound side of the transport: a dial-out table keyed by peer id,
//! holding one persistent TCP connection per peer. A connection that
//! errors is dropped from the table; the next call to that peer re-dials
//! lazily (there is no background reconnect loop).

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;

use capnp::message::Reader;
use capnp::serialize::OwnedSegments;

use crate::common::{NodeId, RpcError};
use super::Rpc;

struct Connection {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Connection {
    fn dial(addr: SocketAddr) -> Result<Connection, RpcError> {
        let stream = TcpStream::connect(addr).map_err(RpcError::Dial)?;
        let _ = stream.set_nodelay(true);
        let reader_stream = stream.try_clone().map_err(RpcError::Dial)?;
        Ok(Connection { writer: stream, reader: BufReader::new(reader_stream) })
    }
}

pub struct DialTable {
    addrs: HashMap<NodeId, SocketAddr>,
    conns: HashMap<NodeId, Mutex<Option<Connection>>>,
}

impl DialTable {
    pub fn new(addrs: HashMap<NodeId, SocketAddr>) -> DialTable {
        let conns = addrs.keys().map(|&id| (id, Mutex::new(None))).collect();
        DialTable { addrs, conns }
    }

    /// Sends `rpc` to `peer`, dialing (or re-dialing) as needed. Any
    /// failure drops the connection from the table so the next call
    /// re-dials; the caller must treat this as "RPC failed", never as a
    /// `success: false` reply.
    pub fn call(&self, peer: NodeId, rpc: &Rpc) -> Result<Reader<OwnedSegments>, RpcError> {
        let addr = *self.addrs.get(&peer).ok_or(RpcError::UnknownPeer)?;
        let slot = self.conns.get(&peer).ok_or(RpcError::UnknownPeer)?;
        let mut guard = slot.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Connection::dial(addr)?);
        }
        let conn = guard.as_mut().expect("just dialed");
        match rpc.send(&mut conn.writer, &mut conn.reader) {
            Ok(msg) => Ok(msg),
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }
}
