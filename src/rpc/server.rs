//! Inbound side of the transport: accepts persistent TCP connections and
//! dispatches each request on them, in order, to the [`RpcObject`]
//! registered for its opcode.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use capnp::any_pointer;
use capnp::message;

use crate::common::RpcError;
use crate::rpc_capnp::rpc_response;

/// A handler for one opcode. `params`/`result` are the AnyPointer slots
/// of the envelope; implementors cast them to the concrete capnp struct
/// for the RPC they serve (e.g. `append_entries::Reader`).
pub trait RpcObject: Send + Sync {
    fn handle_rpc(&self, params: any_pointer::Reader, result: any_pointer::Builder) -> Result<(), RpcError>;
}

pub struct RpcServer {
    services: Arc<HashMap<i16, Box<dyn RpcObject>>>,
    listener: Option<TcpListener>,
}

impl RpcServer {
    pub fn new_with_services(services: Vec<(i16, Box<dyn RpcObject>)>) -> RpcServer {
        RpcServer { services: Arc::new(services.into_iter().collect()), listener: None }
    }

    pub fn bind(&mut self, addr: SocketAddr) -> std::io::Result<()> {
        self.listener = Some(TcpListener::bind(addr)?);
        Ok(())
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.as_ref().expect("bind() not called").local_addr()
    }

    /// Spawns the accept loop on a background thread; each accepted
    /// connection gets its own handler thread so one slow peer cannot
    /// block another. The listener is polled non-blocking so the accept
    /// loop notices `stop` promptly instead of sitting forever in
    /// `accept()`.
    pub fn serve(&mut self, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        let listener = self.listener.take().expect("bind() must be called before serve()");
        listener.set_nonblocking(true).expect("set_nonblocking");
        let services = self.services.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let services = services.clone();
                        thread::spawn(move || serve_connection(stream, &services));
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(20));
                    }
                    Err(_) => break,
                }
            }
        })
    }
}

fn serve_connection(stream: TcpStream, services: &HashMap<i16, Box<dyn RpcObject>>) {
    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    loop {
        let (opcode, request) = match super::read_request(&mut reader) {
            Ok(v) => v,
            Err(_) => return, // connection closed or malformed: stop serving it
        };
        let params = match super::request_param(&request) {
            Ok(p) => p,
            Err(_) => return,
        };

        let mut response_msg = message::Builder::new_default();
        let handled = {
            let mut response = response_msg.init_root::<rpc_response::Builder>();
            match services.get(&opcode) {
                Some(service) => service.handle_rpc(params, response.get_result()),
                None => Err(RpcError::UnknownOpcode(opcode)),
            }
        };
        if handled.is_err() {
            return;
        }
        if capnp::serialize::write_message(&mut writer, &response_msg).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::APPEND_ENTRIES_OPCODE;
    use crate::raft_capnp::{append_entries, append_entries_reply};
    use crate::rpc::Rpc;

    struct EchoTerm;
    impl RpcObject for EchoTerm {
        fn handle_rpc(&self, params: any_pointer::Reader, result: any_pointer::Builder) -> Result<(), RpcError> {
            let args = params.get_as::<append_entries::Reader>().map_err(RpcError::Capnp)?;
            let mut reply = result.init_as::<append_entries_reply::Builder>();
            reply.set_term(args.get_term());
            reply.set_success(true);
            Ok(())
        }
    }

    #[test]
    fn dispatches_by_opcode_and_replies() {
        let mut server = RpcServer::new_with_services(vec![(APPEND_ENTRIES_OPCODE, Box::new(EchoTerm))]);
        server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        server.serve(Arc::new(AtomicBool::new(false)));

        let mut rpc = Rpc::new(APPEND_ENTRIES_OPCODE);
        {
            let mut params = rpc.param_builder().init_as::<append_entries::Builder>();
            params.set_term(42);
            params.set_leader_id(1);
            params.set_prev_log_index(0);
            params.set_prev_log_term(0);
            params.set_leader_commit(0);
            params.init_entries(0);
        }

        let stream = TcpStream::connect(addr).unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        let msg = rpc.send(&mut writer, &mut reader).unwrap();
        let result = Rpc::result_reader(&msg).unwrap();
        let reply = result.get_as::<append_entries_reply::Reader>().unwrap();
        assert_eq!(reply.get_term(), 42);
        assert!(reply.get_success());
    }

    #[test]
    fn unknown_opcode_closes_the_connection() {
        let server_handle = RpcServer::new_with_services(vec![]);
        let mut server = server_handle;
        server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        server.serve(Arc::new(AtomicBool::new(false)));

        let rpc = Rpc::new(APPEND_ENTRIES_OPCODE);
        let stream = TcpStream::connect(addr).unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        assert!(rpc.send(&mut writer, &mut reader).is_err());
    }
}
