//! Length-delimited Cap'n Proto RPC over persistent TCP connections
//! (spec §4.2). [`client`] dials peers and re-dials lazily after a
//! failure; [`server`] accepts connections and dispatches by opcode to a
//! registered [`server::RpcObject`].

pub mod client;
pub mod server;

use capnp::any_pointer;
use capnp::message::{self, HeapAllocator};
use capnp::serialize;

use crate::common::RpcError;
use crate::rpc_capnp::{rpc_request, rpc_response};

/// A single outbound RPC: an opcode plus an AnyPointer parameter, built
/// up with the generated capnp builder for whichever struct the opcode
/// names (`append_entries::Builder`, `request_vote::Builder`, ...).
pub struct Rpc {
    message: message::Builder<HeapAllocator>,
}

impl Rpc {
    pub fn new(opcode: i16) -> Rpc {
        let mut message = message::Builder::new_default();
        {
            let mut request = message.init_root::<rpc_request::Builder>();
            request.set_opcode(opcode);
        }
        Rpc { message }
    }

    pub fn param_builder(&mut self) -> any_pointer::Builder {
        self.message.get_root::<rpc_request::Builder>().unwrap().get_param()
    }

    /// Serializes this request onto `writer` and reads back exactly one
    /// response message from `reader`.
    pub fn send(
        &self,
        writer: &mut impl std::io::Write,
        reader: &mut impl std::io::BufRead,
    ) -> Result<message::Reader<capnp::serialize::OwnedSegments>, RpcError> {
        serialize::write_message(writer, &self.message).map_err(RpcError::Send)?;
        serialize::read_message(reader, capnp::message::ReaderOptions::new()).map_err(RpcError::Send)
    }

    /// Pulls the `result` AnyPointer out of a reply message so the caller
    /// can cast it to the reply struct for the RPC it sent.
    pub fn result_reader(
        msg: &message::Reader<capnp::serialize::OwnedSegments>,
    ) -> Result<any_pointer::Reader, RpcError> {
        let response = msg.get_root::<rpc_response::Reader>().map_err(RpcError::Capnp)?;
        Ok(response.get_result())
    }
}

/// Reads one `RpcRequest` off `reader`, returning its opcode and param
/// AnyPointer. Used by the server's per-connection loop.
pub fn read_request(
    reader: &mut impl std::io::BufRead,
) -> Result<(i16, message::Reader<capnp::serialize::OwnedSegments>), RpcError> {
    let msg = serialize::read_message(reader, capnp::message::ReaderOptions::new()).map_err(RpcError::Receive)?;
    let opcode = {
        let request = msg.get_root::<rpc_request::Reader>().map_err(RpcError::Capnp)?;
        request.get_opcode()
    };
    Ok((opcode, msg))
}

pub fn request_param(
    msg: &message::Reader<capnp::serialize::OwnedSegments>,
) -> Result<any_pointer::Reader, RpcError> {
    let request = msg.get_root::<rpc_request::Reader>().map_err(RpcError::Capnp)?;
    Ok(request.get_param())
}
