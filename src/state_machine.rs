//! The deterministic key-value state machine (spec §4.6). Commands are
//! whitespace-delimited ASCII: `SET k v`, `GET k`, `DELETE k`. The map is
//! process-local and not persisted — recovery replays the log from index
//! 1 through the [`crate::applier::Applier`].

use std::collections::HashMap;

/// The result of applying one command, delivered to the client that
/// submitted it (if this node is leader and the pending-response channel
/// is still open).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub success: bool,
    pub value: String,
}

impl Response {
    fn ok(value: impl Into<String>) -> Response {
        Response { success: true, value: value.into() }
    }

    fn ok_empty() -> Response {
        Response { success: true, value: String::new() }
    }

    fn fail() -> Response {
        Response { success: false, value: String::new() }
    }
}

/// The committed-entry consumer: a plain in-memory `HashMap<String,
/// String>`. There is no shared mutable access from anywhere but the
/// applier — see spec §5.
#[derive(Debug, Default)]
pub struct KeyValueStateMachine {
    map: HashMap<String, String>,
}

impl KeyValueStateMachine {
    pub fn new() -> KeyValueStateMachine {
        KeyValueStateMachine { map: HashMap::new() }
    }

    /// Applies one committed command and returns the response a client
    /// should see. Malformed or unknown commands are a no-op that yields
    /// `success: false`.
    pub fn apply(&mut self, command: &[u8]) -> Response {
        let command = match std::str::from_utf8(command) {
            Ok(s) => s,
            Err(_) => return Response::fail(),
        };
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.as_slice() {
            ["SET", key, value] => {
                self.map.insert((*key).to_string(), (*value).to_string());
                Response::ok_empty()
            }
            ["GET", key] => match self.map.get(*key) {
                Some(value) => Response::ok(value.clone()),
                None => Response { success: false, value: String::new() },
            },
            ["DELETE", key] => {
                self.map.remove(*key);
                Response::ok_empty()
            }
            _ => Response::fail(),
        }
    }

    /// Direct, non-mutating read used by the quorum-read path (spec
    /// §4.3.7): the read does not travel through `apply` because it must
    /// not append anything to the log.
    pub fn get(&self, key: &str) -> Response {
        match self.map.get(key) {
            Some(value) => Response::ok(value.clone()),
            None => Response { success: false, value: String::new() },
        }
    }
}
