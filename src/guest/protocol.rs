//! JSON-RPC 2.0 wire envelope
//!
//! Requests and responses are single JSON objects, one per line, over the
//! guest agent byte stream:
//!
//! ```text
//! -> {"jsonrpc":"2.0","id":1,"method":"mouseClick","params":{"x":100,"y":200}}
//! <- {"jsonrpc":"2.0","id":1,"result":{"ok":true}}
//! <- {"jsonrpc":"2.0","id":2,"error":{"code":-32000,"message":"no such window"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Guest-reported failure inside a response envelope.
///
/// This is a tool-level failure ("the guest could not perform the action"),
/// never a transport failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

/// Incoming message from the guest. A populated `id` correlates it with a
/// pending call; `id: None` marks a notification the transport discards.
#[derive(Debug, Deserialize)]
pub struct Response {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

/// Encode one request as a newline-terminated JSON line.
pub fn encode_request(id: u64, method: &str, params: Value) -> String {
    let req = Request {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    };
    // Request is plain data with no non-string map keys; serialization
    // cannot fail for any input we construct.
    let mut line = serde_json::to_string(&req).unwrap_or_default();
    line.push('\n');
    line
}

/// Decode one line into a response envelope.
pub fn decode_response(line: &str) -> Result<Response, serde_json::Error> {
    serde_json::from_str(line)
}
