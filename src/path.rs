//! Encoding of `(prop path, event name)` pairs into flat string keys.
//!
//! One physical listener table has to stand in for an event emitter at every
//! path of the mirrored object, so subscriptions are keyed by a reversible
//! composite key. The key is the canonical JSON encoding of the two-element
//! pair, which cannot collide for distinct inputs the way naive separator
//! concatenation can.

use crate::error::{RpcError, Result};

/// Encodes a prop path and an event name into a single key.
pub fn encode_event_key(path: &[String], event: &str) -> String {
    serde_json::json!([path, event]).to_string()
}

/// Parses a key produced by [`encode_event_key`]. Rejects anything that is
/// not a two-element pair of a string array and a string.
pub fn parse_event_key(key: &str) -> Result<(Vec<String>, String)> {
    serde_json::from_str(key)
        .map_err(|err| RpcError::Protocol(format!("cannot parse event key {key:?}: {err}")))
}

/// Encodes a prop path alone, used to key the client's sub-handle cache.
pub fn encode_path(path: &[String]) -> String {
    serde_json::json!(path).to_string()
}
