use rmpv::Value;
use std::io;
use thiserror::Error;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Error occurred during I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error occurred during MessagePack serialization.
    #[error("Serialization error: {0}")]
    Encode(#[from] rmpv::encode::Error),

    /// Error occurred during MessagePack deserialization.
    #[error("Deserialization error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    /// Error related to the RPC protocol (malformed message, misused API).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A path segment did not resolve to anything on the handler object.
    #[error("{0} is not defined")]
    NotDefined(String),

    /// The terminal path segment resolved to something that cannot be called
    /// or read as a value.
    #[error("{0} is not callable")]
    NotCallable(String),

    /// A subscription path did not resolve to an event source.
    #[error("{0} is not an event emitter")]
    NotEmitter(String),

    /// No response arrived within the configured timeout.
    #[error("no response after {ms}ms; the server may be closed or the transport is down")]
    Timeout { ms: u64 },

    /// Error reported by the remote side for this call.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The channel or the dispatch task behind it has gone away.
    #[error("Disconnected")]
    Disconnect,
}

/// An error that crossed the channel boundary.
///
/// Errors are serialized into a map with `name` and `message` string entries.
/// The `name` carries the error taxonomy (`ReferenceError` for a missing path
/// segment, `TypeError` for a wrong-shaped one, `TimeoutError`, plain `Error`
/// for everything else), so callers can match on it without parsing text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Serializes the error into its wire representation.
    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            (
                Value::String("name".into()),
                Value::String(self.name.clone().into()),
            ),
            (
                Value::String("message".into()),
                Value::String(self.message.clone().into()),
            ),
        ])
    }

    /// Deserializes an error object, leniently: anything that is not a
    /// well-formed error map becomes a generic `Error` with the value
    /// rendered as its message.
    pub fn from_value(value: &Value) -> Self {
        if let Some((name, message)) = error_map_fields(value) {
            Self::new(name, message)
        } else {
            Self::new("Error", format!("{value}"))
        }
    }

    /// Strict structural check used to classify event emissions: a value is
    /// error-like only if it is a map carrying string `name` and `message`
    /// entries. Deliberately narrow so ordinary maps are never misrouted to
    /// the error channel.
    pub fn is_error_value(value: &Value) -> bool {
        error_map_fields(value).is_some()
    }

    /// Maps a local failure to its serialized taxonomy.
    pub fn from_rpc(err: &RpcError) -> Self {
        match err {
            RpcError::NotDefined(_) => Self::new("ReferenceError", err.to_string()),
            RpcError::NotCallable(_) | RpcError::NotEmitter(_) => {
                Self::new("TypeError", err.to_string())
            }
            RpcError::Timeout { .. } => Self::new("TimeoutError", err.to_string()),
            RpcError::Remote(remote) => remote.clone(),
            _ => Self::new("Error", err.to_string()),
        }
    }
}

fn error_map_fields(value: &Value) -> Option<(&str, &str)> {
    let map = match value {
        Value::Map(map) => map,
        _ => return None,
    };
    let mut name = None;
    let mut message = None;
    for (key, val) in map {
        match (key.as_str(), val.as_str()) {
            (Some("name"), Some(s)) => name = Some(s),
            (Some("message"), Some(s)) => message = Some(s),
            _ => {}
        }
    }
    Some((name?, message?))
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_round_trip() {
        let err = RemoteError::new("ReferenceError", "frobnicate is not defined");
        assert_eq!(RemoteError::from_value(&err.to_value()), err);
    }

    #[test]
    fn lenient_deserialization() {
        let err = RemoteError::from_value(&Value::String("boom".into()));
        assert_eq!(err.name, "Error");

        // A map missing `message` is not a well-formed error object.
        let partial = Value::Map(vec![(
            Value::String("name".into()),
            Value::String("TypeError".into()),
        )]);
        assert_eq!(RemoteError::from_value(&partial).name, "Error");
    }

    #[test]
    fn error_like_check_is_narrow() {
        assert!(RemoteError::is_error_value(
            &RemoteError::new("Error", "x").to_value()
        ));
        assert!(!RemoteError::is_error_value(&Value::Map(vec![(
            Value::String("name".into()),
            Value::String("not-an-error".into()),
        )])));
        assert!(!RemoteError::is_error_value(&Value::String("Error".into())));
    }

    #[test]
    fn taxonomy_mapping() {
        let named = RemoteError::from_rpc(&RpcError::NotDefined("foo".into()));
        assert_eq!(named.name, "ReferenceError");
        assert!(named.message.contains("foo"));

        assert_eq!(
            RemoteError::from_rpc(&RpcError::NotEmitter("bar".into())).name,
            "TypeError"
        );
        assert_eq!(
            RemoteError::from_rpc(&RpcError::Timeout { ms: 5 }).name,
            "TimeoutError"
        );
    }
}
