//! Defines the wire message types and their serialization/deserialization.
//!
//! Every message is a positional array whose first element is a small integer
//! tag. The two directions carry disjoint message kinds, so there are two
//! decoders: [`ServerBound::from_value`] accepts REQUEST/ON/OFF and
//! [`ClientBound::from_value`] accepts RESPONSE/EMIT. Decoding is strict and
//! reports every violated field at once; the cores log and drop anything that
//! fails to decode.
use rmpv::Value;

use crate::error::{RemoteError, RpcError, Result};

const REQUEST_MESSAGE: u64 = 0;
const RESPONSE_MESSAGE: u64 = 1;
const ON_MESSAGE: u64 = 2;
const OFF_MESSAGE: u64 = 3;
const EMIT_MESSAGE: u64 = 4;

/// A method-call request: `[0, id, path, args]`.
#[derive(PartialEq, Clone, Debug)]
pub struct Request {
    pub id: u32,
    /// Property path into the nested handler object. Never empty.
    pub path: Vec<String>,
    pub args: Vec<Value>,
}

/// Identifies one `(path, event)` subscription point. Shared by the ON and
/// OFF messages, which have identical payloads: `[tag, event, path]`.
#[derive(PartialEq, Clone, Debug)]
pub struct EventRef {
    pub event: String,
    pub path: Vec<String>,
}

/// A reply correlated to a request by id.
///
/// Plain results are a single `Complete`. Streamed results are a run of
/// `Chunk` messages terminated by `End`, whose `object_mode` flag tells the
/// client whether to keep the chunks discrete or concatenate them. `Error`
/// terminates either form.
#[derive(PartialEq, Clone, Debug)]
pub enum Response {
    /// `[1, id, error]`
    Error { id: u32, error: RemoteError },
    /// `[1, id, nil, value]`
    Complete { id: u32, value: Value },
    /// `[1, id, nil, value, true]`
    Chunk { id: u32, value: Value },
    /// `[1, id, nil, value, false, object_mode]`; `value` is usually nil.
    End {
        id: u32,
        value: Value,
        object_mode: bool,
    },
}

impl Response {
    pub fn id(&self) -> u32 {
        match self {
            Response::Error { id, .. }
            | Response::Complete { id, .. }
            | Response::Chunk { id, .. }
            | Response::End { id, .. } => *id,
        }
    }
}

/// A request as seen by observation hooks, metadata included.
#[derive(PartialEq, Clone, Debug)]
pub struct RequestInfo {
    pub msg_id: u32,
    pub path: Vec<String>,
    pub args: Vec<Value>,
    pub metadata: Option<Value>,
}

/// A relayed handler-side event: `[4, event, path, error, args?]`.
#[derive(PartialEq, Clone, Debug)]
pub struct Emit {
    pub event: String,
    pub path: Vec<String>,
    pub error: Option<RemoteError>,
    pub args: Vec<Value>,
}

/// Messages a server accepts from its channel.
#[derive(PartialEq, Clone, Debug)]
pub enum ServerBound {
    Request(Request),
    On(EventRef),
    Off(EventRef),
}

/// Messages a client accepts from its channel.
#[derive(PartialEq, Clone, Debug)]
pub enum ClientBound {
    Response(Response),
    Emit(Emit),
}

impl ServerBound {
    pub fn to_value(&self) -> Value {
        match self {
            ServerBound::Request(req) => Value::Array(vec![
                Value::Integer(REQUEST_MESSAGE.into()),
                Value::Integer(req.id.into()),
                string_array(&req.path),
                Value::Array(req.args.clone()),
            ]),
            ServerBound::On(sub) => event_ref_to_value(ON_MESSAGE, sub),
            ServerBound::Off(sub) => event_ref_to_value(OFF_MESSAGE, sub),
        }
    }

    /// Decodes a server-bound message, collecting every field violation into
    /// a single protocol error.
    pub fn from_value(value: &Value) -> Result<Self> {
        let (tag, array) = message_parts(value)?;
        match tag {
            REQUEST_MESSAGE => {
                let mut invalid = Vec::new();
                let id = decode_msg_id(array.get(1), &mut invalid);
                let path = decode_string_array(array.get(2), "prop path", &mut invalid);
                if path.as_ref().is_some_and(|p| p.is_empty()) {
                    invalid.push("empty prop path for REQUEST".into());
                }
                let args = match array.get(3) {
                    Some(Value::Array(args)) => Some(args.clone()),
                    other => {
                        invalid.push(format!(
                            "invalid method arguments {other:?} (expected an array)"
                        ));
                        None
                    }
                };
                finish_decode(invalid, || {
                    ServerBound::Request(Request {
                        id: id.unwrap_or_default(),
                        path: path.clone().unwrap_or_default(),
                        args: args.clone().unwrap_or_default(),
                    })
                })
            }
            ON_MESSAGE => Ok(ServerBound::On(decode_event_ref(array)?)),
            OFF_MESSAGE => Ok(ServerBound::Off(decode_event_ref(array)?)),
            other => Err(RpcError::Protocol(format!(
                "unexpected message tag {other} on the server-bound channel"
            ))),
        }
    }
}

impl ClientBound {
    pub fn to_value(&self) -> Value {
        match self {
            ClientBound::Response(resp) => {
                let mut array = vec![
                    Value::Integer(RESPONSE_MESSAGE.into()),
                    Value::Integer(resp.id().into()),
                ];
                match resp {
                    Response::Error { error, .. } => array.push(error.to_value()),
                    Response::Complete { value, .. } => {
                        array.push(Value::Nil);
                        array.push(value.clone());
                    }
                    Response::Chunk { value, .. } => {
                        array.push(Value::Nil);
                        array.push(value.clone());
                        array.push(Value::Boolean(true));
                    }
                    Response::End {
                        value, object_mode, ..
                    } => {
                        array.push(Value::Nil);
                        array.push(value.clone());
                        array.push(Value::Boolean(false));
                        array.push(Value::Boolean(*object_mode));
                    }
                }
                Value::Array(array)
            }
            ClientBound::Emit(emit) => {
                let mut array = vec![
                    Value::Integer(EMIT_MESSAGE.into()),
                    Value::String(emit.event.clone().into()),
                    string_array(&emit.path),
                ];
                match &emit.error {
                    Some(error) => array.push(error.to_value()),
                    None => {
                        array.push(Value::Nil);
                        array.push(Value::Array(emit.args.clone()));
                    }
                }
                Value::Array(array)
            }
        }
    }

    /// Decodes a client-bound message, collecting every field violation into
    /// a single protocol error.
    pub fn from_value(value: &Value) -> Result<Self> {
        let (tag, array) = message_parts(value)?;
        match tag {
            RESPONSE_MESSAGE => {
                let mut invalid = Vec::new();
                let id = decode_msg_id(array.get(1), &mut invalid);
                let error = match array.get(2) {
                    None | Some(Value::Nil) => None,
                    Some(v @ Value::Map(_)) => Some(RemoteError::from_value(v)),
                    Some(other) => {
                        invalid
                            .push(format!("expected an error object or nil, got {other:?}"));
                        None
                    }
                };
                let more = match array.get(4) {
                    None | Some(Value::Nil) => false,
                    Some(Value::Boolean(b)) => *b,
                    Some(other) => {
                        invalid.push(format!("invalid `more` flag {other:?}"));
                        false
                    }
                };
                let object_mode = match array.get(5) {
                    None | Some(Value::Nil) => None,
                    Some(Value::Boolean(b)) => Some(*b),
                    Some(other) => {
                        invalid.push(format!("invalid object-mode flag {other:?}"));
                        None
                    }
                };
                if !invalid.is_empty() {
                    return Err(RpcError::Protocol(invalid.join(". ")));
                }
                let id = id.unwrap_or_default();
                let value = array.get(3).cloned().unwrap_or(Value::Nil);
                let response = if let Some(error) = error {
                    Response::Error { id, error }
                } else if more {
                    Response::Chunk { id, value }
                } else if let Some(object_mode) = object_mode {
                    Response::End {
                        id,
                        value,
                        object_mode,
                    }
                } else {
                    Response::Complete { id, value }
                };
                Ok(ClientBound::Response(response))
            }
            EMIT_MESSAGE => {
                let mut invalid = Vec::new();
                let event = decode_event_name(array.get(1), &mut invalid);
                let path = decode_string_array(array.get(2), "prop path", &mut invalid);
                let error = match array.get(3) {
                    None | Some(Value::Nil) => None,
                    Some(v @ Value::Map(_)) => Some(RemoteError::from_value(v)),
                    Some(other) => {
                        invalid
                            .push(format!("expected an error object or nil, got {other:?}"));
                        None
                    }
                };
                let args = match array.get(4) {
                    None | Some(Value::Nil) => Vec::new(),
                    Some(Value::Array(args)) => args.clone(),
                    Some(other) => {
                        invalid.push(format!("invalid EMIT args {other:?} (expected an array)"));
                        Vec::new()
                    }
                };
                finish_decode(invalid, || {
                    ClientBound::Emit(Emit {
                        event: event.clone().unwrap_or_default(),
                        path: path.clone().unwrap_or_default(),
                        error: error.clone(),
                        args: args.clone(),
                    })
                })
            }
            other => Err(RpcError::Protocol(format!(
                "unexpected message tag {other} on the client-bound channel"
            ))),
        }
    }
}

/// Wraps a message value together with request metadata into a container map.
pub fn wrap_with_metadata(message: Value, metadata: Value) -> Value {
    Value::Map(vec![
        (Value::String("value".into()), message),
        (Value::String("metadata".into()), metadata),
    ])
}

/// Splits an incoming top-level value into the message proper and optional
/// metadata. Arrays pass through untouched; container maps are unwrapped.
/// Metadata that is not a map is reported so the caller can log and drop it.
pub fn unwrap_container(value: Value) -> (Value, Option<Value>, Option<String>) {
    let map = match value {
        Value::Map(map) => map,
        other => return (other, None, None),
    };
    let mut inner = Value::Nil;
    let mut metadata = None;
    let mut warning = None;
    for (key, val) in map {
        match key.as_str() {
            Some("value") => inner = val,
            Some("metadata") => match val {
                Value::Nil => {}
                Value::Map(_) => metadata = Some(val),
                other => {
                    warning = Some(format!("invalid metadata {other:?} (expected a map)"));
                }
            },
            _ => {}
        }
    }
    (inner, metadata, warning)
}

/// Validates top-level message structure and extracts the tag. Raw binary or
/// textual payloads get a distinct hint: they usually mean the channel is
/// delivering unframed bytes instead of structured values.
fn message_parts(value: &Value) -> Result<(u64, &[Value])> {
    let array = match value {
        Value::Array(array) => array,
        Value::Binary(_) | Value::Ext(..) => {
            return Err(RpcError::Protocol(
                "received raw bytes instead of a message array; \
                 is the channel missing a structured (object-mode) codec?"
                    .into(),
            ))
        }
        Value::String(_) => {
            return Err(RpcError::Protocol(
                "received a string instead of a message array; \
                 is the channel missing a structured (object-mode) codec?"
                    .into(),
            ))
        }
        other => {
            return Err(RpcError::Protocol(format!(
                "invalid message of type {other:?} (expected an array)"
            )))
        }
    };
    match array.first() {
        Some(Value::Integer(tag)) => match tag.as_u64() {
            Some(tag) => Ok((tag, array)),
            None => Err(RpcError::Protocol(format!("invalid message tag {tag}"))),
        },
        Some(other) => Err(RpcError::Protocol(format!(
            "invalid message tag {other:?} (expected an integer)"
        ))),
        None => Err(RpcError::Protocol("empty message array".into())),
    }
}

fn decode_msg_id(value: Option<&Value>, invalid: &mut Vec<String>) -> Option<u32> {
    match value.and_then(Value::as_u64) {
        Some(id) if u32::try_from(id).is_ok() => Some(id as u32),
        _ => {
            invalid.push(format!("invalid message id {value:?} (expected a number)"));
            None
        }
    }
}

fn decode_event_name(value: Option<&Value>, invalid: &mut Vec<String>) -> Option<String> {
    match value.and_then(Value::as_str) {
        Some(name) => Some(name.to_string()),
        None => {
            invalid.push(format!("invalid event name {value:?} (expected a string)"));
            None
        }
    }
}

fn decode_string_array(
    value: Option<&Value>,
    what: &str,
    invalid: &mut Vec<String>,
) -> Option<Vec<String>> {
    if let Some(Value::Array(items)) = value {
        let strings: Option<Vec<String>> = items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect();
        if let Some(strings) = strings {
            return Some(strings);
        }
    }
    invalid.push(format!(
        "invalid {what} {value:?} (expected an array of strings)"
    ));
    None
}

fn decode_event_ref(array: &[Value]) -> Result<EventRef> {
    let mut invalid = Vec::new();
    let event = decode_event_name(array.get(1), &mut invalid);
    let path = decode_string_array(array.get(2), "prop path", &mut invalid);
    finish_decode(invalid, || EventRef {
        event: event.clone().unwrap_or_default(),
        path: path.clone().unwrap_or_default(),
    })
}

fn finish_decode<T>(invalid: Vec<String>, build: impl Fn() -> T) -> Result<T> {
    if invalid.is_empty() {
        Ok(build())
    } else {
        Err(RpcError::Protocol(invalid.join(". ")))
    }
}

fn event_ref_to_value(tag: u64, sub: &EventRef) -> Value {
    Value::Array(vec![
        Value::Integer(tag.into()),
        Value::String(sub.event.clone().into()),
        string_array(&sub.path),
    ])
}

fn string_array(items: &[String]) -> Value {
    Value::Array(
        items
            .iter()
            .map(|item| Value::String(item.clone().into()))
            .collect(),
    )
}
