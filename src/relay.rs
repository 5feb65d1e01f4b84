//! Relays chunked method results over the channel and reassembles them.
//!
//! One in-flight request may produce many RESPONSE messages: a chunk per data
//! item, then a terminal message carrying the source's object-mode flag. The
//! receiving side collects chunks per message id and assembles the final
//! value when the terminal message arrives.

use bytes::BytesMut;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use rmpv::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    error::{RemoteError, Result},
    message::{ClientBound, Response},
};

/// A chunked method result.
///
/// `object_mode` declares how the chunks recombine on the client: discrete
/// values collected into an array, or text/bytes concatenated into one value.
pub struct ValueStream {
    chunks: BoxStream<'static, Result<Value>>,
    object_mode: bool,
}

impl ValueStream {
    pub fn new<S>(chunks: S, object_mode: bool) -> Self
    where
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self {
            chunks: chunks.boxed(),
            object_mode,
        }
    }

    /// Builds a stream from ready chunks.
    pub fn from_chunks<I>(chunks: I, object_mode: bool) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::new(stream::iter(chunks.into_iter().map(Ok)), object_mode)
    }

    pub fn object_mode(&self) -> bool {
        self.object_mode
    }
}

/// Drains `stream` into RESPONSE messages sharing `id`. A stream error sends
/// an error RESPONSE and stops; no further chunks follow for that id.
pub(crate) async fn relay(id: u32, mut stream: ValueStream, out: &mpsc::Sender<Value>) {
    while let Some(item) = stream.chunks.next().await {
        let message = match item {
            Ok(value) => ClientBound::Response(Response::Chunk { id, value }),
            Err(err) => {
                let error = RemoteError::from_rpc(&err);
                let message = ClientBound::Response(Response::Error { id, error });
                if out.send(message.to_value()).await.is_err() {
                    trace!(msg_id = id, "channel closed while relaying stream error");
                }
                return;
            }
        };
        if out.send(message.to_value()).await.is_err() {
            trace!(msg_id = id, "channel closed while relaying stream");
            return;
        }
    }
    let end = ClientBound::Response(Response::End {
        id,
        value: Value::Nil,
        object_mode: stream.object_mode,
    });
    if out.send(end.to_value()).await.is_err() {
        trace!(msg_id = id, "channel closed before stream end");
    }
}

/// Recombines collected chunks into the caller-visible value.
pub(crate) fn assemble(chunks: Vec<Value>, object_mode: bool) -> Value {
    if object_mode {
        return Value::Array(chunks);
    }
    match chunks.first() {
        Some(Value::String(_)) => {
            let mut joined = String::new();
            for chunk in &chunks {
                if let Some(text) = chunk.as_str() {
                    joined.push_str(text);
                }
            }
            Value::String(joined.into())
        }
        _ => {
            let mut buffer = BytesMut::new();
            for chunk in &chunks {
                if let Some(bytes) = chunk.as_slice() {
                    buffer.extend_from_slice(bytes);
                }
            }
            Value::Binary(buffer.to_vec())
        }
    }
}
