//! Channel plumbing between the RPC cores and their transports.
//!
//! The cores only ever see a [`Channel`]: an outbound sender and an inbound
//! receiver of already-structured `rmpv::Value` messages. How those values
//! travel is the transport's business: an in-memory pair for same-process
//! wiring, a duplex byte stream (TCP, Unix socket, `tokio::io::duplex`)
//! carrying self-delimiting MessagePack, or anything custom via
//! [`Channel::from_parts`].

use rmpv::Value;
use tokio::{
    io::{split, AsyncRead, AsyncWrite, AsyncWriteExt},
    runtime::Handle,
    sync::mpsc,
};
use tokio_util::io::SyncIoBridge;
use tracing::{error, trace};

use crate::error::{Result, RpcError};

/// One endpoint of a bidirectional message channel.
#[derive(Debug)]
pub struct Channel {
    outgoing: mpsc::Sender<Value>,
    incoming: Option<mpsc::Receiver<Value>>,
}

impl Channel {
    /// Creates two connected in-memory endpoints. Values written to one end
    /// arrive at the other, in order.
    pub fn pair() -> (Channel, Channel) {
        let (left_tx, right_rx) = mpsc::channel(100);
        let (right_tx, left_rx) = mpsc::channel(100);
        (
            Channel {
                outgoing: left_tx,
                incoming: Some(left_rx),
            },
            Channel {
                outgoing: right_tx,
                incoming: Some(right_rx),
            },
        )
    }

    /// Builds a channel from caller-provided halves, for custom transports.
    pub fn from_parts(outgoing: mpsc::Sender<Value>, incoming: mpsc::Receiver<Value>) -> Channel {
        Channel {
            outgoing,
            incoming: Some(incoming),
        }
    }

    /// Adapts a duplex byte stream. Messages are written as self-delimiting
    /// MessagePack values; reading happens on a blocking task so the decoder
    /// can pull bytes synchronously.
    pub fn from_stream<S>(stream: S) -> Channel
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = split(stream);

        let (in_tx, in_rx) = mpsc::channel(1000);
        Handle::current().spawn_blocking(move || {
            let mut reader = SyncIoBridge::new(read_half);
            loop {
                match rmpv::decode::read_value(&mut reader) {
                    Ok(value) => {
                        if in_tx.blocking_send(value).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        trace!(error = %err, "stream read ended");
                        break;
                    }
                }
            }
        });

        let (out_tx, mut out_rx) = mpsc::channel::<Value>(1000);
        tokio::spawn(async move {
            while let Some(value) = out_rx.recv().await {
                let mut buffer = Vec::new();
                if let Err(err) = rmpv::encode::write_value(&mut buffer, &value) {
                    error!(error = %err, "failed to encode outgoing message");
                    break;
                }
                if let Err(err) = write_half.write_all(&buffer).await {
                    trace!(error = %err, "stream write ended");
                    break;
                }
                if let Err(err) = write_half.flush().await {
                    trace!(error = %err, "stream write ended");
                    break;
                }
            }
        });

        Channel {
            outgoing: out_tx,
            incoming: Some(in_rx),
        }
    }

    /// Sends a raw value to the peer.
    pub async fn send(&self, value: Value) -> Result<()> {
        self.outgoing
            .send(value)
            .await
            .map_err(|_| RpcError::Disconnect)
    }

    /// Receives the next raw value, or `None` once the peer is gone or the
    /// receive side has been bound to a client/server.
    pub async fn recv(&mut self) -> Option<Value> {
        match self.incoming.as_mut() {
            Some(incoming) => incoming.recv().await,
            None => None,
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Value> {
        self.outgoing.clone()
    }

    pub(crate) fn take_incoming(&mut self) -> Result<mpsc::Receiver<Value>> {
        self.incoming
            .take()
            .ok_or_else(|| RpcError::Protocol("channel receive side already bound".into()))
    }
}
