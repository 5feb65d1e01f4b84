//! Mirror a nested server-side API object over any message channel.
//!
//! A [`Client`] hands out lazy [`Handle`]s into the remote handler tree:
//! composing paths is free, calling one sends a correlated request, and
//! subscribing mirrors the remote emitter at that path. A [`Server`] binds a
//! [`Namespace`] tree of async methods, properties, and nested namespaces to
//! the other end of the channel, relaying plain values, chunked streams, and
//! events back.
//!
//! To serve an API:
//! 1. Build a `Namespace` tree (grab `Emitter` handles for anything that
//!    emits events)
//! 2. Call `Server::bind(namespace, channel, options)`
//!
//! To consume it:
//! 1. Call `Client::bind(channel, options)`
//! 2. Navigate with `client.root().get(..)` / `.at(..)`, then `.call(..)`,
//!    `.subscribe(..)`, or `.once(..)`
//!
//! Channels carry structured `rmpv::Value` messages; [`Channel`] adapts
//! in-memory pairs, custom transports, and duplex byte streams (which carry
//! self-delimiting MessagePack). Uses `tokio` for async I/O.

mod channel;
mod client;
mod error;
mod handler;
mod message;
mod path;
mod relay;
mod server;

pub use channel::*;
pub use client::*;
pub use error::*;
pub use handler::*;
pub use message::*;
pub use path::{encode_event_key, parse_event_key};
pub use relay::ValueStream;
pub use server::*;

pub use rmpv::Value;
