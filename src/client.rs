//! The client core: a lazy mirror of the remote handler tree.
//!
//! A [`Handle`] names a prop path; nothing crosses the wire until a call or
//! subscription happens. One dispatch task per client owns the pending,
//! collector, and listener tables and is the only place they are touched, so
//! correlation needs no locking. Responses are matched strictly by message
//! id, never by arrival order.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use rmpv::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{trace, warn};

use crate::{
    channel::Channel,
    error::{RemoteError, Result, RpcError},
    message::{wrap_with_metadata, ClientBound, Emit, EventRef, Request, RequestInfo, Response, ServerBound},
    path::{encode_event_key, encode_path, parse_event_key},
    relay::assemble,
};

/// Hook invoked before each outgoing request. It may rewrite the path or
/// arguments and attach metadata, which travels in a container alongside the
/// message. A failing hook is logged and the original request is sent.
pub type ClientHook = Arc<dyn Fn(&mut RequestInfo) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct ClientOptions {
    /// How long a call waits for its response before failing. Default 5 s.
    pub timeout: Duration,
    pub on_request: Option<ClientHook>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            on_request: None,
        }
    }
}

/// What a subscribed listener receives per emission: the emitted arguments,
/// or the error the remote emitter raised.
pub type EventPayload = std::result::Result<Vec<Value>, RemoteError>;

enum Op {
    Call {
        id: u32,
        path: Vec<String>,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Abandon {
        id: u32,
    },
    Subscribe {
        path: Vec<String>,
        event: String,
        listener: u64,
        sink: mpsc::UnboundedSender<EventPayload>,
    },
    Unsubscribe {
        path: Vec<String>,
        event: String,
        listener: u64,
    },
    EventNames {
        path: Vec<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
    Close,
}

struct Shared {
    ops: mpsc::Sender<Op>,
    timeout: Duration,
    /// Message ids are monotonic and never reused while a call is pending.
    next_id: AtomicU32,
    next_listener: AtomicU64,
    /// Sub-handle cache keyed by encoded path: repeated access to the same
    /// path yields the identical handle.
    cache: Mutex<HashMap<String, Handle>>,
}

struct HandleInner {
    shared: Arc<Shared>,
    path: Vec<String>,
}

/// A cheap immutable view of one prop path on the remote handler object.
///
/// `get` composes paths without network traffic; `call` performs the request
/// the path names; `subscribe` mirrors the remote emitter at that path.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    pub fn path(&self) -> &[String] {
        &self.inner.path
    }

    /// True when both handles are the same cached object.
    pub fn ptr_eq(a: &Handle, b: &Handle) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Returns the sub-handle for `name` under this path. Cached: the same
    /// path always yields the same handle.
    pub fn get(&self, name: &str) -> Handle {
        let mut path = self.inner.path.clone();
        path.push(name.to_string());
        let key = encode_path(&path);
        let mut cache = self
            .inner
            .shared
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        cache
            .entry(key)
            .or_insert_with(|| Handle {
                inner: Arc::new(HandleInner {
                    shared: self.inner.shared.clone(),
                    path,
                }),
            })
            .clone()
    }

    /// Walks several segments at once: `root.at(["a", "b"])` equals
    /// `root.get("a").get("b")`.
    pub fn at<I, S>(&self, segments: I) -> Handle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut handle = self.clone();
        for segment in segments {
            handle = handle.get(segment.as_ref());
        }
        handle
    }

    /// Calls the method (or reads the property) this path names.
    ///
    /// Resolves with the correlated response, including reassembled streamed
    /// results. Fails with [`RpcError::Timeout`] when no response arrives in
    /// time; the request is then abandoned locally and a late response is
    /// dropped with a warning only.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        if self.inner.path.is_empty() {
            return Err(RpcError::Protocol("the root handle is not callable".into()));
        }
        let id = self.inner.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .shared
            .ops
            .send(Op::Call {
                id,
                path: self.inner.path.clone(),
                args,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RpcError::Disconnect)?;
        let timeout = self.inner.shared.timeout;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Disconnect),
            Err(_) => {
                // Remove the pending entry and any collected chunks so the
                // tables do not grow against a silent server.
                let _ = self.inner.shared.ops.send(Op::Abandon { id }).await;
                Err(RpcError::Timeout {
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Subscribes to `event` at this path. An ON message is sent to the
    /// server; when the returned subscription is dropped and it was the last
    /// listener for this path and event, a single OFF follows.
    pub async fn subscribe(&self, event: &str) -> Result<Subscription> {
        let (sink, events) = mpsc::unbounded_channel();
        let listener = self
            .inner
            .shared
            .next_listener
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .shared
            .ops
            .send(Op::Subscribe {
                path: self.inner.path.clone(),
                event: event.to_string(),
                listener,
                sink,
            })
            .await
            .map_err(|_| RpcError::Disconnect)?;
        Ok(Subscription {
            events,
            _guard: SubscriptionGuard {
                ops: self.inner.shared.ops.clone(),
                path: self.inner.path.clone(),
                event: event.to_string(),
                listener,
            },
        })
    }

    /// Waits for a single emission of `event`, then unsubscribes.
    pub async fn once(&self, event: &str) -> Result<EventPayload> {
        let mut subscription = self.subscribe(event).await?;
        subscription.recv().await.ok_or(RpcError::Disconnect)
    }

    /// Names of the events this handle's path currently has local listeners
    /// for. Listeners at other paths are not reported.
    pub async fn event_names(&self) -> Result<Vec<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .shared
            .ops
            .send(Op::EventNames {
                path: self.inner.path.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RpcError::Disconnect)?;
        reply_rx.await.map_err(|_| RpcError::Disconnect)
    }
}

/// A live event subscription. Dropping it detaches the listener.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<EventPayload>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    /// The next emission, or `None` once the client is closed.
    pub async fn recv(&mut self) -> Option<EventPayload> {
        self.events.recv().await
    }
}

struct SubscriptionGuard {
    ops: mpsc::Sender<Op>,
    path: Vec<String>,
    event: String,
    listener: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let op = Op::Unsubscribe {
            path: std::mem::take(&mut self.path),
            event: std::mem::take(&mut self.event),
            listener: self.listener,
        };
        match self.ops.try_send(op) {
            Ok(()) => {}
            // The dispatch task is already gone; nothing to detach from.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            // A full op queue would silently lose the detach, leaking the
            // listener until the next emission. Hand it to the runtime.
            Err(mpsc::error::TrySendError::Full(op)) => {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let ops = self.ops.clone();
                        runtime.spawn(async move {
                            let _ = ops.send(op).await;
                        });
                    }
                    Err(_) => {
                        warn!("subscription dropped outside the runtime with a full op queue");
                    }
                }
            }
        }
    }
}

/// A channel bound to a dynamically mirrored remote API.
pub struct Client {
    root: Handle,
    task: JoinHandle<()>,
}

impl Client {
    /// Binds a client to `channel`. Fails fast if the channel's receive side
    /// is already bound elsewhere.
    pub fn bind(mut channel: Channel, options: ClientOptions) -> Result<Client> {
        let incoming = channel.take_incoming()?;
        let outgoing = channel.sender();
        let (ops_tx, ops_rx) = mpsc::channel(100);
        let task = tokio::spawn(dispatch(incoming, outgoing, ops_rx, options.on_request));
        let shared = Arc::new(Shared {
            ops: ops_tx,
            timeout: options.timeout,
            next_id: AtomicU32::new(1),
            next_listener: AtomicU64::new(0),
            cache: Mutex::new(HashMap::new()),
        });
        let root = Handle {
            inner: Arc::new(HandleInner {
                shared,
                path: Vec::new(),
            }),
        };
        Ok(Client { root, task })
    }

    /// The handle for the empty path: the mirrored root object itself.
    pub fn root(&self) -> Handle {
        self.root.clone()
    }

    /// Detaches from the channel. Every pending call is rejected with
    /// [`RpcError::Disconnect`] and every subscription ends.
    pub async fn close(&self) {
        let _ = self.root.inner.shared.ops.send(Op::Close).await;
    }

    /// Waits for the dispatch task to finish.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| RpcError::Protocol(e.to_string()))
    }
}

struct DispatchState {
    pending: HashMap<u32, oneshot::Sender<Result<Value>>>,
    collector: HashMap<u32, Vec<Value>>,
    listeners: HashMap<String, Vec<(u64, mpsc::UnboundedSender<EventPayload>)>>,
}

async fn dispatch(
    mut incoming: mpsc::Receiver<Value>,
    outgoing: mpsc::Sender<Value>,
    mut ops: mpsc::Receiver<Op>,
    hook: Option<ClientHook>,
) {
    let mut state = DispatchState {
        pending: HashMap::new(),
        collector: HashMap::new(),
        listeners: HashMap::new(),
    };
    loop {
        tokio::select! {
            maybe = incoming.recv() => match maybe {
                Some(value) => handle_incoming(&mut state, &outgoing, value).await,
                None => break,
            },
            maybe = ops.recv() => match maybe {
                Some(Op::Close) | None => break,
                Some(op) => handle_op(&mut state, &outgoing, &hook, op).await,
            },
        }
    }
    for (_, reply) in state.pending.drain() {
        let _ = reply.send(Err(RpcError::Disconnect));
    }
}

async fn handle_op(
    state: &mut DispatchState,
    outgoing: &mpsc::Sender<Value>,
    hook: &Option<ClientHook>,
    op: Op,
) {
    match op {
        Op::Call {
            id,
            path,
            args,
            reply,
        } => {
            let mut info = RequestInfo {
                msg_id: id,
                path,
                args,
                metadata: None,
            };
            if let Some(hook) = hook {
                let mut modified = info.clone();
                match hook(&mut modified) {
                    Ok(()) => info = modified,
                    Err(err) => {
                        warn!(error = %err, msg_id = id, "request hook failed (ignored)");
                    }
                }
            }
            state.pending.insert(id, reply);
            let message = ServerBound::Request(Request {
                id,
                path: info.path,
                args: info.args,
            })
            .to_value();
            let message = match info.metadata {
                Some(metadata) => wrap_with_metadata(message, metadata),
                None => message,
            };
            if outgoing.send(message).await.is_err() {
                if let Some(reply) = state.pending.remove(&id) {
                    let _ = reply.send(Err(RpcError::Disconnect));
                }
            }
        }
        Op::Abandon { id } => {
            // The caller gave up waiting; a late response for this id must
            // find nothing.
            trace!(msg_id = id, "call abandoned after timeout");
            state.pending.remove(&id);
            state.collector.remove(&id);
        }
        Op::Subscribe {
            path,
            event,
            listener,
            sink,
        } => {
            let key = encode_event_key(&path, &event);
            state.listeners.entry(key).or_default().push((listener, sink));
            let message = ServerBound::On(EventRef { event, path }).to_value();
            if outgoing.send(message).await.is_err() {
                trace!("channel closed while subscribing");
            }
        }
        Op::Unsubscribe {
            path,
            event,
            listener,
        } => {
            let key = encode_event_key(&path, &event);
            let now_empty = match state.listeners.get_mut(&key) {
                Some(sinks) => {
                    sinks.retain(|(id, _)| *id != listener);
                    sinks.is_empty()
                }
                None => false,
            };
            if now_empty {
                state.listeners.remove(&key);
                let message = ServerBound::Off(EventRef { event, path }).to_value();
                if outgoing.send(message).await.is_err() {
                    trace!("channel closed while unsubscribing");
                }
            }
        }
        Op::EventNames { path, reply } => {
            let mut names = Vec::new();
            for key in state.listeners.keys() {
                if let Ok((key_path, event)) = parse_event_key(key) {
                    if key_path == path {
                        names.push(event);
                    }
                }
            }
            let _ = reply.send(names);
        }
        // Handled by the dispatch loop itself.
        Op::Close => {}
    }
}

async fn handle_incoming(state: &mut DispatchState, outgoing: &mpsc::Sender<Value>, value: Value) {
    let message = match ClientBound::from_value(&value) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "invalid message received (ignored)");
            return;
        }
    };
    match message {
        ClientBound::Response(response) => handle_response(state, response),
        ClientBound::Emit(emit) => handle_emit(state, outgoing, emit).await,
    }
}

fn handle_response(state: &mut DispatchState, response: Response) {
    match response {
        Response::Chunk { id, value } => {
            if !state.pending.contains_key(&id) {
                warn!(msg_id = id, "chunk for unknown message id (ignored)");
                state.collector.remove(&id);
                return;
            }
            state.collector.entry(id).or_default().push(value);
        }
        Response::Error { id, error } => {
            state.collector.remove(&id);
            match state.pending.remove(&id) {
                Some(reply) => {
                    if reply.send(Err(RpcError::Remote(error))).is_err() {
                        warn!(msg_id = id, "late response for abandoned call (ignored)");
                    }
                }
                None => warn!(msg_id = id, "response for unknown message id (ignored)"),
            }
        }
        Response::Complete { id, value } => resolve_terminal(state, id, value, false),
        Response::End {
            id,
            value,
            object_mode,
        } => resolve_terminal(state, id, value, object_mode),
    }
}

fn resolve_terminal(state: &mut DispatchState, id: u32, value: Value, object_mode: bool) {
    let Some(reply) = state.pending.remove(&id) else {
        state.collector.remove(&id);
        warn!(msg_id = id, "response for unknown message id (ignored)");
        return;
    };
    let resolved = match state.collector.remove(&id) {
        Some(mut chunks) => {
            // A terminal message may still carry a final chunk.
            if !value.is_nil() {
                chunks.push(value);
            }
            assemble(chunks, object_mode)
        }
        None => value,
    };
    if reply.send(Ok(resolved)).is_err() {
        warn!(msg_id = id, "late response for abandoned call (ignored)");
    }
}

async fn handle_emit(state: &mut DispatchState, outgoing: &mpsc::Sender<Value>, emit: Emit) {
    let key = encode_event_key(&emit.path, &emit.event);
    let payload: EventPayload = match emit.error {
        Some(error) => Err(error),
        None => Ok(emit.args),
    };
    if let Some(sinks) = state.listeners.get_mut(&key) {
        sinks.retain(|(_, sink)| sink.send(payload.clone()).is_ok());
        if sinks.is_empty() {
            state.listeners.remove(&key);
        }
    }
    // Nobody is listening any more (or ever was): tell the server to stop
    // forwarding so one-shot consumers do not leak subscriptions.
    if !state.listeners.contains_key(&key) {
        let message = ServerBound::Off(EventRef {
            event: emit.event,
            path: emit.path,
        })
        .to_value();
        if outgoing.send(message).await.is_err() {
            trace!("channel closed while unsubscribing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> DispatchState {
        DispatchState {
            pending: HashMap::new(),
            collector: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn abandonment_clears_pending_and_collector() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let hook: Option<ClientHook> = None;
        let mut state = state();

        let (reply_tx, mut reply_rx) = oneshot::channel();
        handle_op(
            &mut state,
            &out_tx,
            &hook,
            Op::Call {
                id: 1,
                path: vec!["job".into()],
                args: vec![],
                reply: reply_tx,
            },
        )
        .await;
        assert!(out_rx.try_recv().is_ok());
        handle_response(
            &mut state,
            Response::Chunk {
                id: 1,
                value: Value::from("partial"),
            },
        );
        assert!(state.pending.contains_key(&1));
        assert!(state.collector.contains_key(&1));

        handle_op(&mut state, &out_tx, &hook, Op::Abandon { id: 1 }).await;
        assert!(state.pending.is_empty());
        assert!(state.collector.is_empty());

        // Late chunks for the abandoned id no longer accumulate, and a late
        // terminal resolves nothing.
        handle_response(
            &mut state,
            Response::Chunk {
                id: 1,
                value: Value::from("late"),
            },
        );
        assert!(state.collector.is_empty());
        handle_response(
            &mut state,
            Response::Complete {
                id: 1,
                value: Value::from("late"),
            },
        );
        assert!(reply_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn abandoning_an_unknown_id_is_harmless() {
        let (out_tx, _out_rx) = mpsc::channel(16);
        let hook: Option<ClientHook> = None;
        let mut state = state();
        handle_op(&mut state, &out_tx, &hook, Op::Abandon { id: 42 }).await;
        assert!(state.pending.is_empty());
    }
}
