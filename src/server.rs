//! The server core: binds a handler tree to a channel.
//!
//! Requests are dispatched on their own tasks, so slow handlers never block
//! the channel and responses may complete out of request order; the client
//! correlates strictly by message id. Subscriptions spawn at most one
//! forwarder task per `(path, event)` key; `close` aborts them all.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use rmpv::Value;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{trace, warn};

use crate::{
    channel::Channel,
    error::{RemoteError, Result, RpcError},
    handler::{invoke_nested, resolve_emitter, Namespace, Outcome},
    message::{unwrap_container, ClientBound, Emit, EventRef, Request, RequestInfo, Response, ServerBound},
    path::encode_event_key,
    relay::relay,
};

/// One dispatched request as a future: plain results resolve with the value,
/// streamed results resolve with nil once fully relayed, and a failed
/// dispatch resolves with the error that was answered to the caller.
pub type DispatchFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// The continuation handed to a request hook. Invoking it performs the
/// dispatch, responses included, and yields the outcome for observation.
pub type NextDispatch = Box<dyn FnOnce() -> DispatchFuture + Send>;

/// Interception point around each request. The hook decides when to invoke
/// `next` and sees the dispatch outcome through it. A hook that fails
/// without having invoked `next` is logged and the request is dispatched
/// directly, so a broken hook never blocks request processing.
pub type ServerHook =
    Arc<dyn Fn(RequestInfo, NextDispatch) -> DispatchFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct ServerOptions {
    pub on_request: Option<ServerHook>,
}

enum ServerOp {
    Close,
}

/// A handler bound to one channel. Dropping the server does not tear the
/// binding down; call [`Server::close`].
pub struct Server {
    ops: mpsc::Sender<ServerOp>,
    task: JoinHandle<()>,
}

impl Server {
    /// Binds `handler` to `channel`. Fails fast if the channel's receive
    /// side is already bound elsewhere.
    pub fn bind(handler: Namespace, mut channel: Channel, options: ServerOptions) -> Result<Server> {
        let incoming = channel.take_incoming()?;
        let outgoing = channel.sender();
        let (ops_tx, ops_rx) = mpsc::channel(8);
        let task = tokio::spawn(run(Arc::new(handler), incoming, outgoing, ops_rx, options));
        Ok(Server { ops: ops_tx, task })
    }

    /// Detaches from the channel and removes every active subscription.
    /// Safe to call after the peer is already gone.
    pub async fn close(&self) {
        let _ = self.ops.send(ServerOp::Close).await;
    }

    /// Waits for the dispatch task to finish.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| RpcError::Protocol(e.to_string()))
    }
}

struct ServerState {
    handler: Arc<Namespace>,
    outgoing: mpsc::Sender<Value>,
    subscriptions: HashMap<String, JoinHandle<()>>,
    options: ServerOptions,
}

async fn run(
    handler: Arc<Namespace>,
    mut incoming: mpsc::Receiver<Value>,
    outgoing: mpsc::Sender<Value>,
    mut ops: mpsc::Receiver<ServerOp>,
    options: ServerOptions,
) {
    let mut state = ServerState {
        handler,
        outgoing,
        subscriptions: HashMap::new(),
        options,
    };
    loop {
        tokio::select! {
            maybe = incoming.recv() => match maybe {
                Some(value) => handle_message(&mut state, value),
                None => break,
            },
            op = ops.recv() => match op {
                Some(ServerOp::Close) | None => break,
            },
        }
    }
    for (_, forwarder) in state.subscriptions.drain() {
        forwarder.abort();
    }
}

fn handle_message(state: &mut ServerState, value: Value) {
    let (value, metadata, metadata_warning) = unwrap_container(value);
    if let Some(problem) = metadata_warning {
        warn!(%problem, "invalid request metadata (ignored)");
    }
    let message = match ServerBound::from_value(&value) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "invalid message received (ignored)");
            return;
        }
    };
    match message {
        ServerBound::Request(request) => {
            let handler = state.handler.clone();
            let outgoing = state.outgoing.clone();
            let hook = state.options.on_request.clone();
            tokio::spawn(dispatch_request(handler, outgoing, hook, request, metadata));
        }
        ServerBound::On(subscription) => handle_on(state, subscription),
        ServerBound::Off(subscription) => handle_off(state, subscription),
    }
}

async fn dispatch_request(
    handler: Arc<Namespace>,
    outgoing: mpsc::Sender<Value>,
    hook: Option<ServerHook>,
    request: Request,
    metadata: Option<Value>,
) {
    trace!(msg_id = request.id, path = ?request.path, "dispatching request");
    let Some(hook) = hook else {
        let _ = perform_dispatch(handler, outgoing, request).await;
        return;
    };
    let info = RequestInfo {
        msg_id: request.id,
        path: request.path.clone(),
        args: request.args.clone(),
        metadata,
    };
    let invoked = Arc::new(AtomicBool::new(false));
    let next: NextDispatch = {
        let invoked = invoked.clone();
        let handler = handler.clone();
        let outgoing = outgoing.clone();
        let request = request.clone();
        Box::new(move || -> DispatchFuture {
            invoked.store(true, Ordering::Release);
            Box::pin(perform_dispatch(handler, outgoing, request))
        })
    };
    if let Err(err) = hook(info, next).await {
        // An error after `next` ran is the dispatch's own failure; the
        // error response is already out.
        if !invoked.load(Ordering::Acquire) {
            warn!(error = %err, msg_id = request.id, "request hook failed (request dispatched anyway)");
            let _ = perform_dispatch(handler, outgoing, request).await;
        }
    }
}

async fn perform_dispatch(
    handler: Arc<Namespace>,
    outgoing: mpsc::Sender<Value>,
    request: Request,
) -> Result<Value> {
    match invoke_nested(&handler, &request.path, request.args).await {
        Ok(Outcome::Value(value)) => {
            send_response(
                &outgoing,
                Response::Complete {
                    id: request.id,
                    value: value.clone(),
                },
            )
            .await;
            Ok(value)
        }
        Ok(Outcome::Stream(stream)) => {
            relay(request.id, stream, &outgoing).await;
            Ok(Value::Nil)
        }
        Err(err) => {
            send_response(
                &outgoing,
                Response::Error {
                    id: request.id,
                    error: RemoteError::from_rpc(&err),
                },
            )
            .await;
            Err(err)
        }
    }
}

async fn send_response(outgoing: &mpsc::Sender<Value>, response: Response) {
    let message = ClientBound::Response(response);
    if outgoing.send(message.to_value()).await.is_err() {
        trace!("channel closed while sending response");
    }
}

fn handle_on(state: &mut ServerState, subscription: EventRef) {
    let emitter = match resolve_emitter(&state.handler, &subscription.path) {
        Ok(emitter) => emitter,
        Err(err) => {
            warn!(
                error = %err,
                event = %subscription.event,
                path = ?subscription.path,
                "cannot subscribe to event (ignored)"
            );
            return;
        }
    };
    let key = encode_event_key(&subscription.path, &subscription.event);
    // Already forwarding this event; a duplicate ON is a no-op.
    if state.subscriptions.contains_key(&key) {
        return;
    }
    let mut emissions = emitter.listen();
    let outgoing = state.outgoing.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match emissions.recv().await {
                Ok(emission) if emission.event == subscription.event => {
                    let message = ClientBound::Emit(classify_emission(&subscription, emission.args));
                    if outgoing.send(message.to_value()).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        skipped,
                        event = %subscription.event,
                        "event forwarder lagged; emissions dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    state.subscriptions.insert(key, forwarder);
}

fn handle_off(state: &mut ServerState, subscription: EventRef) {
    if let Err(err) = resolve_emitter(&state.handler, &subscription.path) {
        warn!(
            error = %err,
            event = %subscription.event,
            path = ?subscription.path,
            "cannot unsubscribe from event (ignored)"
        );
        return;
    }
    let key = encode_event_key(&subscription.path, &subscription.event);
    // Fail silently if there is nothing to unsubscribe.
    if let Some(forwarder) = state.subscriptions.remove(&key) {
        forwarder.abort();
    }
}

/// An emission whose single argument is structurally error-like travels on
/// the error slot; everything else is forwarded as plain args. The check is
/// deliberately narrow (`RemoteError::is_error_value`) so a lone ordinary
/// map is never misclassified.
fn classify_emission(subscription: &EventRef, args: Vec<Value>) -> Emit {
    if args.len() == 1 && RemoteError::is_error_value(&args[0]) {
        Emit {
            event: subscription.event.clone(),
            path: subscription.path.clone(),
            error: Some(RemoteError::from_value(&args[0])),
            args: Vec::new(),
        }
    } else {
        Emit {
            event: subscription.event.clone(),
            path: subscription.path.clone(),
            error: None,
            args,
        }
    }
}
