//! The server-side API object model and nested accessors.
//!
//! A handler is a tree of [`Namespace`] nodes. Each namespace holds named
//! members (async methods, plain-value properties, nested namespaces) and is
//! itself an event source via its [`Emitter`]. Requests are resolved against
//! this tree by walking the prop path; subscriptions resolve the path to an
//! emitter instead.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use rmpv::Value;
use tokio::sync::broadcast;

use crate::{
    error::{RpcError, Result},
    relay::ValueStream,
};

/// What invoking a method produced: a single value, or a chunked stream that
/// the server relays message-by-message.
pub enum Outcome {
    Value(Value),
    Stream(ValueStream),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Outcome::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// An invocable member of a [`Namespace`].
///
/// Use the `#[async_trait]` attribute from the `async_trait` crate when
/// implementing this trait to support async methods. Closures passed to
/// [`Namespace::method`] and friends get an implementation for free.
#[async_trait]
pub trait Method: Send + Sync {
    async fn invoke(&self, args: Vec<Value>) -> Result<Outcome>;
}

struct FnMethod<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Method for FnMethod<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome>> + Send,
{
    async fn invoke(&self, args: Vec<Value>) -> Result<Outcome> {
        (self.f)(args).await
    }
}

pub(crate) enum Member {
    Method(Arc<dyn Method>),
    Property(Value),
    Namespace(Arc<Namespace>),
}

/// One emitted event: its name plus the emitted arguments.
#[derive(Clone, Debug)]
pub struct Emission {
    pub event: String,
    pub args: Vec<Value>,
}

/// A cloneable handle for emitting events from handler code. Emissions fan
/// out to every active subscription on the owning namespace.
#[derive(Clone, Debug)]
pub struct Emitter {
    tx: broadcast::Sender<Emission>,
}

impl Emitter {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Emits an event. Silently a no-op when nobody is subscribed.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        let _ = self.tx.send(Emission {
            event: event.to_string(),
            args,
        });
    }

    /// Emits an error-channel event. Equivalent to emitting a single
    /// error-like argument: subscribers receive it as a failure, not as args.
    pub fn emit_error(&self, event: &str, error: crate::error::RemoteError) {
        self.emit(event, vec![error.to_value()]);
    }

    pub(crate) fn listen(&self) -> broadcast::Receiver<Emission> {
        self.tx.subscribe()
    }
}

/// A node in the handler tree.
///
/// Built by chaining; grab the [`Emitter`] before handing the namespace to
/// the server if handler code needs to emit events later:
///
/// ```
/// use reflector::{Namespace, Value};
///
/// let clock = Namespace::new();
/// let ticker = clock.emitter();
/// let api = Namespace::new()
///     .method("add", |args: Vec<Value>| async move {
///         let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
///         Ok(Value::from(sum))
///     })
///     .property("version", Value::from("1.0.0"))
///     .nested("clock", clock);
/// ticker.emit("tick", vec![Value::from(1)]);
/// # drop(api);
/// ```
pub struct Namespace {
    members: HashMap<String, Member>,
    emitter: Emitter,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            emitter: Emitter::new(),
        }
    }

    /// Adds an async method returning a plain value.
    pub fn method<F, Fut>(self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.outcome_method(name, move |args| {
            let fut = f(args);
            async move { fut.await.map(Outcome::Value) }
        })
    }

    /// Adds an async method returning a chunked stream. The stream may also
    /// be produced after awaiting (an async stream factory); the server
    /// relays it either way.
    pub fn stream_method<F, Fut>(self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueStream>> + Send + 'static,
    {
        self.outcome_method(name, move |args| {
            let fut = f(args);
            async move { fut.await.map(Outcome::Stream) }
        })
    }

    /// Adds an async method that decides per call whether it yields a value
    /// or a stream.
    pub fn outcome_method<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        self.members
            .insert(name.to_string(), Member::Method(Arc::new(FnMethod { f })));
        self
    }

    /// Adds a pre-built method object.
    pub fn method_object(mut self, name: &str, method: Arc<dyn Method>) -> Self {
        self.members.insert(name.to_string(), Member::Method(method));
        self
    }

    /// Adds a plain value readable as an async getter: calling the property's
    /// path resolves with this value.
    pub fn property(mut self, name: &str, value: Value) -> Self {
        self.members.insert(name.to_string(), Member::Property(value));
        self
    }

    /// Mounts a child namespace.
    pub fn nested(mut self, name: &str, namespace: Namespace) -> Self {
        self.members
            .insert(name.to_string(), Member::Namespace(Arc::new(namespace)));
        self
    }

    /// Returns an emitter handle for this namespace.
    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }
}

/// Resolves and invokes the terminal operation of `path` against the tree.
///
/// Intermediate segments are plain lookups: the first one that does not lead
/// anywhere fails with a "not defined" error naming that segment. A terminal
/// method is invoked with `args`; a terminal property resolves with its value
/// (property-as-getter); a terminal namespace has no wire representation and
/// is not callable.
pub(crate) async fn invoke_nested(
    root: &Namespace,
    path: &[String],
    args: Vec<Value>,
) -> Result<Outcome> {
    let (member, name) = walk_to_terminal(root, path)?;
    match member {
        Member::Method(method) => method.invoke(args).await,
        Member::Property(value) => Ok(Outcome::Value(value.clone())),
        Member::Namespace(_) => Err(RpcError::NotCallable(name.to_string())),
    }
}

fn walk_to_terminal<'a>(root: &'a Namespace, path: &[String]) -> Result<(&'a Member, &'a str)> {
    let (last, intermediate) = path
        .split_last()
        .ok_or_else(|| RpcError::NotCallable("[target]".to_string()))?;
    let mut namespace = root;
    for (index, segment) in intermediate.iter().enumerate() {
        match namespace.members.get(segment) {
            Some(Member::Namespace(nested)) => namespace = nested,
            // A method or property has no members, so the segment after it
            // is the one that does not resolve.
            Some(_) => return Err(RpcError::NotDefined(path[index + 1].clone())),
            None => return Err(RpcError::NotDefined(segment.clone())),
        }
    }
    match namespace.members.get_key_value(last) {
        Some((name, member)) => Ok((member, name)),
        None => Err(RpcError::NotDefined(last.clone())),
    }
}

/// Resolves the full `path` (terminal segment included) to an event source.
/// Any segment that is missing or not a namespace fails, naming the segment.
pub(crate) fn resolve_emitter<'a>(root: &'a Namespace, path: &[String]) -> Result<&'a Emitter> {
    let mut namespace = root;
    for segment in path {
        match namespace.members.get(segment) {
            Some(Member::Namespace(nested)) => namespace = nested,
            Some(_) => return Err(RpcError::NotEmitter(segment.clone())),
            None => return Err(RpcError::NotDefined(segment.clone())),
        }
    }
    Ok(&namespace.emitter)
}
