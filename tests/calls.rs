//! Request/response integration tests over an in-memory channel pair.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use reflector::{
    Channel, Client, ClientBound, ClientOptions, DispatchFuture, Handle, Namespace, NextDispatch,
    RequestInfo, Response, RpcError, Server, ServerBound, ServerOptions, Value,
};
use tokio::time::sleep;

fn api() -> Namespace {
    Namespace::new()
        .method("add", |args: Vec<Value>| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(Value::from(sum))
        })
        .method("sleepy_echo", |args: Vec<Value>| async move {
            let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
            sleep(Duration::from_millis(ms)).await;
            Ok(args.get(1).cloned().unwrap_or(Value::Nil))
        })
        .method("fail", |_args: Vec<Value>| async move {
            Err(RpcError::Protocol("handler failed".into()))
        })
        .property("version", Value::from("0.1.0"))
        .nested(
            "math",
            Namespace::new().method("pow", |args: Vec<Value>| async move {
                let base = args.first().and_then(Value::as_i64).unwrap_or(0);
                let exp = args.get(1).and_then(Value::as_u64).unwrap_or(0) as u32;
                Ok(Value::from(base.pow(exp)))
            }),
        )
}

fn setup() -> (Server, Client) {
    let (server_end, client_end) = Channel::pair();
    let server = Server::bind(api(), server_end, ServerOptions::default()).unwrap();
    let client = Client::bind(client_end, ClientOptions::default()).unwrap();
    (server, client)
}

#[tokio::test]
async fn basic_request_response() {
    let (_server, client) = setup();
    let result = client
        .root()
        .get("add")
        .call(vec![Value::from(5), Value::from(3)])
        .await
        .unwrap();
    assert_eq!(result, Value::from(8));
}

#[tokio::test]
async fn nested_path_call() {
    let (_server, client) = setup();
    let result = client
        .root()
        .at(["math", "pow"])
        .call(vec![Value::from(2), Value::from(10)])
        .await
        .unwrap();
    assert_eq!(result, Value::from(1024));
}

#[tokio::test]
async fn property_reads_as_async_getter() {
    let (_server, client) = setup();
    let result = client.root().get("version").call(vec![]).await.unwrap();
    assert_eq!(result, Value::from("0.1.0"));
}

#[tokio::test]
async fn handler_errors_reject_the_call() {
    let (_server, client) = setup();
    let err = client.root().get("fail").call(vec![]).await.unwrap_err();
    match err {
        RpcError::Remote(remote) => assert!(remote.message.contains("handler failed")),
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_method_is_named() {
    let (_server, client) = setup();
    let err = client
        .root()
        .get("missingMethod")
        .call(vec![])
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(remote) => {
            assert_eq!(remote.name, "ReferenceError");
            assert!(remote.message.contains("missingMethod"));
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn first_missing_segment_is_named() {
    let (_server, client) = setup();
    let err = client
        .root()
        .at(["noSuch", "sub"])
        .call(vec![])
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(remote) => {
            assert_eq!(remote.name, "ReferenceError");
            assert!(remote.message.contains("noSuch"));
            assert!(!remote.message.contains("sub"));
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn namespace_is_not_callable() {
    let (_server, client) = setup();
    let err = client.root().get("math").call(vec![]).await.unwrap_err();
    match err {
        RpcError::Remote(remote) => assert_eq!(remote.name, "TypeError"),
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn root_handle_is_not_callable() {
    let (_server, client) = setup();
    assert!(matches!(
        client.root().call(vec![]).await,
        Err(RpcError::Protocol(_))
    ));
}

#[tokio::test]
async fn out_of_order_responses_correlate_by_id() {
    let (_server, client) = setup();
    let slow = client.root().get("sleepy_echo");
    let fast = slow.clone();

    let (slow_result, fast_result) = tokio::join!(
        slow.call(vec![Value::from(100), Value::from("slow")]),
        fast.call(vec![Value::from(10), Value::from("fast")]),
    );
    assert_eq!(slow_result.unwrap(), Value::from("slow"));
    assert_eq!(fast_result.unwrap(), Value::from("fast"));
}

#[tokio::test]
async fn sub_handles_are_cached() {
    let (_server, client) = setup();
    let root = client.root();
    assert!(Handle::ptr_eq(&root.get("math"), &root.get("math")));
    assert!(Handle::ptr_eq(
        &root.at(["math", "pow"]),
        &root.get("math").get("pow")
    ));
    assert!(!Handle::ptr_eq(&root.get("math"), &root.get("add")));
}

#[tokio::test]
async fn call_times_out_without_a_response() {
    // The peer never answers.
    let (_silent_peer, client_end) = Channel::pair();
    let client = Client::bind(
        client_end,
        ClientOptions {
            timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let err = client.root().get("add").call(vec![]).await.unwrap_err();
    match err {
        RpcError::Timeout { ms } => assert_eq!(ms, 50),
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(err.to_string().contains("server may be closed"));
}

#[tokio::test]
async fn late_response_after_timeout_is_dropped() {
    let (mut peer, client_end) = Channel::pair();
    let client = Client::bind(
        client_end,
        ClientOptions {
            timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let err = client.root().get("add").call(vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));

    // Answer the abandoned request after the fact.
    let request = match ServerBound::from_value(&peer.recv().await.unwrap()).unwrap() {
        ServerBound::Request(request) => request,
        other => panic!("expected a request, got {other:?}"),
    };
    peer.send(
        ClientBound::Response(Response::Complete {
            id: request.id,
            value: Value::from("too late"),
        })
        .to_value(),
    )
    .await
    .unwrap();
    sleep(Duration::from_millis(20)).await;

    // The client is unaffected: the next call allocates a fresh id and still
    // behaves (here: times out again, since the peer stays silent).
    let err = client.root().get("add").call(vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));
}

#[tokio::test]
async fn unknown_message_id_does_not_disturb_pending_calls() {
    let (mut peer, client_end) = Channel::pair();
    let client = Client::bind(client_end, ClientOptions::default()).unwrap();

    let call = tokio::spawn({
        let handle = client.root().get("add");
        async move { handle.call(vec![Value::from(1)]).await }
    });

    let request = match ServerBound::from_value(&peer.recv().await.unwrap()).unwrap() {
        ServerBound::Request(request) => request,
        other => panic!("expected a request, got {other:?}"),
    };
    // A response nobody asked for, then the real one.
    peer.send(
        ClientBound::Response(Response::Complete {
            id: request.id + 4242,
            value: Value::from("zombie"),
        })
        .to_value(),
    )
    .await
    .unwrap();
    peer.send(
        ClientBound::Response(Response::Complete {
            id: request.id,
            value: Value::from("real"),
        })
        .to_value(),
    )
    .await
    .unwrap();

    assert_eq!(call.await.unwrap().unwrap(), Value::from("real"));
}

#[tokio::test]
async fn request_hooks_observe_and_annotate() {
    let seen: Arc<Mutex<Vec<RequestInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_by_server = seen.clone();

    let (server_end, client_end) = Channel::pair();
    let _server = Server::bind(
        api(),
        server_end,
        ServerOptions {
            on_request: Some(Arc::new(
                move |info: RequestInfo, next: NextDispatch| -> DispatchFuture {
                    let seen = seen_by_server.clone();
                    Box::pin(async move {
                        seen.lock().unwrap().push(info);
                        next().await
                    })
                },
            )),
        },
    )
    .unwrap();
    let client = Client::bind(
        client_end,
        ClientOptions {
            on_request: Some(Arc::new(|info: &mut RequestInfo| {
                info.metadata = Some(Value::Map(vec![(
                    Value::String("trace".into()),
                    Value::from(7),
                )]));
                Ok(())
            })),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let result = client
        .root()
        .get("add")
        .call(vec![Value::from(2), Value::from(2)])
        .await
        .unwrap();
    assert_eq!(result, Value::from(4));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, vec!["add".to_string()]);
    assert!(seen[0].metadata.is_some());
}

#[tokio::test]
async fn failing_hooks_never_block_requests() {
    let (server_end, client_end) = Channel::pair();
    let _server = Server::bind(
        api(),
        server_end,
        ServerOptions {
            // Fails without ever invoking `next`.
            on_request: Some(Arc::new(
                |_info: RequestInfo, _next: NextDispatch| -> DispatchFuture {
                    Box::pin(async { Err(RpcError::Protocol("hook exploded".into())) })
                },
            )),
        },
    )
    .unwrap();
    let client = Client::bind(
        client_end,
        ClientOptions {
            on_request: Some(Arc::new(|_info: &mut RequestInfo| {
                Err(RpcError::Protocol("hook exploded".into()))
            })),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let result = client
        .root()
        .get("add")
        .call(vec![Value::from(20), Value::from(22)])
        .await
        .unwrap();
    assert_eq!(result, Value::from(42));
}

#[tokio::test]
async fn hooks_observe_failed_dispatches() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_by_server = seen.clone();

    let (server_end, client_end) = Channel::pair();
    let _server = Server::bind(
        api(),
        server_end,
        ServerOptions {
            on_request: Some(Arc::new(
                move |_info: RequestInfo, next: NextDispatch| -> DispatchFuture {
                    let seen = seen_by_server.clone();
                    Box::pin(async move {
                        let result = next().await;
                        if let Err(err) = &result {
                            seen.lock().unwrap().push(err.to_string());
                        }
                        result
                    })
                },
            )),
        },
    )
    .unwrap();
    let client = Client::bind(client_end, ClientOptions::default()).unwrap();

    // The caller still gets the error response.
    let err = client.root().get("fail").call(vec![]).await.unwrap_err();
    match err {
        RpcError::Remote(remote) => assert!(remote.message.contains("handler failed")),
        other => panic!("expected a remote error, got {other:?}"),
    }

    // The hook records after the error response is on the wire.
    sleep(Duration::from_millis(50)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("handler failed"));
}

#[tokio::test]
async fn closed_client_rejects_new_calls() {
    let (_server, client) = setup();
    client.close().await;
    sleep(Duration::from_millis(10)).await;
    assert!(matches!(
        client.root().get("add").call(vec![]).await,
        Err(RpcError::Disconnect)
    ));
}

#[tokio::test]
async fn closed_server_stops_answering() {
    let (server_end, client_end) = Channel::pair();
    let server = Server::bind(api(), server_end, ServerOptions::default()).unwrap();
    let client = Client::bind(
        client_end,
        ClientOptions {
            timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    server.close().await;
    server.join().await.unwrap();

    assert!(matches!(
        client.root().get("add").call(vec![]).await,
        Err(RpcError::Timeout { .. })
    ));
}
