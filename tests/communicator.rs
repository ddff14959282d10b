//! Communicator tests over in-memory streams.
//!
//! Each test wires two communicators back to back with `tokio::io::duplex`.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nodelink::handler::BoxError;
use nodelink::protocol::{HANDLER_CAPACITY, HANDLER_ERROR, METHOD_NOT_FOUND};
use nodelink::{Communicator, CommunicatorBuilder, ConnectionState, NodelinkError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

const LIMIT: Duration = Duration::from_secs(5);

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(LIMIT, fut)
        .await
        .expect("test step timed out")
}

fn pair(host: CommunicatorBuilder, peer: CommunicatorBuilder) -> (Communicator, Communicator) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (host.attach(a).unwrap(), peer.attach(b).unwrap())
}

async fn wait_for_pending(comm: &Communicator, count: usize) {
    within(async {
        while comm.pending_requests() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

#[derive(Serialize, Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

fn rpc_code(err: NodelinkError) -> i64 {
    match err {
        NodelinkError::Rpc(e) => e.code,
        other => panic!("expected RPC error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_request_round_trip() {
    let peer = Communicator::builder()
        .method("add", |p: Add| async move { Ok::<_, BoxError>(p.a + p.b) });
    let (host, _peer) = pair(Communicator::builder(), peer);

    let sum: i64 = within(host.request("add", &Add { a: 2, b: 3 })).await.unwrap();
    assert_eq!(sum, 5);
    assert_eq!(host.pending_requests(), 0);
}

#[tokio::test]
async fn test_calls_in_both_directions() {
    let host = Communicator::builder()
        .method("host.name", |_: ()| async { Ok::<_, BoxError>("host") });
    let peer = Communicator::builder()
        .method("peer.name", |_: ()| async { Ok::<_, BoxError>("peer") });
    let (host, peer) = pair(host, peer);

    let from_peer: String = within(host.request("peer.name", &())).await.unwrap();
    let from_host: String = within(peer.request("host.name", &())).await.unwrap();

    assert_eq!(from_peer, "peer");
    assert_eq!(from_host, "host");
}

#[tokio::test]
async fn test_request_value_and_null_result() {
    let peer = Communicator::builder()
        .raw_method("echo", |p| async move {
            Ok::<_, BoxError>(p.map(Value::Object).unwrap_or(Value::Null))
        })
        .method("nothing", |_: ()| async { Ok::<_, BoxError>(()) });
    let (host, _peer) = pair(Communicator::builder(), peer);

    let echoed = within(host.request_value("echo", &json!({"k": [1, "two"]})))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"k": [1, "two"]}));

    let unit: Option<i32> = within(host.request("nothing", &())).await.unwrap();
    assert!(unit.is_none());
}

#[tokio::test]
async fn test_notify_is_fire_and_forget() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let peer = Communicator::builder().method("log", move |p: Value| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(p["line"].as_str().unwrap_or_default().to_string());
            Ok::<_, BoxError>(())
        }
    });
    let (host, _peer) = pair(Communicator::builder(), peer);

    within(host.notify("log", &json!({"line": "hello"})))
        .await
        .unwrap();
    assert_eq!(host.pending_requests(), 0);

    assert_eq!(within(rx.recv()).await.unwrap(), "hello");
}

#[tokio::test]
async fn test_unknown_method_is_method_not_found() {
    let (host, _peer) = pair(Communicator::builder(), Communicator::builder());

    let err = within(host.request_value("missing", &())).await.unwrap_err();
    match err {
        NodelinkError::Rpc(e) => {
            assert_eq!(e.code, METHOD_NOT_FOUND);
            assert_eq!(e.message, "Method not found");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // A notify to an unknown method just disappears.
    within(host.notify("missing", &())).await.unwrap();
    assert_eq!(host.pending_requests(), 0);
}

#[tokio::test]
async fn test_handler_error_maps_to_rpc_error() {
    let peer = Communicator::builder().method("fail", |_: ()| async {
        Err::<(), BoxError>("disk full".into())
    });
    let (host, _peer) = pair(Communicator::builder(), peer);

    let err = within(host.request_value("fail", &())).await.unwrap_err();
    match err {
        NodelinkError::Rpc(e) => {
            assert_eq!(e.code, HANDLER_ERROR);
            assert_eq!(e.message, "disk full");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_params_reported_as_handler_error() {
    let peer = Communicator::builder()
        .method("add", |p: Add| async move { Ok::<_, BoxError>(p.a + p.b) });
    let (host, _peer) = pair(Communicator::builder(), peer);

    let err = within(host.request_value("add", &json!({"a": "one"})))
        .await
        .unwrap_err();
    match err {
        NodelinkError::Rpc(e) => {
            assert_eq!(e.code, HANDLER_ERROR);
            assert!(e.message.starts_with("invalid params"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_non_object_params_rejected_locally() {
    let (host, _peer) = pair(Communicator::builder(), Communicator::builder());

    let err = host.request_value("add", &[1, 2]).await.unwrap_err();
    assert!(matches!(err, NodelinkError::InvalidParams(_)));
    assert_eq!(host.pending_requests(), 0);

    assert!(matches!(
        host.notify("add", &"text").await,
        Err(NodelinkError::InvalidParams(_))
    ));
}

#[tokio::test]
async fn test_concurrent_requests_resolve_out_of_order() {
    #[derive(Serialize, Deserialize)]
    struct Delay {
        ms: u64,
        tag: u32,
    }

    let peer = Communicator::builder().method("delay", |p: Delay| async move {
        tokio::time::sleep(Duration::from_millis(p.ms)).await;
        Ok::<_, BoxError>(p.tag)
    });
    let (host, _peer) = pair(Communicator::builder(), peer);

    // Earlier calls sleep longer, so responses come back reversed.
    let mut calls = Vec::new();
    for tag in 0..10u32 {
        let host = host.clone();
        calls.push(tokio::spawn(async move {
            let ms = u64::from(10 - tag) * 20;
            let got: u32 = host.request("delay", &Delay { ms, tag }).await.unwrap();
            got
        }));
    }

    for (tag, call) in calls.into_iter().enumerate() {
        assert_eq!(within(call).await.unwrap(), tag as u32);
    }
    assert_eq!(host.pending_requests(), 0);
}

#[tokio::test]
async fn test_large_message_survives_chunking() {
    let peer = Communicator::builder().method("echo", |p: Value| async move { Ok::<_, BoxError>(p) });
    let (host, _peer) = pair(Communicator::builder(), peer);

    let text: String = (0..10_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let echoed: Value = within(host.request("echo", &json!({ "text": text })))
        .await
        .unwrap();

    assert_eq!(echoed["text"].as_str().unwrap(), text);
}

#[tokio::test]
async fn test_request_with_timeout_removes_pending_call() {
    let peer = Communicator::builder().method("slow", |_: ()| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, BoxError>(())
    });
    let (host, _peer) = pair(Communicator::builder(), peer);

    let err = within(host.request_with_timeout::<_, ()>(
        "slow",
        &(),
        Duration::from_millis(50),
    ))
    .await
    .unwrap_err();

    assert!(matches!(err, NodelinkError::Timeout(d) if d == Duration::from_millis(50)));
    assert_eq!(host.pending_requests(), 0);
}

#[tokio::test]
async fn test_default_request_timeout() {
    let host = Communicator::builder().request_timeout(Duration::from_millis(50));
    let peer = Communicator::builder().method("slow", |_: ()| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, BoxError>(())
    });
    let (host, _peer) = pair(host, peer);

    let err = within(host.request_value("slow", &())).await.unwrap_err();
    assert!(matches!(err, NodelinkError::Timeout(_)));
}

#[tokio::test]
async fn test_terminate_fails_pending_and_later_calls() {
    let peer = Communicator::builder().method("slow", |_: ()| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, BoxError>(())
    });
    let (host, _peer) = pair(Communicator::builder(), peer);

    let call = {
        let host = host.clone();
        tokio::spawn(async move { host.request_value("slow", &()).await })
    };
    wait_for_pending(&host, 1).await;

    within(host.terminate()).await;

    assert!(matches!(
        within(call).await.unwrap(),
        Err(NodelinkError::Terminated)
    ));
    assert!(matches!(
        host.notify("anything", &()).await,
        Err(NodelinkError::Terminated)
    ));
    assert!(matches!(
        host.request_value("anything", &()).await,
        Err(NodelinkError::Terminated)
    ));
    assert_eq!(host.state(), ConnectionState::Closed);

    // Terminating twice is harmless.
    within(host.terminate()).await;
}

#[tokio::test]
async fn test_peer_hangup_fails_pending_with_connection_closed() {
    let peer = Communicator::builder().method("slow", |_: ()| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, BoxError>(())
    });
    let (host, peer) = pair(Communicator::builder(), peer);

    let call = {
        let host = host.clone();
        tokio::spawn(async move { host.request_value("slow", &()).await })
    };
    wait_for_pending(&host, 1).await;

    within(peer.terminate()).await;
    within(host.wait_closed()).await;

    assert!(matches!(
        within(call).await.unwrap(),
        Err(NodelinkError::ConnectionClosed)
    ));
    // The table is drained by now, so new calls fail fast.
    assert!(matches!(
        host.request_value("slow", &()).await,
        Err(NodelinkError::ConnectionClosed)
    ));
    assert!(!host.is_connected());
}

#[tokio::test]
async fn test_handler_capacity() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Notify::new());

    let peer = {
        let gate = gate.clone();
        Communicator::builder()
            .max_concurrent_handlers(1)
            .method("block", move |_: ()| {
                let gate = gate.clone();
                let started = started_tx.clone();
                async move {
                    let _ = started.send(());
                    gate.notified().await;
                    Ok::<_, BoxError>("done")
                }
            })
    };
    let (host, _peer) = pair(Communicator::builder(), peer);

    let first = {
        let host = host.clone();
        tokio::spawn(async move { host.request::<_, String>("block", &()).await })
    };
    within(started_rx.recv()).await.unwrap();

    let err = within(host.request_value("block", &())).await.unwrap_err();
    assert_eq!(rpc_code(err), HANDLER_CAPACITY);

    gate.notify_one();
    assert_eq!(within(first).await.unwrap().unwrap(), "done");

    // The permit is back.
    gate.notify_one();
    let again: String = within(host.request("block", &())).await.unwrap();
    assert_eq!(again, "done");
}

#[tokio::test]
async fn test_notifies_wait_for_handler_capacity() {
    let handled = Arc::new(AtomicUsize::new(0));

    let peer = {
        let handled = handled.clone();
        Communicator::builder()
            .max_concurrent_handlers(4)
            .method("work", move |_: Value| {
                let handled = handled.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                }
            })
    };
    let (host, _peer) = pair(Communicator::builder(), peer);

    for n in 0..100 {
        host.notify("work", &json!({ "n": n })).await.unwrap();
    }

    within(async {
        while handled.load(Ordering::SeqCst) < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(handled.load(Ordering::SeqCst), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handlers_start_in_arrival_order() {
    const COUNT: u64 = 2000;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let peer = {
        let seen = seen.clone();
        Communicator::builder().method("seq", move |p: Value| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(p["n"].as_u64().unwrap());
                Ok::<_, BoxError>(())
            }
        })
    };
    let (host, _peer) = pair(Communicator::builder(), peer);

    for n in 0..COUNT {
        host.notify("seq", &json!({ "n": n })).await.unwrap();
    }

    within(async {
        while (seen.lock().unwrap().len() as u64) < COUNT {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (0..COUNT).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_terminate_with_peer_not_reading() {
    let (a, _held) = tokio::io::duplex(1024);
    let host = Communicator::builder()
        .close_timeout(Duration::from_millis(100))
        .attach(a)
        .unwrap();

    // Far more than the stream buffers, and nobody drains the other end.
    let text = "x".repeat(64 * 1024);
    host.notify("bulk", &json!({ "text": text })).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(3), host.terminate())
        .await
        .expect("terminate blocked on a stalled peer");
    assert_eq!(host.state(), ConnectionState::Closed);
    assert!(matches!(
        host.notify("bulk", &()).await,
        Err(NodelinkError::Terminated)
    ));
}

#[tokio::test]
async fn test_register_and_unregister_at_runtime() {
    let (host, peer) = pair(Communicator::builder(), Communicator::builder());

    peer.register("twice", |n: Value| async move {
        Ok::<_, BoxError>(n["n"].as_i64().unwrap_or(0) * 2)
    });
    let got: i64 = within(host.request("twice", &json!({"n": 21}))).await.unwrap();
    assert_eq!(got, 42);

    // Replacing takes effect for the next call.
    peer.register("twice", |_: Value| async { Ok::<_, BoxError>(0) });
    let got: i64 = within(host.request("twice", &json!({"n": 21}))).await.unwrap();
    assert_eq!(got, 0);

    assert!(peer.unregister("twice"));
    let err = within(host.request_value("twice", &())).await.unwrap_err();
    assert_eq!(rpc_code(err), METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_handler_can_call_back() {
    let (host, peer) = pair(
        Communicator::builder()
            .method("host.base", |_: ()| async { Ok::<_, BoxError>(40) }),
        Communicator::builder(),
    );

    let callback = peer.clone();
    peer.register("peer.answer", move |_: ()| {
        let callback = callback.clone();
        async move {
            let base: i64 = callback.request("host.base", &()).await?;
            Ok::<_, BoxError>(base + 2)
        }
    });

    let answer: i64 = within(host.request("peer.answer", &())).await.unwrap();
    assert_eq!(answer, 42);
}

#[tokio::test]
async fn test_state_reporting() {
    let (host, _peer) = pair(Communicator::builder(), Communicator::builder());

    assert!(host.is_connected());
    assert_eq!(host.state(), ConnectionState::Connected);
    within(host.wait_connected()).await.unwrap();
    assert!(host.socket_path().is_none());
    assert!(host.console_output().await.is_none());

    host.terminate().await;
    assert!(matches!(
        host.wait_connected().await,
        Err(NodelinkError::Terminated)
    ));
}
