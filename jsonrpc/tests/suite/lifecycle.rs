//! Connection lifecycle: start, round-trips, ordering, close

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use conduit_jsonrpc::{Connection, ConnectionError, ConnectionState, RequestError};
use conduit_types::{
    ErrorCode, ExitNotification, LogMessageNotification, LogMessageParams, MessageType, RequestId,
    ResponseError, ShutdownRequest,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::common::{EchoParams, Event, Forward, LogCapture, TIMEOUT, pipe, started};

#[tokio::test]
async fn request_round_trip_with_typed_result() {
    let mut h = started();

    let connection = h.connection.clone();
    let pending = tokio::spawn(async move { connection.request::<ShutdownRequest>(()).await });

    let frame = h.peer.recv().await;
    assert_eq!(frame["method"], "shutdown");
    assert_eq!(frame["id"], 1);
    assert!(frame.get("params").is_none());
    h.peer
        .send(json!({"jsonrpc": "2.0", "id": 1, "result": null}))
        .await;

    pending.await.unwrap().unwrap();
    assert_eq!(h.connection.outstanding_requests(), 0);
}

#[tokio::test]
async fn error_reply_reaches_typed_caller() {
    let mut h = started();
    let connection = h.connection.clone();
    let pending = tokio::spawn(async move { connection.request::<ShutdownRequest>(()).await });

    let frame = h.peer.recv().await;
    h.peer
        .send(json!({
            "jsonrpc": "2.0",
            "id": frame["id"],
            "error": {"code": -32803, "message": "nope", "data": {"why": "busy"}}
        }))
        .await;

    let Err(RequestError::Response(error)) = pending.await.unwrap() else {
        panic!("expected a response error");
    };
    assert_eq!(error.code, ErrorCode::REQUEST_FAILED);
    assert_eq!(error.message, "nope");
    assert_eq!(error.data, Some(json!({"why": "busy"})));
}

#[tokio::test]
async fn inbound_request_is_answered_through_reply_sink() {
    let mut h = started();
    h.peer
        .send(json!({"jsonrpc": "2.0", "id": "abc", "method": "test/echo", "params": {"text": "hi"}}))
        .await;

    let Event::Request(request, reply) = h.next_event().await else {
        panic!("expected a request");
    };
    assert_eq!(request.id, RequestId::from("abc"));
    assert_eq!(reply.id(), &request.id);
    let params: EchoParams = request.params_as().unwrap();
    reply.reply_with(Ok::<_, ResponseError>(params));

    let frame = h.peer.recv().await;
    assert_eq!(frame, json!({"jsonrpc": "2.0", "id": "abc", "result": {"text": "hi"}}));
}

#[tokio::test]
async fn dropped_reply_sink_answers_with_internal_error() {
    let mut h = started();
    h.peer
        .send(json!({"jsonrpc": "2.0", "id": 3, "method": "test/echo", "params": {"text": "hi"}}))
        .await;

    let Event::Request(_, reply) = h.next_event().await else {
        panic!("expected a request");
    };
    drop(reply);

    let frame = h.peer.recv().await;
    assert_eq!(frame["id"], 3);
    assert_eq!(frame["error"]["code"], ErrorCode::INTERNAL_ERROR.value());
}

#[tokio::test]
async fn notifications_reach_handler_and_peer() {
    let mut h = started();
    h.connection.notify::<LogMessageNotification>(LogMessageParams {
        kind: MessageType::Info,
        message: "hello".to_string(),
    });
    let frame = h.peer.recv().await;
    assert_eq!(
        frame,
        json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"type": 3, "message": "hello"}})
    );

    h.connection.notify::<ExitNotification>(());
    let frame = h.peer.recv().await;
    assert_eq!(frame, json!({"jsonrpc": "2.0", "method": "exit"}));

    h.peer
        .send(json!({"jsonrpc": "2.0", "method": "test/ping", "params": {"text": "pong"}}))
        .await;
    let Event::Notification(notification) = h.next_event().await else {
        panic!("expected a notification");
    };
    let params: EchoParams = notification.params_as().unwrap();
    assert_eq!(params.text, "pong");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_get_increasing_ids() {
    const N: usize = 32;
    let mut h = started();

    let mut tasks = Vec::new();
    for _ in 0..N {
        let connection = h.connection.clone();
        tasks.push(tokio::spawn(async move {
            connection.send_request("test/echo", Some(json!({"text": "x"})), |_| {})
        }));
    }
    let mut assigned = Vec::new();
    for task in tasks {
        assigned.push(task.await.unwrap());
    }

    let mut on_wire = Vec::new();
    for _ in 0..N {
        on_wire.push(h.peer.recv().await["id"].as_i64().unwrap());
    }
    assert!(
        on_wire.windows(2).all(|pair| pair[0] < pair[1]),
        "ids not strictly increasing on the wire: {on_wire:?}"
    );

    assigned.sort();
    assigned.dedup();
    assert_eq!(assigned.len(), N);
    assert_eq!(h.connection.outstanding_requests(), N);
}

#[tokio::test]
async fn close_cancels_every_outstanding_request_once() {
    let mut h = started();
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    for _ in 0..3 {
        let tx = tx.clone();
        let calls = calls.clone();
        h.connection.send_request("test/echo", Some(json!({"text": "x"})), move |result| {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });
    }
    for _ in 0..3 {
        let _ = h.peer.recv().await;
    }

    h.connection.close();
    h.connection.close();

    for _ in 0..3 {
        let error = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(error.code, ErrorCode::SERVER_CANCELLED);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.connection.outstanding_requests(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    h.peer.expect_eof().await;
}

#[tokio::test]
async fn close_flushes_queued_writes_before_eof() {
    let mut h = started();
    for i in 0..5 {
        h.connection
            .send_notification("test/ping", Some(json!({"text": i.to_string()})));
    }
    h.connection.close();

    for i in 0..5 {
        assert_eq!(h.peer.recv().await["params"]["text"], i.to_string());
    }
    h.peer.expect_eof().await;
}

#[tokio::test]
async fn replies_after_close_are_not_written() {
    let mut h = started();
    for id in [4, 5] {
        h.peer
            .send(json!({"jsonrpc": "2.0", "id": id, "method": "test/echo", "params": {"text": "hi"}}))
            .await;
    }
    let Event::Request(_, answered) = h.next_event().await else {
        panic!("expected a request");
    };
    let Event::Request(_, abandoned) = h.next_event().await else {
        panic!("expected a request");
    };

    h.connection.close();
    let replier = std::thread::spawn(move || {
        answered.reply(Ok(json!(1)));
        drop(abandoned);
    });
    replier.join().unwrap();

    h.peer.expect_eof().await;
}

#[tokio::test]
async fn sends_after_close_are_refused() {
    let mut h = started();
    h.connection.close();

    let (tx, rx) = oneshot::channel();
    h.connection.send_request("test/echo", None, move |result| {
        let _ = tx.send(result);
    });
    let error = rx.await.unwrap().unwrap_err();
    assert_eq!(error.code, ErrorCode::SERVER_CANCELLED);

    h.connection.send_notification("test/ping", None);
    h.connection.send_reply(RequestId::Number(1), Ok(json!(null)));
    h.peer.expect_eof().await;

    let result = h.connection.request::<ShutdownRequest>(()).await;
    assert!(matches!(result, Err(RequestError::Response(e)) if e.code.is_cancellation()));
}

#[tokio::test]
async fn peer_hang_up_closes_and_runs_hook_once() {
    let (logs, _guard) = LogCapture::install();
    let (transport, peer) = pipe();
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = hook_calls.clone();
    let connection = Connection::builder("hangup")
        .on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build(transport);
    let (tx, _events) = mpsc::unbounded_channel();
    connection.start(Arc::new(Forward(tx))).unwrap();
    assert_eq!(connection.state(), ConnectionState::Running);

    peer.hang_up();
    tokio::time::timeout(TIMEOUT, connection.closed())
        .await
        .unwrap();
    connection.close();

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        connection.start(Arc::new(Forward(mpsc::unbounded_channel().0))),
        Err(ConnectionError::Closed)
    );
    let logs = logs.contents();
    assert!(logs.contains("Peer closed the stream"));
    assert!(logs.contains("hangup"));
}

#[tokio::test]
async fn typed_request_reports_result_mismatch() {
    let mut h = started();
    let connection = h.connection.clone();
    let pending = tokio::spawn(async move { connection.request::<ShutdownRequest>(()).await });

    let frame = h.peer.recv().await;
    h.peer
        .send(json!({"jsonrpc": "2.0", "id": frame["id"], "result": {"unexpected": true}}))
        .await;

    let Err(RequestError::Response(error)) = pending.await.unwrap() else {
        panic!("expected the undecodable result to surface as an error");
    };
    assert_eq!(error.code, ErrorCode::INTERNAL_ERROR);
}
