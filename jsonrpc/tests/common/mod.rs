//! Shared test utilities and fixtures
//!
//! A `Peer` plays the far end of a connection at the byte level, so tests can
//! send frames the codec would never produce and inspect exactly what the
//! connection writes.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conduit_jsonrpc::frame::{encode_frame, split_frame, DEFAULT_MAX_FRAME_BYTES};
use conduit_jsonrpc::{
    Connection, ConnectionConfig, MessageHandler, MessageRegistry, ReplySink, Shape, Transport,
};
use conduit_types::{Notification, Request};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoParams {
    pub text: String,
}

/// Base protocol plus `test/echo` and `foo` (requests) and `test/ping`
/// (notification), all taking [`EchoParams`].
pub fn test_registry() -> MessageRegistry {
    let mut registry = MessageRegistry::with_base_protocol();
    registry
        .register_request_method(
            "test/echo",
            Shape::of::<EchoParams>(),
            Shape::of::<EchoParams>(),
        )
        .register_request_method("foo", Shape::of::<EchoParams>(), Shape::any())
        .register_notification_method("test/ping", Shape::of::<EchoParams>());
    registry
}

/// What the connection handed to its handler.
pub enum Event {
    Notification(Notification),
    Request(Request, ReplySink),
}

/// Forwards every inbound message to the test body.
pub struct Forward(pub mpsc::UnboundedSender<Event>);

impl MessageHandler for Forward {
    fn handle_notification(&self, notification: Notification) {
        let _ = self.0.send(Event::Notification(notification));
    }

    fn handle_request(&self, request: Request, reply: ReplySink) {
        let _ = self.0.send(Event::Request(request, reply));
    }
}

/// The far end of a connection, speaking raw bytes.
pub struct Peer {
    stream: DuplexStream,
    backlog: Vec<u8>,
}

impl Peer {
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn send_body(&mut self, body: &[u8]) {
        self.send_raw(&encode_frame(body)).await;
    }

    pub async fn send(&mut self, message: serde_json::Value) {
        self.send_body(&serde_json::to_vec(&message).unwrap()).await;
    }

    /// Next frame from the connection, or `None` at EOF.
    pub async fn try_recv(&mut self) -> Option<serde_json::Value> {
        loop {
            if let Some(frame) = split_frame(&self.backlog, DEFAULT_MAX_FRAME_BYTES).unwrap() {
                let value = serde_json::from_slice(frame.body).unwrap();
                let consumed = frame.consumed(self.backlog.len());
                self.backlog.drain(..consumed);
                return Some(value);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return None;
            }
            self.backlog.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn recv(&mut self) -> serde_json::Value {
        tokio::time::timeout(TIMEOUT, self.try_recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed the stream")
    }

    /// Assert the connection writes nothing for `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(frame) = tokio::time::timeout(wait, self.try_recv()).await {
            panic!("expected silence, got {frame:?}");
        }
    }

    pub async fn expect_eof(&mut self) {
        let frame = tokio::time::timeout(TIMEOUT, self.try_recv())
            .await
            .expect("timed out waiting for EOF");
        assert!(frame.is_none(), "expected EOF, got {frame:?}");
    }

    /// Hang up both directions.
    pub fn hang_up(self) {
        drop(self);
    }
}

/// A connection over an in-memory pipe, and the peer at the other end.
pub fn pipe() -> (Transport, Peer) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(ours);
    (
        Transport::new(reader, writer),
        Peer {
            stream: theirs,
            backlog: Vec::new(),
        },
    )
}

pub struct Harness {
    pub connection: Connection,
    pub peer: Peer,
    pub events: mpsc::UnboundedReceiver<Event>,
}

impl Harness {
    pub async fn next_event(&mut self) -> Event {
        tokio::time::timeout(TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for the handler")
            .expect("handler channel closed")
    }
}

/// A started connection using [`test_registry`].
pub fn started() -> Harness {
    started_with(ConnectionConfig::default())
}

pub fn started_with(config: ConnectionConfig) -> Harness {
    let (transport, peer) = pipe();
    let connection = Connection::builder("test")
        .config(config)
        .registry(test_registry())
        .build(transport);
    let (tx, events) = mpsc::unbounded_channel();
    connection.start(Arc::new(Forward(tx))).unwrap();
    Harness {
        connection,
        peer,
        events,
    }
}

/// Log output captured from a `tracing` subscriber.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Install a capturing subscriber for the current thread.
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
