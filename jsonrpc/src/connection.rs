//! Connection: owns a duplex transport and manages the JSON-RPC lifecycle.
//!
//! Two background tasks serve each running connection: a reader that frames,
//! decodes and dispatches inbound bytes, and a writer that drains a single
//! FIFO of encoded frames. State the two sides share (lifecycle, id counter,
//! outstanding requests, handler slot) lives behind one mutex; the inbound
//! backlog is a local of the reader task.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use conduit_types::{
    ErrorResponse, LogMessageNotification, LogMessageParams, Message, MessageKind, MessageType,
    Notification, NotificationType, Request, RequestId, RequestType, Response, ResponseError,
    ShowMessageNotification,
};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::codec::{self, DecodeError};
use crate::config::ConnectionConfig;
use crate::frame::{self, encode_frame};
use crate::registry::{MessageRegistry, Shape};
use crate::transport::{BoxedReader, BoxedWriter, Transport};

/// Receives the outcome of a request we sent.
pub type ReplyCallback = Box<dyn FnOnce(Result<serde_json::Value, ResponseError>) + Send>;

type CloseHook = Box<dyn FnOnce() + Send>;

/// Answers what the peer sends us.
///
/// Both methods run on the connection's reader task, in arrival order.
/// Long-running work should be moved elsewhere; the [`ReplySink`] can be
/// used from any thread.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_notification(&self, notification: Notification);
    fn handle_request(&self, request: Request, reply: ReplySink);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport wired up, no traffic yet.
    Created,
    Running,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection already started")]
    AlreadyStarted,
    #[error("connection is closed")]
    Closed,
}

/// Failure of a typed [`Connection::request`].
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Response(#[from] ResponseError),
    #[error("cannot serialize params: {0}")]
    Params(#[source] serde_json::Error),
    #[error("cannot deserialize result: {0}")]
    Result(#[source] serde_json::Error),
}

enum WriterCommand {
    Frame(Vec<u8>),
    Shutdown,
}

/// Handle on the writer queue. Cheap to clone; holds no reference to the
/// connection itself.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl Outbound {
    fn enqueue(&self, message: &Message) -> bool {
        let body = match codec::encode_message(message) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to encode outgoing {}: {e}", message.kind());
                return false;
            }
        };
        tracing::trace!(kind = %message.kind(), bytes = body.len(), "enqueue");
        self.tx.send(WriterCommand::Frame(encode_frame(&body))).is_ok()
    }
}

fn reply_message(id: RequestId, result: Result<serde_json::Value, ResponseError>) -> Message {
    match result {
        Ok(value) => Response::new(id, value).into(),
        Err(error) => ErrorResponse::new(Some(id), error).into(),
    }
}

/// The one way to answer an inbound request.
///
/// Consuming [`ReplySink::reply`] makes a second reply impossible. A sink
/// dropped without replying answers with an internal error, so the peer
/// never waits forever.
pub struct ReplySink {
    id: RequestId,
    outbound: Outbound,
    replied: bool,
}

impl ReplySink {
    fn new(id: RequestId, outbound: Outbound) -> Self {
        Self {
            id,
            outbound,
            replied: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn reply(mut self, result: Result<serde_json::Value, ResponseError>) {
        self.replied = true;
        self.outbound
            .enqueue(&reply_message(self.id.clone(), result));
    }

    /// Serialize `result` and reply with it.
    pub fn reply_with<T: Serialize>(self, result: Result<T, ResponseError>) {
        let value = result.and_then(|value| {
            serde_json::to_value(value)
                .map_err(|e| ResponseError::internal(format!("cannot serialize result: {e}")))
        });
        self.reply(value);
    }
}

impl Drop for ReplySink {
    fn drop(&mut self) {
        if !self.replied {
            tracing::warn!(id = %self.id, "Request dropped without a reply");
            self.outbound.enqueue(&reply_message(
                self.id.clone(),
                Err(ResponseError::internal("request was dropped without a reply")),
            ));
        }
    }
}

impl fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySink").field("id", &self.id).finish()
    }
}

struct OutstandingRequest {
    method: String,
    result_shape: Shape,
    callback: ReplyCallback,
}

/// Transport halves and the writer queue's receiving end, parked until
/// `start` hands them to the background tasks.
struct PendingIo {
    reader: BoxedReader,
    writer: BoxedWriter,
    writer_rx: mpsc::UnboundedReceiver<WriterCommand>,
}

struct Shared {
    state: ConnectionState,
    next_id: i64,
    outstanding: HashMap<RequestId, OutstandingRequest>,
    handler: Option<Arc<dyn MessageHandler>>,
    pending_io: Option<PendingIo>,
    reader_task: Option<JoinHandle<()>>,
    on_close: Option<CloseHook>,
}

struct Inner {
    name: String,
    span: Span,
    config: ConnectionConfig,
    registry: Arc<MessageRegistry>,
    outbound: Outbound,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    name: String,
    config: ConnectionConfig,
    registry: Arc<MessageRegistry>,
    span: Option<Span>,
    on_close: Option<CloseHook>,
}

impl ConnectionBuilder {
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Methods recognized on this connection. Default: the base protocol.
    pub fn registry(mut self, registry: impl Into<Arc<MessageRegistry>>) -> Self {
        self.registry = registry.into();
        self
    }

    /// Span all of the connection's diagnostics are emitted under.
    /// Default: `jsonrpc{connection=<name>}`.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Runs exactly once, when the connection closes.
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn build(self, transport: Transport) -> Connection {
        let (reader, writer) = transport.into_parts();
        let (tx, writer_rx) = mpsc::unbounded_channel();
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("jsonrpc", connection = %self.name));
        let (state_tx, _) = watch::channel(ConnectionState::Created);

        Connection {
            inner: Arc::new(Inner {
                name: self.name,
                span,
                config: self.config,
                registry: self.registry,
                outbound: Outbound { tx },
                shared: Mutex::new(Shared {
                    state: ConnectionState::Created,
                    next_id: 1,
                    outstanding: HashMap::new(),
                    handler: None,
                    pending_io: Some(PendingIo {
                        reader,
                        writer,
                        writer_rx,
                    }),
                    reader_task: None,
                    on_close: self.on_close,
                }),
                state_tx,
            }),
        }
    }
}

/// A JSON-RPC endpoint over one duplex transport.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn builder(name: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder {
            name: name.into(),
            config: ConnectionConfig::default(),
            registry: Arc::new(MessageRegistry::with_base_protocol()),
            span: None,
            on_close: None,
        }
    }

    /// A connection with default configuration and the base-protocol registry.
    pub fn new(name: impl Into<String>, transport: Transport) -> Self {
        Self::builder(name).build(transport)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Number of sent requests still waiting for a reply.
    #[must_use]
    pub fn outstanding_requests(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    /// Begin exchanging messages, delivering inbound traffic to `handler`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<(), ConnectionError> {
        let mut shared = self.inner.lock();
        match shared.state {
            ConnectionState::Created => {}
            ConnectionState::Running => return Err(ConnectionError::AlreadyStarted),
            ConnectionState::Closed => return Err(ConnectionError::Closed),
        }
        let Some(io) = shared.pending_io.take() else {
            return Err(ConnectionError::AlreadyStarted);
        };
        shared.state = ConnectionState::Running;
        shared.handler = Some(handler);

        let weak = Arc::downgrade(&self.inner);
        let span = self.inner.span.clone();
        shared.reader_task = Some(tokio::spawn(
            read_loop(weak.clone(), io.reader, self.inner.config.clone()).instrument(span.clone()),
        ));
        tokio::spawn(write_loop(weak, io.writer, io.writer_rx).instrument(span.clone()));
        drop(shared);

        self.inner.state_tx.send_replace(ConnectionState::Running);
        let permissive = self.inner.registry.is_permissive();
        span.in_scope(|| tracing::debug!(permissive, "Connection started"));
        Ok(())
    }

    /// Send a notification. Dropped unless the connection is running.
    pub fn send_notification(&self, method: impl Into<String>, params: Option<serde_json::Value>) {
        let notification = Notification::new(method, params);
        let shared = self.inner.lock();
        if shared.state != ConnectionState::Running {
            self.inner.span.in_scope(|| {
                tracing::debug!(
                    method = %notification.method,
                    state = %shared.state,
                    "Dropping notification: connection not running"
                );
            });
            return;
        }
        self.inner.outbound.enqueue(&notification.into());
    }

    /// Typed [`Connection::send_notification`].
    pub fn notify<N: NotificationType>(&self, params: N::Params) {
        match serde_json::to_value(params) {
            Ok(params) => self.send_notification(N::METHOD, non_null(params)),
            Err(e) => self.inner.span.in_scope(|| {
                tracing::error!("Failed to serialize {} params: {e}", N::METHOD);
            }),
        }
    }

    /// Send a request; `callback` receives the reply exactly once.
    ///
    /// If the connection is not running the callback is invoked immediately
    /// with a cancellation error and nothing is written.
    pub fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        callback: impl FnOnce(Result<serde_json::Value, ResponseError>) + Send + 'static,
    ) -> RequestId {
        let method = method.into();
        let result_shape = self.inner.registry.result_shape(&method);
        self.inner
            .send_request(method, params, result_shape, Box::new(callback))
    }

    /// Send a typed request and wait for its reply.
    pub async fn request<R: RequestType>(
        &self,
        params: R::Params,
    ) -> Result<R::Result, RequestError> {
        let params = serde_json::to_value(params).map_err(RequestError::Params)?;
        let (tx, rx) = oneshot::channel();
        self.inner.send_request(
            R::METHOD.to_string(),
            non_null(params),
            Shape::of::<R::Result>(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let value = rx
            .await
            .unwrap_or_else(|_| Err(ResponseError::server_cancelled()))?;
        serde_json::from_value(value).map_err(RequestError::Result)
    }

    /// Answer an inbound request by id. Dropped unless the connection is
    /// running. Prefer the [`ReplySink`] handed to the handler.
    pub fn send_reply(&self, id: RequestId, result: Result<serde_json::Value, ResponseError>) {
        self.inner.send_reply(id, result);
    }

    /// Close the connection. Idempotent.
    ///
    /// Queued writes are flushed before the transport is shut down. Every
    /// outstanding request fails with [`ResponseError::server_cancelled`].
    pub fn close(&self) {
        self.inner.close();
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }
}

fn non_null(value: serde_json::Value) -> Option<serde_json::Value> {
    (!value.is_null()).then_some(value)
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.lock().handler.clone()
    }

    fn send_request(
        &self,
        method: String,
        params: Option<serde_json::Value>,
        result_shape: Shape,
        callback: ReplyCallback,
    ) -> RequestId {
        let mut shared = self.lock();
        let id = RequestId::Number(shared.next_id);
        shared.next_id += 1;

        let refusal = match shared.state {
            ConnectionState::Running => None,
            ConnectionState::Created => Some(ResponseError::cancelled()),
            ConnectionState::Closed => Some(ResponseError::server_cancelled()),
        };
        if let Some(error) = refusal {
            let state = shared.state;
            drop(shared);
            self.span.in_scope(|| {
                tracing::debug!(%id, %method, %state, "Refusing request: connection not running");
            });
            callback(Err(error));
            return id;
        }

        let message: Message = Request::new(id.clone(), method.clone(), params).into();
        shared.outstanding.insert(
            id.clone(),
            OutstandingRequest {
                method,
                result_shape,
                callback,
            },
        );
        if !self.outbound.enqueue(&message) {
            let entry = shared.outstanding.remove(&id);
            drop(shared);
            if let Some(entry) = entry {
                (entry.callback)(Err(ResponseError::internal(format!(
                    "failed to send request {}",
                    entry.method
                ))));
            }
        }
        id
    }

    fn send_reply(&self, id: RequestId, result: Result<serde_json::Value, ResponseError>) {
        let shared = self.lock();
        if shared.state != ConnectionState::Running {
            self.span.in_scope(|| {
                tracing::debug!(%id, state = %shared.state, "Dropping reply: connection not running");
            });
            return;
        }
        self.outbound.enqueue(&reply_message(id, result));
    }

    /// Send a diagnostic notification to the peer.
    fn notify_peer(&self, show: bool, kind: MessageType, message: String) {
        let params = LogMessageParams { kind, message };
        let method = if show {
            ShowMessageNotification::METHOD
        } else {
            LogMessageNotification::METHOD
        };
        match serde_json::to_value(params) {
            Ok(params) => {
                let shared = self.lock();
                if shared.state == ConnectionState::Running {
                    self.outbound
                        .enqueue(&Notification::new(method, Some(params)).into());
                }
            }
            Err(e) => tracing::error!("Failed to serialize {method} params: {e}"),
        }
    }

    fn close(&self) {
        let (outstanding, handler, reader_task, on_close) = {
            let mut shared = self.lock();
            if shared.state == ConnectionState::Closed {
                return;
            }
            // Frames queued before this point are written before the writer
            // stops; anything queued after it is discarded.
            let _ = self.outbound.tx.send(WriterCommand::Shutdown);
            shared.state = ConnectionState::Closed;
            shared.pending_io = None;
            (
                mem::take(&mut shared.outstanding),
                shared.handler.take(),
                shared.reader_task.take(),
                shared.on_close.take(),
            )
        };

        if let Some(task) = reader_task {
            task.abort();
        }
        self.span.in_scope(|| {
            tracing::debug!(outstanding = outstanding.len(), "Connection closed");
        });
        for (_, request) in outstanding {
            (request.callback)(Err(ResponseError::server_cancelled()));
        }
        self.state_tx.send_replace(ConnectionState::Closed);
        if let Some(hook) = on_close {
            hook();
        }
        drop(handler);
    }

    fn is_closed(&self) -> bool {
        self.lock().state == ConnectionState::Closed
    }

    /// Split and handle every complete frame in `backlog`, leaving the
    /// incomplete tail in place. Returns `false` once the connection is
    /// closed.
    fn process_backlog(&self, backlog: &mut Vec<u8>) -> bool {
        let mut offset = 0;
        let keep_reading = loop {
            if self.is_closed() {
                break false;
            }
            let pending = &backlog[offset..];
            match frame::split_frame(pending, self.config.max_frame_bytes) {
                Ok(Some(frame)) => {
                    offset += frame.consumed(pending.len());
                    self.handle_body(frame.body);
                }
                Ok(None) => break true,
                Err(e) => {
                    tracing::error!("Unrecoverable framing error: {e}");
                    self.close();
                    break false;
                }
            }
        };
        backlog.drain(..offset);
        keep_reading
    }

    fn handle_body(&self, body: &[u8]) {
        let decoded = codec::decode_message(body, &self.registry, |id| {
            self.lock()
                .outstanding
                .get(id)
                .map(|request| request.result_shape)
        });
        match decoded {
            Ok(message) => self.dispatch(message),
            Err(error) => self.recover(error),
        }
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::Notification(notification) => {
                tracing::trace!(method = %notification.method, "<- notification");
                if let Some(handler) = self.handler() {
                    handler.handle_notification(notification);
                }
            }
            Message::Request(request) => {
                tracing::trace!(id = %request.id, method = %request.method, "<- request");
                if let Some(handler) = self.handler() {
                    let reply = ReplySink::new(request.id.clone(), self.outbound.clone());
                    handler.handle_request(request, reply);
                }
            }
            Message::Response(response) => {
                self.resolve(&response.id, Ok(response.result));
            }
            Message::ErrorResponse(ErrorResponse { id: Some(id), error }) => {
                self.resolve(&id, Err(error));
            }
            Message::ErrorResponse(ErrorResponse { id: None, error }) => {
                tracing::warn!("Peer reported an error without a request id: {error}");
            }
        }
    }

    /// Hand a reply to the callback of the matching outstanding request.
    /// Returns `false` if no request with that id is outstanding.
    fn resolve(&self, id: &RequestId, result: Result<serde_json::Value, ResponseError>) -> bool {
        let entry = self.lock().outstanding.remove(id);
        match entry {
            Some(request) => {
                tracing::trace!(%id, method = %request.method, ok = result.is_ok(), "<- reply");
                (request.callback)(result);
                true
            }
            None => {
                tracing::warn!(%id, "Dropping reply to unknown request");
                false
            }
        }
    }

    /// Recover from a frame whose body could not be decoded. Framing is
    /// intact, so the stream stays usable; what the peer needs to hear
    /// depends on what the frame was trying to be.
    fn recover(&self, error: DecodeError) {
        let method = error.method.as_deref().unwrap_or("<unknown>");
        match (error.kind, &error.id) {
            (MessageKind::Request, Some(id)) => {
                tracing::warn!(%id, method, "Replying with error to undecodable request: {error}");
                self.send_reply(id.clone(), Err(error.to_response_error()));
            }
            (MessageKind::Request, None) => {
                tracing::error!(method, "Dropping request without a usable id: {error}");
                self.notify_peer(
                    false,
                    MessageType::Error,
                    format!("dropped request '{method}' that could not be answered: {error}"),
                );
            }
            (MessageKind::Response, Some(id)) => {
                if self.resolve(id, Err(error.to_response_error())) {
                    tracing::warn!(%id, "Undecodable reply: {error}");
                }
            }
            (MessageKind::Response, None) => {
                tracing::warn!("Discarding undecodable reply without an id: {error}");
            }
            (MessageKind::Notification, _) if error.is_unknown_method() => {
                tracing::debug!(method, "Ignoring unknown notification");
            }
            (MessageKind::Notification, _) => {
                tracing::warn!(method, "Ignoring malformed notification: {error}");
                self.notify_peer(
                    true,
                    MessageType::Warning,
                    format!(
                        "ignored malformed '{method}' notification; state may be out of sync: {error}"
                    ),
                );
            }
            (MessageKind::Unknown, _) => {
                tracing::warn!("Ignoring unrecognized message: {error}");
                self.notify_peer(
                    false,
                    MessageType::Warning,
                    format!("ignored a message that could not be decoded: {error}"),
                );
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(weak: Weak<Inner>, mut reader: BoxedReader, config: ConnectionConfig) {
    let mut backlog = Vec::new();
    let mut chunk = vec![0u8; config.read_chunk_bytes.max(1)];
    loop {
        let read = reader.read(&mut chunk).await;
        let Some(inner) = weak.upgrade() else { return };
        match read {
            Ok(0) => {
                if !backlog.is_empty() {
                    tracing::debug!(bytes = backlog.len(), "Discarding partial frame at EOF");
                }
                tracing::info!("Peer closed the stream");
                inner.close();
                return;
            }
            Ok(n) => {
                backlog.extend_from_slice(&chunk[..n]);
                if !inner.process_backlog(&mut backlog) {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Read error: {e}");
                inner.close();
                return;
            }
        }
    }
}

async fn write_loop(
    weak: Weak<Inner>,
    mut writer: BoxedWriter,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Frame(frame) => {
                let written = async {
                    writer.write_all(&frame).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::warn!("Write error: {e}");
                    if let Some(inner) = weak.upgrade() {
                        inner.close();
                    }
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Transport shutdown failed: {e}");
    }
}
