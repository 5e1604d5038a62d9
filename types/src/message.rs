//! The four JSON-RPC message shapes.
//!
//! Payloads stay as [`serde_json::Value`] here. Whether a payload matches
//! what a method expects is decided at decode time against a registry, and
//! handlers convert to concrete types through [`Request::params_as`] and
//! friends.

use std::fmt;

use serde::de::DeserializeOwned;

use crate::error::ResponseError;
use crate::ids::RequestId;

/// Value of the literal `jsonrpc` member every message carries.
pub const JSONRPC_VERSION: &str = "2.0";

fn payload_as<T: DeserializeOwned>(
    payload: Option<&serde_json::Value>,
) -> Result<T, serde_json::Error> {
    match payload {
        Some(value) => T::deserialize(value),
        None => T::deserialize(&serde_json::Value::Null),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Deserialize `params`; an absent member reads as `null`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        payload_as(self.params.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(
        id: RequestId,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Deserialize `params`; an absent member reads as `null`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        payload_as(self.params.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: serde_json::Value,
}

impl Response {
    #[must_use]
    pub fn new(id: RequestId, result: serde_json::Value) -> Self {
        Self { id, result }
    }

    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        payload_as(Some(&self.result))
    }
}

/// An error reply.
///
/// `id` is `None` when the peer could not recover the id of the request it
/// is rejecting (for example when our frame was not valid JSON).
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub id: Option<RequestId>,
    pub error: ResponseError,
}

impl ErrorResponse {
    #[must_use]
    pub fn new(id: Option<RequestId>, error: ResponseError) -> Self {
        Self { id, error }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Notification(Notification),
    Request(Request),
    Response(Response),
    ErrorResponse(ErrorResponse),
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Notification(_) => MessageKind::Notification,
            Self::Request(_) => MessageKind::Request,
            Self::Response(_) | Self::ErrorResponse(_) => MessageKind::Response,
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Notification(_) => None,
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::ErrorResponse(r) => r.id.as_ref(),
        }
    }

    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Notification(n) => Some(&n.method),
            Self::Request(r) => Some(&r.method),
            Self::Response(_) | Self::ErrorResponse(_) => None,
        }
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Self::Notification(value)
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Self::Response(value)
    }
}

impl From<ErrorResponse> for Message {
    fn from(value: ErrorResponse) -> Self {
        Self::ErrorResponse(value)
    }
}

/// What a message was classified as, attached to decode failures.
///
/// Error responses classify as [`MessageKind::Response`]: for recovery
/// purposes both answer one of our requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Unknown,
}

impl MessageKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Notification => "notification",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
