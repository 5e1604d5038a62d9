//! JSON-RPC message codec.
//!
//! Turns a frame body into one of the four [`Message`] shapes and back.
//! Decoding needs two pieces of outside knowledge: which methods exist and
//! what their params look like (the [`MessageRegistry`]), and what result a
//! response id should carry (a resolver over the caller's outstanding
//! requests).

use conduit_types::{
    ErrorCode, ErrorResponse, JSONRPC_VERSION, Message, MessageKind, Notification, Request,
    RequestId, Response, ResponseError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{MessageRegistry, Shape};

/// Why a frame body could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message not recognized as request, response, or notification")]
    Unclassified,
    #[error("unsupported jsonrpc version {0}")]
    UnsupportedVersion(String),
    #[error("invalid request id {0}")]
    InvalidId(String),
    #[error("method must be a string")]
    InvalidMethod,
    #[error("unknown method {0}")]
    UnknownMethod(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("invalid result: {0}")]
    InvalidResult(String),
    #[error("invalid error object: {0}")]
    InvalidErrorObject(String),
    #[error("response to unknown request {0}")]
    UnknownRequest(RequestId),
}

impl DecodeFailure {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidJson(_) => ErrorCode::PARSE_ERROR,
            Self::NotAnObject
            | Self::Unclassified
            | Self::UnsupportedVersion(_)
            | Self::InvalidId(_)
            | Self::InvalidMethod => ErrorCode::INVALID_REQUEST,
            Self::UnknownMethod(_) => ErrorCode::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => ErrorCode::INVALID_PARAMS,
            Self::InvalidResult(_) | Self::InvalidErrorObject(_) | Self::UnknownRequest(_) => {
                ErrorCode::INTERNAL_ERROR
            }
        }
    }
}

/// A decode failure together with everything recovered before it happened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode {kind}: {failure}")]
pub struct DecodeError {
    pub kind: MessageKind,
    pub id: Option<RequestId>,
    pub method: Option<String>,
    pub failure: DecodeFailure,
}

impl DecodeError {
    fn unknown(failure: DecodeFailure) -> Self {
        Self {
            kind: MessageKind::Unknown,
            id: None,
            method: None,
            failure,
        }
    }

    #[must_use]
    pub fn is_unknown_method(&self) -> bool {
        matches!(self.failure, DecodeFailure::UnknownMethod(_))
    }

    /// The error to report to the peer, or to a local reply callback.
    #[must_use]
    pub fn to_response_error(&self) -> ResponseError {
        match &self.failure {
            DecodeFailure::UnknownMethod(method) => ResponseError::method_not_found(method),
            failure => ResponseError::new(failure.code(), self.to_string()),
        }
    }
}

#[derive(Serialize)]
struct WireNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a serde_json::Value>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a serde_json::Value>,
}

#[derive(Serialize)]
struct WireResponse<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    result: &'a serde_json::Value,
}

#[derive(Serialize)]
struct WireErrorResponse<'a> {
    jsonrpc: &'static str,
    id: Option<&'a RequestId>,
    error: &'a ResponseError,
}

/// Serialize a message to its JSON body (no framing header).
pub fn encode_message(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    match message {
        Message::Notification(n) => serde_json::to_vec(&WireNotification {
            jsonrpc: JSONRPC_VERSION,
            method: &n.method,
            params: n.params.as_ref(),
        }),
        Message::Request(r) => serde_json::to_vec(&WireRequest {
            jsonrpc: JSONRPC_VERSION,
            id: &r.id,
            method: &r.method,
            params: r.params.as_ref(),
        }),
        Message::Response(r) => serde_json::to_vec(&WireResponse {
            jsonrpc: JSONRPC_VERSION,
            id: &r.id,
            result: &r.result,
        }),
        Message::ErrorResponse(r) => serde_json::to_vec(&WireErrorResponse {
            jsonrpc: JSONRPC_VERSION,
            id: r.id.as_ref(),
            error: &r.error,
        }),
    }
}

#[derive(Clone, Copy)]
enum Classified {
    Notification,
    Request,
    Result,
    Error,
}

impl Classified {
    fn kind(self) -> MessageKind {
        match self {
            Self::Notification => MessageKind::Notification,
            Self::Request => MessageKind::Request,
            Self::Result | Self::Error => MessageKind::Response,
        }
    }
}

/// Decode a frame body.
///
/// `resolve` maps the id of an incoming response to the result shape of the
/// request we sent under that id; returning `None` makes the response fail
/// with [`DecodeFailure::UnknownRequest`].
pub fn decode_message(
    body: &[u8],
    registry: &MessageRegistry,
    resolve: impl FnOnce(&RequestId) -> Option<Shape>,
) -> Result<Message, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| DecodeError::unknown(DecodeFailure::InvalidJson(e.to_string())))?;
    let serde_json::Value::Object(mut object) = value else {
        return Err(DecodeError::unknown(DecodeFailure::NotAnObject));
    };

    let raw_id = object.get("id");
    let id = raw_id.and_then(RequestId::from_json);
    let raw_method = object.get("method");
    let method = raw_method.and_then(|m| m.as_str()).map(String::from);

    let classified = match (
        raw_method.is_some(),
        raw_id.is_some(),
        object.contains_key("result"),
        object.contains_key("error"),
    ) {
        (true, false, _, _) => Classified::Notification,
        (true, true, _, _) => Classified::Request,
        (false, true, true, false) => Classified::Result,
        (false, _, _, true) => Classified::Error,
        _ => {
            return Err(DecodeError {
                kind: MessageKind::Unknown,
                id,
                method,
                failure: DecodeFailure::Unclassified,
            });
        }
    };

    let fail = |failure: DecodeFailure| DecodeError {
        kind: classified.kind(),
        id: id.clone(),
        method: method.clone(),
        failure,
    };

    // A null id is only meaningful on an error response.
    if let Some(raw) = raw_id
        && id.is_none()
        && !(raw.is_null() && matches!(classified, Classified::Error))
    {
        return Err(fail(DecodeFailure::InvalidId(raw.to_string())));
    }
    if raw_method.is_some() && method.is_none() {
        return Err(fail(DecodeFailure::InvalidMethod));
    }
    match object.get("jsonrpc") {
        Some(serde_json::Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => return Err(fail(DecodeFailure::UnsupportedVersion(other.to_string()))),
        None => {
            return Err(fail(DecodeFailure::UnsupportedVersion(
                "(missing)".to_string(),
            )));
        }
    }

    match classified {
        Classified::Notification | Classified::Request => {
            let method = method.clone().unwrap_or_default();
            let params = object.remove("params");
            let shape = match classified {
                Classified::Notification => registry.notification_params(&method),
                _ => registry.request_params(&method),
            }
            .ok_or_else(|| fail(DecodeFailure::UnknownMethod(method.clone())))?;
            shape
                .check(params.as_ref().unwrap_or(&serde_json::Value::Null))
                .map_err(|e| fail(DecodeFailure::InvalidParams(e.to_string())))?;

            Ok(match (classified, id.clone()) {
                (Classified::Request, Some(id)) => Request::new(id, method, params).into(),
                _ => Notification::new(method, params).into(),
            })
        }
        Classified::Result => {
            let Some(id) = id.clone() else {
                return Err(fail(DecodeFailure::InvalidId("null".to_string())));
            };
            let shape =
                resolve(&id).ok_or_else(|| fail(DecodeFailure::UnknownRequest(id.clone())))?;
            let result = object
                .remove("result")
                .unwrap_or(serde_json::Value::Null);
            shape
                .check(&result)
                .map_err(|e| fail(DecodeFailure::InvalidResult(e.to_string())))?;
            Ok(Response::new(id, result).into())
        }
        Classified::Error => {
            let raw_error = object.remove("error").unwrap_or(serde_json::Value::Null);
            let error = ResponseError::deserialize(raw_error)
                .map_err(|e| fail(DecodeFailure::InvalidErrorObject(e.to_string())))?;
            Ok(ErrorResponse::new(id.clone(), error).into())
        }
    }
}
