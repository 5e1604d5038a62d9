//! Wire-level error objects carried by error responses.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A JSON-RPC error code.
///
/// Kept as an open newtype rather than an enum: peers may send codes we
/// have never heard of, and those must round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(i64);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);

    pub const SERVER_NOT_INITIALIZED: Self = Self(-32002);
    pub const UNKNOWN_ERROR_CODE: Self = Self(-32001);

    pub const REQUEST_FAILED: Self = Self(-32803);
    pub const SERVER_CANCELLED: Self = Self(-32802);
    pub const CONTENT_MODIFIED: Self = Self(-32801);
    pub const REQUEST_CANCELLED: Self = Self(-32800);

    #[must_use]
    pub const fn new(code: i64) -> Self {
        Self(code)
    }

    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Whether this code reports that the request was cancelled rather than
    /// failed.
    #[must_use]
    pub fn is_cancellation(self) -> bool {
        self == Self::REQUEST_CANCELLED || self == Self::SERVER_CANCELLED
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `error` member of an error response.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResponseError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The request was cancelled before a reply could be produced.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::REQUEST_CANCELLED, "request cancelled")
    }

    /// The connection carrying the request went away.
    #[must_use]
    pub fn server_cancelled() -> Self {
        Self::new(
            ErrorCode::SERVER_CANCELLED,
            "request cancelled because the connection was closed",
        )
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
        )
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message)
    }
}
