//! Core protocol types for conduit.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer: the transport, the process glue,
//! and the binaries.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod error;
mod ids;
mod message;
mod method;

pub use error::{ErrorCode, ResponseError};
pub use ids::RequestId;
pub use message::{
    ErrorResponse, JSONRPC_VERSION, Message, MessageKind, Notification, Request, Response,
};
pub use method::{
    CancelParams, CancelRequestNotification, ExitNotification, LogMessageNotification,
    LogMessageParams, MessageType, NotificationType, RequestType, ShowMessageNotification,
    ShowMessageParams, ShutdownRequest, UnknownMessageType,
};

/// Environment variables stripped before spawning a subordinate server.
///
/// Patterns are matched case-insensitively: `*_SUFFIX`, `PREFIX_*`,
/// `*_INFIX*`, or an exact name.
pub const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_KEY",
    "*_SECRET*",
    "*_TOKEN*",
    "*_PASSWORD*",
    "*_CREDENTIAL*",
    "AWS_*",
    "ANTHROPIC_*",
    "OPENAI_*",
    "GITHUB_TOKEN",
    "NPM_TOKEN",
];
