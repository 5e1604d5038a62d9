//! Compile-time descriptions of protocol methods.
//!
//! A method type ties a wire name to the Rust types of its payloads. The
//! registry in `conduit-jsonrpc` uses these to validate incoming messages,
//! and the connection uses them for typed sends.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::RequestId;

pub trait RequestType: 'static {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
    type Result: Serialize + DeserializeOwned + Send + 'static;
}

pub trait NotificationType: 'static {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
}

/// `shutdown`: asks the peer to prepare for exit. No params, `null` result.
#[derive(Debug)]
pub enum ShutdownRequest {}

impl RequestType for ShutdownRequest {
    const METHOD: &'static str = "shutdown";
    type Params = ();
    type Result = ();
}

/// `exit`: the peer should terminate.
#[derive(Debug)]
pub enum ExitNotification {}

impl NotificationType for ExitNotification {
    const METHOD: &'static str = "exit";
    type Params = ();
}

/// `$/cancelRequest`: the sender no longer needs a reply for `id`.
#[derive(Debug)]
pub enum CancelRequestNotification {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}

impl NotificationType for CancelRequestNotification {
    const METHOD: &'static str = "$/cancelRequest";
    type Params = CancelParams;
}

/// `window/logMessage`: a line for the peer's log.
#[derive(Debug)]
pub enum LogMessageNotification {}

impl NotificationType for LogMessageNotification {
    const METHOD: &'static str = "window/logMessage";
    type Params = LogMessageParams;
}

/// `window/showMessage`: a message the peer should surface to its user.
#[derive(Debug)]
pub enum ShowMessageNotification {}

impl NotificationType for ShowMessageNotification {
    const METHOD: &'static str = "window/showMessage";
    type Params = ShowMessageParams;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessageParams {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message: String,
}

pub type ShowMessageParams = LogMessageParams;

/// Severity of a log or show-message notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Error = 1,
    Warning = 2,
    Info = 3,
    Log = 4,
}

#[derive(Debug, Error)]
#[error("unknown message type {0}")]
pub struct UnknownMessageType(u8);

impl TryFrom<u8> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(value: u8) -> Result<Self, UnknownMessageType> {
        match value {
            1 => Ok(Self::Error),
            2 => Ok(Self::Warning),
            3 => Ok(Self::Info),
            4 => Ok(Self::Log),
            other => Err(UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}
