//! JSON-RPC transport and connection layer for language servers.
//!
//! Bytes are split into `Content-Length` frames ([`frame`]), frame bodies are
//! decoded into typed messages against a [`MessageRegistry`] ([`codec`]), and a
//! [`Connection`] ties both to a duplex [`Transport`]: it sends requests and
//! notifications, routes replies to their callbacks, hands inbound traffic to a
//! [`MessageHandler`], and recovers from messages it cannot decode.

pub mod codec;
pub mod config;
pub mod frame;
pub mod registry;

mod connection;
mod process;
mod transport;

pub use codec::{DecodeError, DecodeFailure};
pub use config::{ConnectionConfig, ServerConfig};
pub use connection::{
    Connection, ConnectionBuilder, ConnectionError, ConnectionState, MessageHandler, ReplyCallback,
    ReplySink, RequestError,
};
pub use frame::FrameError;
pub use process::SubordinateServer;
pub use registry::{MessageRegistry, Shape};
pub use transport::Transport;
