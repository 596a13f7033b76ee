//! Session client for the remote execution service.
//!
//! Provides:
//! - `Client` - One multiplexed event stream with reconnection and de-duplication
//! - `SessionAccessor` - Per-session subscriptions, send, abort, close
//! - `ChannelAccessor` - Per-session side channels with correlated requests
//! - `ExecutionHandle` - One in-flight send: events, result, status, abort

pub mod channel;
pub mod client;
pub mod config;
pub mod confirmation;
mod connection;
pub mod error;
pub mod execution;
pub mod invoke;
pub mod ops;
pub mod session;

pub use channel::{ChannelAccessor, DEFAULT_REQUEST_TIMEOUT};
pub use client::Client;
pub use config::ClientConfig;
pub use confirmation::ConfirmationResponder;
pub use error::{ClientError, ExecutionError};
pub use execution::{DEFAULT_ABORT_REASON, ExecutionHandle, ExecutionStatus};
pub use invoke::InvokeStream;
pub use ops::ClientOps;
pub use session::SessionAccessor;

pub use remote_exec_core::{
    ChannelEvent, ConnectionState, ContentBlock, EventKind, Message, SendInput,
    SessionResultPayload, StreamEvent, Subscription, ToolConfirmationRequest,
    ToolConfirmationResponse,
};
pub use remote_exec_transport::{CredentialsMode, Endpoint, Transport, TransportConfig};
