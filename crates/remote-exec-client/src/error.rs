//! Client errors.

use std::time::Duration;

use remote_exec_transport::TransportError;
use serde_json::Value;
use thiserror::Error;

/// Why an execution's result future rejected.
///
/// Cloneable because several callers may await the same result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Aborted by the caller; carries the abort reason.
    #[error("{0}")]
    Aborted(String),
    /// The response stream failed before a result arrived.
    #[error("Execution failed: {0}")]
    Failed(String),
    /// The execution ended without ever producing a result event.
    #[error("execution completed without result")]
    CompletedWithoutResult,
}

/// Client error.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The event stream could not be opened or closed before its handshake.
    #[error("Connection failed: {0}")]
    Connection(String),
    /// Automatic reconnection gave up; call `Client::reconnect`.
    #[error("Reconnection gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    /// Non-2xx control-plane response.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Transport error: {0}")]
    Transport(TransportError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Channel request '{request_type}' on '{channel}' timed out after {timeout:?}")]
    RequestTimeout {
        channel: String,
        request_type: String,
        timeout: Duration,
    },
    #[error("channel destroyed")]
    ChannelDestroyed,
    /// The peer answered a channel request with an `error` event.
    #[error("Channel request failed: {message}")]
    ChannelRequest { message: String, payload: Value },
    /// A streamed `invoke` reported `method:error`.
    #[error("Method '{method}' failed: {message}")]
    Invoke { method: String, message: String },
    #[error("Session id is not known yet")]
    MissingSessionId,
    #[error("Tool confirmation was already answered")]
    ConfirmationAlreadyResolved,
    #[error("Client is closed")]
    ClientClosed,
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Http { status, body } => Self::Http { status, body },
            other => Self::Transport(other),
        }
    }
}
