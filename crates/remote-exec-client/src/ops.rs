//! Outbound operations accessors issue through the client.
//!
//! Accessors never hold the connection. They keep a `Weak<dyn ClientOps>`
//! back to the client, which keeps them testable without a live server and
//! avoids a reference cycle with the client's session registry.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use remote_exec_core::{ChannelEvent, Message, SendInput};
use serde_json::Value;

use crate::{ClientError, ExecutionHandle, InvokeStream};

/// Client-side operations available to accessors and handles.
#[async_trait]
pub trait ClientOps: Send + Sync {
    /// Register a session with the live connection.
    async fn subscribe_session(&self, session_id: &str) -> Result<(), ClientError>;

    /// Remove a session from the live connection.
    async fn unsubscribe_session(&self, session_id: &str) -> Result<(), ClientError>;

    /// Stop resubscribing a session after reconnects, without a request.
    fn forget_session(&self, session_id: &str);

    /// Start an execution.
    async fn send(
        &self,
        input: SendInput,
        session_id: Option<String>,
    ) -> Result<ExecutionHandle, ClientError>;

    async fn abort_session(&self, session_id: &str, reason: Option<String>)
    -> Result<(), ClientError>;

    async fn close_session(&self, session_id: &str) -> Result<(), ClientError>;

    async fn submit_tool_result(
        &self,
        session_id: &str,
        tool_use_id: &str,
        result: Value,
    ) -> Result<(), ClientError>;

    /// Queue a message behind the running execution.
    async fn queue_message(&self, session_id: &str, message: Message) -> Result<(), ClientError>;

    async fn publish_channel(&self, session_id: &str, event: ChannelEvent)
    -> Result<(), ClientError>;

    /// Register server-side delivery of a channel to this client.
    async fn subscribe_channel(&self, session_id: &str, channel: &str) -> Result<(), ClientError>;

    async fn invoke(&self, method: &str, params: Value) -> Result<Value, ClientError>;

    async fn stream(&self, method: &str, params: Value) -> Result<InvokeStream, ClientError>;
}

/// Upgrade the back-reference, failing once the client is gone.
pub(crate) fn upgrade(ops: &Weak<dyn ClientOps>) -> Result<Arc<dyn ClientOps>, ClientError> {
    ops.upgrade().ok_or(ClientError::ClientClosed)
}
