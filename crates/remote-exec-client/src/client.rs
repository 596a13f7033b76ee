//! The client: one multiplexed event stream shared by every session.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use futures::StreamExt;
use remote_exec_core::{
    ChannelEvent, ConnectionState, EventKind, HandlerSet, Message, RecentIds, SendInput,
    StreamEvent, StreamingText, Subscription,
};
use remote_exec_transport::{
    Endpoint, FrameStream, HttpTransport, Transport, TransportConfig, parse_frame,
    protocol::{
        AbortRequest, ChannelPublishRequest, ChannelSubscribeRequest, CloseRequest,
        InvokeRequest, QueueRequest, SendRequest, SubscribeRequest, ToolResponseRequest,
    },
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    ClientConfig, ClientError, ClientOps, ExecutionHandle, InvokeStream, SessionAccessor,
    connection::ConnectionSlot,
    execution::{DEFAULT_ABORT_REASON, ExecutionInner},
};

pub(crate) struct ClientInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: ClientConfig,
    pub(crate) self_ref: Weak<ClientInner>,
    pub(crate) state: watch::Sender<ConnectionState>,
    conn: Mutex<ConnectionSlot>,
    sessions: Mutex<HashMap<String, SessionAccessor>>,
    subscribed: Mutex<HashSet<String>>,
    recent: Mutex<RecentIds>,
    global: HandlerSet<StreamEvent>,
    streaming: Mutex<StreamingText>,
    executions: Mutex<Vec<Weak<ExecutionInner>>>,
}

/// Client for a remote execution service.
///
/// Owns the single event stream, the session registry, and the duplicate
/// filter. Session and channel accessors hold only a weak reference back,
/// so dropping the client (or calling [`Client::destroy`]) releases
/// everything.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client talking HTTP to `transport.base_url`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built (invalid header).
    pub fn new(transport: TransportConfig, config: ClientConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(transport)?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    /// Create a client over any [`Transport`].
    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let recent = RecentIds::new(config.dedup_capacity);
        let inner = Arc::new_cyclic(|self_ref| ClientInner {
            transport,
            config,
            self_ref: self_ref.clone(),
            state,
            conn: Mutex::new(ConnectionSlot::default()),
            sessions: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(HashSet::new()),
            recent: Mutex::new(recent),
            global: HandlerSet::new("global event"),
            streaming: Mutex::new(StreamingText::new()),
            executions: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The accessor for session `id`; the same id always returns the same accessor.
    #[must_use]
    pub fn session(&self, id: &str) -> SessionAccessor {
        self.inner
            .sessions()
            .entry(id.to_string())
            .or_insert_with(|| SessionAccessor::new(self.inner.ops_ref(), id))
            .clone()
    }

    /// Start an execution, in `session_id` or a new session.
    ///
    /// # Errors
    /// The `/send` request error, including non-2xx responses.
    pub async fn send(
        &self,
        input: impl Into<SendInput>,
        session_id: Option<&str>,
    ) -> Result<ExecutionHandle, ClientError> {
        self.inner
            .send(input.into(), session_id.map(str::to_string))
            .await
    }

    /// Call a server method.
    ///
    /// # Errors
    /// The `/invoke` request error.
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.inner.invoke(method, params).await
    }

    /// Call a server method that streams its result.
    ///
    /// # Errors
    /// The `/invoke` request error.
    pub async fn stream(&self, method: &str, params: Value) -> Result<InvokeStream, ClientError> {
        self.inner.stream(method, params).await
    }

    /// Every routed event, for all sessions.
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.inner.global.add(handler)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        self.inner.connected_id()
    }

    /// Text streamed by the most recent content block.
    #[must_use]
    pub fn streaming_text(&self) -> String {
        self.inner.streaming().text().to_string()
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.inner.streaming().is_streaming()
    }

    /// Open the event stream unless it is already open.
    ///
    /// Concurrent callers share one attempt. Returns the connection id.
    ///
    /// # Errors
    /// [`ClientError::Connection`] if the stream cannot be opened or closes
    /// before its handshake, [`ClientError::ReconnectExhausted`] when joining
    /// a reconnect that gave up.
    pub async fn ensure_connection(&self) -> Result<String, ClientError> {
        self.inner.ensure_connection().await
    }

    /// Reconnect now, resetting the backoff counter.
    ///
    /// # Errors
    /// See [`Client::ensure_connection`].
    pub async fn reconnect(&self) -> Result<String, ClientError> {
        self.inner.reconnect().await
    }

    /// Close the stream and release every session, channel, and handler.
    ///
    /// Pending channel requests are rejected and running executions fail.
    /// Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.conn
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_tasks();
    }
}

impl ClientInner {
    pub(crate) fn slot(&self) -> MutexGuard<'_, ConnectionSlot> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionAccessor>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribed(&self) -> MutexGuard<'_, HashSet<String>> {
        self.subscribed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn streaming(&self) -> MutexGuard<'_, StreamingText> {
        self.streaming.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ops_ref(&self) -> Weak<dyn ClientOps> {
        self.self_ref.clone()
    }

    fn is_destroyed(&self) -> bool {
        self.slot().destroyed
    }

    /// POST a control-plane request.
    pub(crate) async fn post<B: Serialize + ?Sized>(
        &self,
        endpoint: Endpoint,
        body: &B,
    ) -> Result<Value, ClientError> {
        if self.is_destroyed() {
            return Err(ClientError::ClientClosed);
        }
        let body = serde_json::to_value(body)?;
        Ok(self.transport.post_json(endpoint, body).await?)
    }

    /// Route one inbound event through dedup to channels, global handlers, and sessions.
    pub(crate) fn route_event(&self, event: StreamEvent) {
        if let Some(id) = event.id.as_deref() {
            let fresh = self
                .recent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id);
            if !fresh {
                debug!(event_id = %id, kind = %event.kind, "Dropping duplicate event");
                return;
            }
        }

        match event.kind {
            EventKind::Connection => {}
            EventKind::Channel => self.route_channel(&event),
            _ => {
                self.streaming().apply(&event);
                self.global.emit(&event);
                let session = event
                    .session_id
                    .as_deref()
                    .and_then(|id| self.sessions().get(id).cloned());
                if let Some(session) = session {
                    session.handle_event(&event);
                }
            }
        }
    }

    fn route_channel(&self, event: &StreamEvent) {
        let Some(channel_event) = event.channel_event() else {
            warn!("Skipping malformed channel envelope");
            return;
        };
        let session = event
            .session_id
            .as_deref()
            .and_then(|id| self.sessions().get(id).cloned());
        match session {
            Some(session) => session.handle_channel(&channel_event),
            None => debug!(
                session_id = ?event.session_id,
                channel = %channel_event.channel,
                "Channel event for unknown session"
            ),
        }
    }

    fn track(&self, handle: &ExecutionHandle) {
        let mut executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        executions.retain(|weak| weak.upgrade().is_some_and(|exec| exec.is_running()));
        executions.push(handle.downgrade());
    }

    fn live_executions(&self) -> Vec<Arc<ExecutionInner>> {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|exec| exec.is_running())
            .collect()
    }

    pub(crate) fn destroy(&self) {
        {
            let mut slot = self.slot();
            if slot.destroyed {
                return;
            }
            slot.destroyed = true;
            slot.generation += 1;
            slot.connection_id = None;
            slot.abort_tasks();
        }
        self.set_state(ConnectionState::Disconnected);

        let sessions: Vec<_> = self.sessions().values().cloned().collect();
        for session in sessions {
            session.teardown();
        }
        self.subscribed().clear();
        self.global.clear();
        for exec in self.live_executions() {
            exec.fail("client destroyed");
        }
        info!("Client destroyed");
    }
}

/// Feed a `/send` response body into its handle and the global routing path.
async fn pump_execution(
    client: Weak<ClientInner>,
    handle: ExecutionHandle,
    mut frames: FrameStream,
) {
    let exec = handle.downgrade();
    let cancel = handle.cancellation_token();
    drop(handle);

    let failure = loop {
        let line = tokio::select! {
            () = cancel.cancelled() => return,
            line = frames.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        };
        let mut event = match parse_frame(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Skipping malformed execution frame");
                continue;
            }
        };

        let exec = exec.upgrade();
        if let Some(exec) = &exec {
            if !exec.is_running() {
                return;
            }
            if event.session_id.is_none() {
                event.session_id = exec.session_id();
            }
        }
        match client.upgrade() {
            Some(client) if !client.is_destroyed() => client.route_event(event.clone()),
            _ => return,
        }
        if let Some(exec) = exec {
            exec.push_event(event);
        }
    };

    let Some(exec) = exec.upgrade() else {
        return;
    };
    match failure {
        Some(message) => {
            warn!(error = %message, "Execution stream failed");
            exec.fail(&message);
        }
        None => exec.finish(),
    }
}

#[async_trait]
impl ClientOps for ClientInner {
    async fn subscribe_session(&self, session_id: &str) -> Result<(), ClientError> {
        let connection_id = self.ensure_connection().await?;
        self.slot().pending_removals.remove(session_id);
        let body = SubscribeRequest {
            connection_id,
            add: vec![session_id.to_string()],
            remove: Vec::new(),
        };
        self.post(Endpoint::Subscribe, &body).await?;
        self.subscribed().insert(session_id.to_string());
        debug!(session_id, "Session subscribed");
        Ok(())
    }

    async fn unsubscribe_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.subscribed().remove(session_id);
        let Some(connection_id) = self.removal_target(session_id) else {
            debug!(session_id, "Session unsubscribed while disconnected");
            return Ok(());
        };
        let body = SubscribeRequest {
            connection_id,
            add: Vec::new(),
            remove: vec![session_id.to_string()],
        };
        self.post(Endpoint::Subscribe, &body).await?;
        debug!(session_id, "Session unsubscribed");
        Ok(())
    }

    fn forget_session(&self, session_id: &str) {
        // Closed sessions are gone server-side; only keep a resumed
        // handshake from reviving this one.
        if self.subscribed().remove(session_id) {
            let _ = self.removal_target(session_id);
        }
    }

    async fn send(
        &self,
        input: SendInput,
        session_id: Option<String>,
    ) -> Result<ExecutionHandle, ClientError> {
        if self.is_destroyed() {
            return Err(ClientError::ClientClosed);
        }
        let body = serde_json::to_value(SendRequest {
            input: input.normalize(),
            session_id: session_id.clone(),
        })?;
        let frames = self.transport.post_stream(Endpoint::Send, body).await?;

        let handle = ExecutionHandle::new(self.ops_ref(), session_id);
        self.track(&handle);
        tokio::spawn(pump_execution(
            self.self_ref.clone(),
            handle.clone(),
            frames,
        ));
        Ok(handle)
    }

    async fn abort_session(
        &self,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<(), ClientError> {
        let local_reason = reason.as_deref().unwrap_or(DEFAULT_ABORT_REASON);
        for exec in self.live_executions() {
            if exec.session_id().as_deref() == Some(session_id) {
                exec.abort_local(local_reason);
            }
        }
        let body = AbortRequest {
            session_id: session_id.to_string(),
            reason,
        };
        self.post(Endpoint::Abort, &body).await?;
        Ok(())
    }

    async fn close_session(&self, session_id: &str) -> Result<(), ClientError> {
        let body = CloseRequest {
            session_id: session_id.to_string(),
        };
        self.post(Endpoint::Close, &body).await?;
        Ok(())
    }

    async fn submit_tool_result(
        &self,
        session_id: &str,
        tool_use_id: &str,
        result: Value,
    ) -> Result<(), ClientError> {
        let body = ToolResponseRequest {
            session_id: session_id.to_string(),
            tool_use_id: tool_use_id.to_string(),
            result,
        };
        self.post(Endpoint::ToolResponse, &body).await?;
        Ok(())
    }

    async fn queue_message(&self, session_id: &str, message: Message) -> Result<(), ClientError> {
        let body = QueueRequest {
            session_id: session_id.to_string(),
            message,
        };
        self.post(Endpoint::Queue, &body).await?;
        Ok(())
    }

    async fn publish_channel(
        &self,
        session_id: &str,
        event: ChannelEvent,
    ) -> Result<(), ClientError> {
        let body = ChannelPublishRequest {
            session_id: session_id.to_string(),
            event,
        };
        self.post(Endpoint::Channel, &body).await?;
        Ok(())
    }

    async fn subscribe_channel(&self, session_id: &str, channel: &str) -> Result<(), ClientError> {
        let body = ChannelSubscribeRequest {
            session_id: session_id.to_string(),
            channel: channel.to_string(),
            client_id: self.config.client_id.clone(),
        };
        self.post(Endpoint::ChannelSubscribe, &body).await?;
        Ok(())
    }

    async fn invoke(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let body = InvokeRequest {
            method: method.to_string(),
            params,
            stream: false,
        };
        self.post(Endpoint::Invoke, &body).await
    }

    async fn stream(&self, method: &str, params: Value) -> Result<InvokeStream, ClientError> {
        if self.is_destroyed() {
            return Err(ClientError::ClientClosed);
        }
        let body = serde_json::to_value(InvokeRequest {
            method: method.to_string(),
            params,
            stream: true,
        })?;
        let frames = self.transport.post_stream(Endpoint::Invoke, body).await?;
        Ok(InvokeStream::spawn(method.to_string(), frames))
    }
}
