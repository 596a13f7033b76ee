//! Session accessors.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use remote_exec_core::{
    ChannelEvent, HandlerSet, SendInput, SessionResultPayload, StreamEvent, Subscription,
    ToolConfirmationResponse,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    ChannelAccessor, ClientError, ClientOps, ConfirmationResponder, ExecutionHandle,
    InvokeStream, ops::upgrade,
};

struct SessionInner {
    id: String,
    ops: Weak<dyn ClientOps>,
    subscribed: AtomicBool,
    channels: Mutex<HashMap<String, ChannelAccessor>>,
    events: HandlerSet<StreamEvent>,
    results: HandlerSet<SessionResultPayload>,
    confirmations: HandlerSet<ConfirmationResponder>,
}

/// One conversational session.
///
/// Obtained from `Client::session`; the same id always yields the same
/// accessor. A session is *cold* until [`SessionAccessor::subscribe`]
/// registers it with the live connection, after which it is *hot*.
#[derive(Clone)]
pub struct SessionAccessor {
    inner: Arc<SessionInner>,
}

impl SessionAccessor {
    pub(crate) fn new(ops: Weak<dyn ClientOps>, id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                ops,
                subscribed: AtomicBool::new(false),
                channels: Mutex::new(HashMap::new()),
                events: HandlerSet::new("session event"),
                results: HandlerSet::new("session result"),
                confirmations: HandlerSet::new("tool confirmation"),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether the session is registered with the live connection.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::SeqCst)
    }

    /// Start receiving this session's events. No-op when already hot.
    ///
    /// # Errors
    /// The control-plane error; the session stays cold.
    pub async fn subscribe(&self) -> Result<(), ClientError> {
        if self.inner.subscribed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let outcome = async { upgrade(&self.inner.ops)?.subscribe_session(self.id()).await }.await;
        if outcome.is_err() {
            self.inner.subscribed.store(false, Ordering::SeqCst);
        }
        outcome
    }

    /// Stop receiving this session's events. No-op when already cold.
    ///
    /// # Errors
    /// The control-plane error; the session stays hot.
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        if !self.inner.subscribed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let outcome =
            async { upgrade(&self.inner.ops)?.unsubscribe_session(self.id()).await }.await;
        if outcome.is_err() {
            self.inner.subscribed.store(true, Ordering::SeqCst);
        }
        outcome
    }

    /// Start an execution in this session.
    ///
    /// # Errors
    /// The `/send` request error.
    pub async fn send(&self, input: impl Into<SendInput>) -> Result<ExecutionHandle, ClientError> {
        upgrade(&self.inner.ops)?
            .send(input.into(), Some(self.id().to_string()))
            .await
    }

    /// Abort whatever the session is executing.
    ///
    /// # Errors
    /// The control-plane error.
    pub async fn abort(&self, reason: Option<String>) -> Result<(), ClientError> {
        upgrade(&self.inner.ops)?
            .abort_session(self.id(), reason)
            .await
    }

    /// Tear down local state, then close the session on the server.
    ///
    /// Channels are destroyed (rejecting pending requests), handlers
    /// dropped, and the session is no longer resubscribed after
    /// reconnects. This happens before `/close` is sent, whatever its
    /// outcome. The accessor itself stays cached and can be subscribed
    /// again.
    ///
    /// # Errors
    /// The control-plane error.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.teardown();
        let ops = upgrade(&self.inner.ops)?;
        ops.forget_session(self.id());
        ops.close_session(self.id()).await
    }

    /// Answer a tool confirmation by id.
    ///
    /// # Errors
    /// The control-plane error.
    pub async fn submit_tool_result(
        &self,
        tool_use_id: &str,
        response: ToolConfirmationResponse,
    ) -> Result<(), ClientError> {
        let result = serde_json::to_value(response)?;
        upgrade(&self.inner.ops)?
            .submit_tool_result(self.id(), tool_use_id, result)
            .await
    }

    /// Every event routed to this session.
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.inner.events.add(handler)
    }

    /// Result payloads of this session's executions.
    pub fn on_result<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionResultPayload) + Send + Sync + 'static,
    {
        self.inner.results.add(handler)
    }

    /// Tool confirmation requests; answer through the responder.
    pub fn on_tool_confirmation<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConfirmationResponder) + Send + Sync + 'static,
    {
        self.inner.confirmations.add(handler)
    }

    /// The accessor for channel `name`, created on first use.
    ///
    /// First use also asks the server to deliver the channel to this
    /// client. That request runs in the background; failures are logged.
    #[must_use]
    pub fn channel(&self, name: &str) -> ChannelAccessor {
        let created = {
            let mut channels = self.inner.channels();
            if let Some(existing) = channels.get(name) {
                return existing.clone();
            }
            let channel = ChannelAccessor::new(self.inner.ops.clone(), self.id(), name);
            channels.insert(name.to_string(), channel.clone());
            channel
        };
        self.register_channel(name);
        created
    }

    fn register_channel(&self, name: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %self.id(), channel = name, "No runtime; channel not registered with server");
            return;
        };
        let ops = self.inner.ops.clone();
        let session_id = self.id().to_string();
        let name = name.to_string();
        runtime.spawn(async move {
            let Ok(ops) = upgrade(&ops) else {
                return;
            };
            if let Err(e) = ops.subscribe_channel(&session_id, &name).await {
                warn!(session_id = %session_id, channel = %name, error = %e, "Channel subscription failed");
            }
        });
    }

    /// Call a server method with this session's id in the params.
    ///
    /// # Errors
    /// The `/invoke` request error.
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        upgrade(&self.inner.ops)?
            .invoke(method, with_session_id(params, self.id()))
            .await
    }

    /// Streaming [`SessionAccessor::invoke`].
    ///
    /// # Errors
    /// The `/invoke` request error.
    pub async fn stream(&self, method: &str, params: Value) -> Result<InvokeStream, ClientError> {
        upgrade(&self.inner.ops)?
            .stream(method, with_session_id(params, self.id()))
            .await
    }

    pub(crate) fn set_subscribed(&self, hot: bool) {
        self.inner.subscribed.store(hot, Ordering::SeqCst);
    }

    /// Dispatch a routed event to this session's handler sets.
    pub(crate) fn handle_event(&self, event: &StreamEvent) {
        self.inner.events.emit(event);
        if let Some(payload) = event.result_payload() {
            self.inner.results.emit(&payload);
        }
        if let Some(request) = event.tool_confirmation() {
            let responder = ConfirmationResponder::new(self.inner.ops.clone(), self.id(), request);
            if self.inner.confirmations.emit(&responder) == 0 {
                debug!(session_id = %self.id(), tool_use_id = %responder.request().tool_use_id, "Tool confirmation with no handler");
            }
        }
    }

    /// Forward a channel envelope to its accessor, if one exists.
    pub(crate) fn handle_channel(&self, event: &ChannelEvent) {
        let channel = self.inner.channels().get(&event.channel).cloned();
        match channel {
            Some(channel) => channel.handle_event(event),
            None => debug!(session_id = %self.id(), channel = %event.channel, "Event for unopened channel"),
        }
    }

    /// Destroy channels, drop handlers, and go cold.
    pub(crate) fn teardown(&self) {
        let channels: Vec<_> = self.inner.channels().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.destroy();
        }
        self.inner.events.clear();
        self.inner.results.clear();
        self.inner.confirmations.clear();
        self.set_subscribed(false);
    }
}

impl PartialEq for SessionAccessor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SessionAccessor {}

impl std::fmt::Debug for SessionAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAccessor")
            .field("id", &self.inner.id)
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChannelAccessor>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn with_session_id(params: Value, session_id: &str) -> Value {
    match params {
        Value::Object(mut obj) => {
            obj.insert("sessionId".into(), Value::String(session_id.into()));
            Value::Object(obj)
        }
        Value::Null => {
            let mut obj = Map::new();
            obj.insert("sessionId".into(), Value::String(session_id.into()));
            Value::Object(obj)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::ops::testing::RecordingOps;

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let ops = RecordingOps::new();
        let session = SessionAccessor::new(ops.weak(), "s1");

        session.unsubscribe().await.unwrap();
        assert_eq!(ops.count("unsubscribe"), 0);

        session.subscribe().await.unwrap();
        session.subscribe().await.unwrap();
        assert!(session.is_subscribed());
        assert_eq!(ops.count("subscribe"), 1);

        session.unsubscribe().await.unwrap();
        session.unsubscribe().await.unwrap();
        assert!(!session.is_subscribed());
        assert_eq!(ops.count("unsubscribe"), 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_stays_cold() {
        let ops = RecordingOps::new();
        ops.fail_next.store(true, Ordering::SeqCst);
        let session = SessionAccessor::new(ops.weak(), "s1");
        assert!(session.subscribe().await.is_err());
        assert!(!session.is_subscribed());
    }

    #[tokio::test]
    async fn test_channel_is_cached_and_registered_once() {
        let ops = RecordingOps::new();
        let session = SessionAccessor::new(ops.weak(), "s1");
        let a = session.channel("progress");
        let b = session.channel("progress");
        assert_eq!(a, b);
        assert_ne!(a, session.channel("other"));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ops.count("channel_subscribe"), 2);
    }

    #[tokio::test]
    async fn test_results_and_confirmations_are_dispatched() {
        let ops = RecordingOps::new();
        let session = SessionAccessor::new(ops.weak(), "s1");
        let events = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(Vec::new()));
        let responders = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&events);
        let _a = session.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let sink = Arc::clone(&results);
        let _b = session.on_result(move |p| sink.lock().unwrap().push(p.response.clone()));
        let sink = Arc::clone(&responders);
        let _c = session.on_tool_confirmation(move |r| sink.lock().unwrap().push(r.clone()));

        session.handle_event(&StreamEvent::new("content_delta").with_field("delta", json!("x")));
        session.handle_event(&StreamEvent::new("result").with_field("response", json!("done")));
        session.handle_event(
            &StreamEvent::new("tool_confirmation_required")
                .with_field("toolUseId", json!("tu-9"))
                .with_field("name", json!("shell")),
        );

        assert_eq!(events.load(Ordering::SeqCst), 3);
        session.handle_event(&StreamEvent::new("result").with_field("result", json!(42)));
        assert_eq!(
            *results.lock().unwrap(),
            vec![Some("done".to_string()), None]
        );

        let responder = responders.lock().unwrap().pop().unwrap();
        responder.approve().await.unwrap();
        let calls = ops.calls();
        assert_eq!(calls[0].0, "tool_result");
        assert_eq!(calls[0].1["sessionId"], "s1");
        assert_eq!(calls[0].1["toolUseId"], "tu-9");
    }

    #[tokio::test]
    async fn test_close_tears_down() {
        let ops = RecordingOps::new();
        let session = SessionAccessor::new(ops.weak(), "s1");
        session.subscribe().await.unwrap();
        let channel = session.channel("rpc");
        let _sub = session.on_event(|_| {});

        session.close().await.unwrap();
        assert!(!session.is_subscribed());
        assert!(channel.is_destroyed());
        assert_eq!(ops.count("close"), 1);
        assert_eq!(ops.count("forget"), 1);
        assert_ne!(session.channel("rpc"), channel);
        let ops_seen: Vec<String> = ops.calls().into_iter().map(|(op, _)| op).collect();
        let forget = ops_seen.iter().position(|op| op == "forget").unwrap();
        let close = ops_seen.iter().position(|op| op == "close").unwrap();
        assert!(forget < close);
    }

    #[tokio::test]
    async fn test_failed_close_still_releases_local_state() {
        let ops = RecordingOps::new();
        let session = SessionAccessor::new(ops.weak(), "s1");
        let channel = session.channel("rpc");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = session.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request("ping", json!({})).await }
        });
        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        ops.fail_next.store(true, Ordering::SeqCst);
        assert!(session.close().await.is_err());

        assert!(channel.is_destroyed());
        assert!(matches!(
            pending.await.unwrap(),
            Err(ClientError::ChannelDestroyed)
        ));
        session.handle_event(&StreamEvent::new("tick_start"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(ops.count("forget"), 1);
    }

    #[tokio::test]
    async fn test_invoke_injects_session_id() {
        let ops = RecordingOps::new();
        let session = SessionAccessor::new(ops.weak(), "s1");
        session.invoke("status", json!({"verbose": true})).await.unwrap();
        session.invoke("ping", Value::Null).await.unwrap();

        let calls = ops.calls();
        assert_eq!(calls[0].1["params"], json!({"verbose": true, "sessionId": "s1"}));
        assert_eq!(calls[1].1["params"], json!({"sessionId": "s1"}));
    }
}
