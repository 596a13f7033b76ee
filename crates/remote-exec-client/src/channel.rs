//! Named side channels within a session.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use remote_exec_core::{ChannelEvent, HandlerSet, Subscription};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::{ClientError, ClientOps, ops::upgrade};

/// Timeout applied by [`ChannelAccessor::request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Reply = Result<Value, ClientError>;

struct ChannelInner {
    session_id: String,
    name: String,
    ops: Weak<dyn ClientOps>,
    handlers: HandlerSet<ChannelEvent>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    destroyed: AtomicBool,
}

/// Pub/sub endpoint for one `(session, channel)` pair.
///
/// Besides plain events, supports correlated requests: the reply is the
/// first `response` or `error` event carrying the request's id. Replies
/// are never handed to subscribers.
#[derive(Clone)]
pub struct ChannelAccessor {
    inner: Arc<ChannelInner>,
}

impl ChannelAccessor {
    pub(crate) fn new(
        ops: Weak<dyn ClientOps>,
        session_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(ChannelInner {
                session_id: session_id.into(),
                handlers: HandlerSet::new("channel"),
                name,
                ops,
                pending: Mutex::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Listen for events on this channel.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.handlers.add(handler)
    }

    /// Publish an uncorrelated event.
    ///
    /// # Errors
    /// The control-plane error.
    pub async fn publish(&self, kind: &str, payload: Value) -> Result<(), ClientError> {
        let event = ChannelEvent::new(self.name(), kind, payload);
        upgrade(&self.inner.ops)?
            .publish_channel(self.session_id(), event)
            .await
    }

    /// [`ChannelAccessor::request_with_timeout`] with [`DEFAULT_REQUEST_TIMEOUT`].
    ///
    /// # Errors
    /// See [`ChannelAccessor::request_with_timeout`].
    pub async fn request(&self, kind: &str, payload: Value) -> Result<Value, ClientError> {
        self.request_with_timeout(kind, payload, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Publish a request and wait for its correlated reply.
    ///
    /// The pending entry is removed whatever the outcome; a reply arriving
    /// after the timeout is dropped.
    ///
    /// # Errors
    /// [`ClientError::RequestTimeout`], [`ClientError::ChannelRequest`] for
    /// an `error` reply, [`ClientError::ChannelDestroyed`], or the publish
    /// error.
    pub async fn request_with_timeout(
        &self,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(ClientError::ChannelDestroyed);
        }
        let ops = upgrade(&self.inner.ops)?;

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(id.clone(), tx);

        let mut event = ChannelEvent::new(self.name(), kind, payload);
        event.id = Some(id.clone());

        let outcome = tokio::time::timeout(timeout, async {
            ops.publish_channel(self.session_id(), event).await?;
            rx.await.unwrap_or(Err(ClientError::ChannelDestroyed))
        })
        .await;
        self.inner.pending().remove(&id);

        outcome.unwrap_or_else(|_| {
            debug!(
                channel = %self.name(),
                request_id = %id,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Channel request timed out"
            );
            Err(ClientError::RequestTimeout {
                channel: self.name().to_string(),
                request_type: kind.to_string(),
                timeout,
            })
        })
    }

    /// Route an inbound event: settle a pending request or notify subscribers.
    pub(crate) fn handle_event(&self, event: &ChannelEvent) {
        if event.is_reply() {
            let id = event.id.as_deref().unwrap_or_default();
            let Some(tx) = self.inner.pending().remove(id) else {
                debug!(channel = %self.name(), request_id = %id, "Dropping unmatched channel reply");
                return;
            };
            let reply = if event.kind == "error" {
                Err(ClientError::ChannelRequest {
                    message: error_message(&event.payload),
                    payload: event.payload.clone(),
                })
            } else {
                Ok(event.payload.clone())
            };
            let _ = tx.send(reply);
            return;
        }
        self.inner.handlers.emit(event);
    }

    /// Reject every pending request and drop all subscribers.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self.inner.pending().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(ClientError::ChannelDestroyed));
        }
        self.inner.handlers.clear();
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }
}

impl PartialEq for ChannelAccessor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ChannelAccessor {}

impl std::fmt::Debug for ChannelAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAccessor")
            .field("session_id", &self.inner.session_id)
            .field("name", &self.inner.name)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn error_message(payload: &Value) -> String {
    payload
        .as_str()
        .or_else(|| payload.get("message").and_then(Value::as_str))
        .or_else(|| payload.get("error").and_then(Value::as_str))
        .unwrap_or("channel request failed")
        .to_string()
}
