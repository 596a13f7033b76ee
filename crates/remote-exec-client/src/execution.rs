//! Handle for one in-flight `send`.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use remote_exec_core::{
    EventKind, EventQueue, EventStream, Message, SessionResultPayload, StreamEvent,
    ToolConfirmationResponse,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ClientError, ClientOps, ExecutionError, ops::upgrade};

/// Default reason recorded by [`ExecutionHandle::abort`].
pub const DEFAULT_ABORT_REASON: &str = "Execution aborted";

/// Lifecycle of an execution. Everything but `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Aborted,
    Error,
}

impl ExecutionStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

type Settled = Option<Result<SessionResultPayload, ExecutionError>>;

struct ExecState {
    status: ExecutionStatus,
    session_id: Option<String>,
    execution_id: Option<String>,
    has_result: bool,
}

pub(crate) struct ExecutionInner {
    ops: Weak<dyn ClientOps>,
    state: Mutex<ExecState>,
    events: EventQueue<StreamEvent>,
    result: watch::Sender<Settled>,
    cancel: CancellationToken,
}

/// One execution started by `send`.
///
/// Exposes the execution's own events, a result that settles exactly once,
/// a status, and cancellation. Clones share the same execution.
#[derive(Clone)]
pub struct ExecutionHandle {
    inner: Arc<ExecutionInner>,
}

impl ExecutionHandle {
    pub(crate) fn new(ops: Weak<dyn ClientOps>, session_id: Option<String>) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            inner: Arc::new(ExecutionInner {
                ops,
                state: Mutex::new(ExecState {
                    status: ExecutionStatus::Running,
                    session_id,
                    execution_id: None,
                    has_result: false,
                }),
                events: EventQueue::new(),
                result,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ExecutionInner> {
        Arc::downgrade(&self.inner)
    }

    #[cfg(test)]
    pub(crate) const fn inner(&self) -> &Arc<ExecutionInner> {
        &self.inner
    }

    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        self.inner.lock().status
    }

    /// Session id, once known.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    /// Execution id, once the first event carrying one has arrived.
    #[must_use]
    pub fn execution_id(&self) -> Option<String> {
        self.inner.lock().execution_id.clone()
    }

    /// Every event of this execution, in arrival order.
    ///
    /// The sequence ends when the execution reaches a terminal status. It
    /// can be taken once; later calls return `None`.
    #[must_use]
    pub fn events(&self) -> Option<EventStream<StreamEvent>> {
        self.inner.events.take_stream()
    }

    /// Wait for the terminal result.
    ///
    /// # Errors
    /// Why the execution ended without a result.
    pub async fn result(&self) -> Result<SessionResultPayload, ExecutionError> {
        let mut rx = self.inner.result.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled
                .clone()
                .unwrap_or_else(|| Err(ExecutionError::Failed("result missing".into()))),
            Err(_) => Err(ExecutionError::Failed("execution dropped".into())),
        }
    }

    /// The settled result, without waiting.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<SessionResultPayload, ExecutionError>> {
        self.inner.result.borrow().clone()
    }

    /// Token cancelled when the execution is aborted.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Abort a running execution.
    ///
    /// Only effective while running; later calls do nothing. The server is
    /// told when the session id is known, and failures to tell it are
    /// logged and ignored.
    pub async fn abort(&self, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| DEFAULT_ABORT_REASON.to_string());
        if !self.inner.abort_local(&reason) {
            return;
        }
        let Some(session_id) = self.session_id() else {
            debug!("Aborted execution before its session id was known");
            return;
        };
        let Ok(ops) = upgrade(&self.inner.ops) else {
            return;
        };
        if let Err(e) = ops.abort_session(&session_id, Some(reason)).await {
            warn!(session_id = %session_id, error = %e, "Failed to notify server of abort");
        }
    }

    /// Queue a message behind this execution.
    ///
    /// # Errors
    /// [`ClientError::MissingSessionId`] before the session id is known, or
    /// the control-plane error.
    pub async fn queue_message(&self, message: Message) -> Result<(), ClientError> {
        let session_id = self.session_id().ok_or(ClientError::MissingSessionId)?;
        upgrade(&self.inner.ops)?
            .queue_message(&session_id, message)
            .await
    }

    /// Answer a tool confirmation raised by this execution.
    ///
    /// # Errors
    /// [`ClientError::MissingSessionId`] before the session id is known, or
    /// the control-plane error.
    pub async fn submit_tool_result(
        &self,
        tool_use_id: &str,
        response: ToolConfirmationResponse,
    ) -> Result<(), ClientError> {
        let session_id = self.session_id().ok_or(ClientError::MissingSessionId)?;
        let result = serde_json::to_value(response)?;
        upgrade(&self.inner.ops)?
            .submit_tool_result(&session_id, tool_use_id, result)
            .await
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ExecutionHandle")
            .field("status", &state.status)
            .field("session_id", &state.session_id)
            .field("execution_id", &state.execution_id)
            .finish_non_exhaustive()
    }
}

impl ExecutionInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, ExecState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: Result<SessionResultPayload, ExecutionError>) {
        self.result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock().status == ExecutionStatus::Running
    }

    /// Deliver an event from this execution's response stream.
    pub(crate) fn push_event(&self, event: StreamEvent) {
        let kind = event.kind.clone();
        let payload = event.result_payload();
        {
            let mut state = self.lock();
            if state.status != ExecutionStatus::Running {
                return;
            }
            if state.session_id.is_none() {
                state.session_id.clone_from(&event.session_id);
            }
            if state.execution_id.is_none() {
                state.execution_id.clone_from(&event.execution_id);
            }
            if payload.is_some() {
                state.has_result = true;
            }
        }
        self.events.push(event);

        if let Some(payload) = payload {
            self.settle(Ok(payload));
        } else if kind == EventKind::ExecutionEnd {
            self.finish();
        }
    }

    /// The execution ended normally.
    pub(crate) fn finish(&self) {
        let has_result = {
            let mut state = self.lock();
            if state.status != ExecutionStatus::Running {
                return;
            }
            state.status = ExecutionStatus::Completed;
            state.has_result
        };
        self.events.close();
        if !has_result {
            self.settle(Err(ExecutionError::CompletedWithoutResult));
        }
    }

    /// The response stream failed.
    ///
    /// A result already delivered stands.
    pub(crate) fn fail(&self, message: &str) {
        let has_result = {
            let mut state = self.lock();
            if state.status != ExecutionStatus::Running {
                return;
            }
            state.status = ExecutionStatus::Error;
            state.has_result
        };
        self.events.close();
        if !has_result {
            self.settle(Err(ExecutionError::Failed(message.to_string())));
        }
    }

    /// Abort without notifying the server. Returns whether this call did it.
    pub(crate) fn abort_local(&self, reason: &str) -> bool {
        {
            let mut state = self.lock();
            if state.status != ExecutionStatus::Running {
                return false;
            }
            state.status = ExecutionStatus::Aborted;
        }
        self.cancel.cancel();
        self.events.close();
        self.settle(Err(ExecutionError::Aborted(reason.to_string())));
        true
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::ops::testing::RecordingOps;

    fn event(kind: &str) -> StreamEvent {
        StreamEvent::new(kind).with_session("s1")
    }

    fn handle(ops: &Arc<RecordingOps>) -> ExecutionHandle {
        ExecutionHandle::new(ops.weak(), None)
    }

    #[tokio::test]
    async fn test_result_then_end_completes() {
        let ops = RecordingOps::new();
        let handle = handle(&ops);
        let events = handle.events().unwrap();

        let inner = handle.inner();
        let mut start = event("execution_start");
        start.execution_id = Some("e1".into());
        inner.push_event(start);
        inner.push_event(event("result").with_field("result", json!({"response": "hi"})));
        assert_eq!(handle.status(), ExecutionStatus::Running);
        inner.push_event(event("execution_end"));

        assert_eq!(handle.status(), ExecutionStatus::Completed);
        assert_eq!(handle.result().await.unwrap().response.as_deref(), Some("hi"));
        assert_eq!(handle.session_id().as_deref(), Some("s1"));
        assert_eq!(handle.execution_id().as_deref(), Some("e1"));
        let kinds: Vec<_> = events.map(|e| e.kind).collect().await;
        assert_eq!(
            kinds,
            vec![EventKind::ExecutionStart, EventKind::Result, EventKind::ExecutionEnd]
        );
    }

    #[tokio::test]
    async fn test_end_without_result_rejects() {
        let ops = RecordingOps::new();
        let handle = handle(&ops);
        handle.inner().push_event(event("execution_end"));
        assert_eq!(handle.status(), ExecutionStatus::Completed);
        assert_eq!(
            handle.result().await,
            Err(ExecutionError::CompletedWithoutResult)
        );
    }

    #[tokio::test]
    async fn test_failure_after_result_keeps_result() {
        let ops = RecordingOps::new();
        let handle = handle(&ops);
        handle.inner().push_event(event("result").with_field("response", json!("done")));
        handle.inner().fail("connection reset");
        assert_eq!(handle.status(), ExecutionStatus::Error);
        assert_eq!(handle.result().await.unwrap().response.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_non_object_result_matches_session_dispatch() {
        let ops = RecordingOps::new();
        let handle = handle(&ops);
        let result = event("result").with_field("result", json!([1, 2]));
        handle.inner().push_event(result.clone());
        handle.inner().push_event(event("execution_end"));

        let payload = handle.result().await.unwrap();
        assert_eq!(payload.extra["result"], json!([1, 2]));
        assert_eq!(result.result_payload(), Some(payload));
    }

    #[tokio::test]
    async fn test_failure_without_result_rejects() {
        let ops = RecordingOps::new();
        let handle = handle(&ops);
        handle.inner().fail("connection reset");
        assert!(matches!(handle.result().await, Err(ExecutionError::Failed(_))));
    }

    #[tokio::test]
    async fn test_abort_is_effective_once() {
        let ops = RecordingOps::new();
        let handle = handle(&ops);
        let token = handle.cancellation_token();
        handle.inner().push_event(event("execution_start"));

        handle.abort(Some("cancelled".into())).await;
        assert_eq!(handle.status(), ExecutionStatus::Aborted);
        assert!(token.is_cancelled());
        assert_eq!(
            handle.result().await,
            Err(ExecutionError::Aborted("cancelled".into()))
        );

        handle.abort(Some("again".into())).await;
        assert_eq!(ops.count("abort"), 1);
        assert_eq!(
            handle.try_result(),
            Some(Err(ExecutionError::Aborted("cancelled".into())))
        );

        // Terminal: later events are ignored.
        handle.inner().push_event(event("result"));
        let events: Vec<_> = handle.events().unwrap().collect().await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_failure_is_swallowed() {
        let ops = RecordingOps::new();
        ops.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
        let handle = ExecutionHandle::new(ops.weak(), Some("s1".into()));
        handle.abort(None).await;
        assert_eq!(
            handle.result().await,
            Err(ExecutionError::Aborted(DEFAULT_ABORT_REASON.into()))
        );
    }

    #[tokio::test]
    async fn test_queue_message_needs_session_id() {
        let ops = RecordingOps::new();
        let handle = handle(&ops);
        assert!(matches!(
            handle.queue_message(Message::user_text("next")).await,
            Err(ClientError::MissingSessionId)
        ));

        handle.inner().push_event(event("execution_start"));
        handle.queue_message(Message::user_text("next")).await.unwrap();
        assert_eq!(ops.calls()[0].1["sessionId"], "s1");
    }

    #[test]
    fn test_events_can_be_taken_once() {
        let ops = RecordingOps::new();
        let handle = handle(&ops);
        assert!(handle.events().is_some());
        assert!(handle.events().is_none());
    }
}
