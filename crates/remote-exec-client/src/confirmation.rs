//! Single-use responder for tool confirmation requests.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use remote_exec_core::{ToolConfirmationRequest, ToolConfirmationResponse};

use crate::{ClientError, ClientOps, ops::upgrade};

/// Answers one `tool_confirmation_required` event.
///
/// Cloned into every handler that observes the request; whichever clone
/// responds first wins and later calls fail with
/// [`ClientError::ConfirmationAlreadyResolved`].
#[derive(Clone)]
pub struct ConfirmationResponder {
    session_id: String,
    request: Arc<ToolConfirmationRequest>,
    resolved: Arc<AtomicBool>,
    ops: Weak<dyn ClientOps>,
}

impl ConfirmationResponder {
    pub(crate) fn new(
        ops: Weak<dyn ClientOps>,
        session_id: impl Into<String>,
        request: ToolConfirmationRequest,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            request: Arc::new(request),
            resolved: Arc::new(AtomicBool::new(false)),
            ops,
        }
    }

    #[must_use]
    pub fn request(&self) -> &ToolConfirmationRequest {
        &self.request
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether a response has been submitted.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Submit the response to `/tool-response`.
    ///
    /// If the request fails the responder is released so the caller may retry.
    ///
    /// # Errors
    /// [`ClientError::ConfirmationAlreadyResolved`] on a second call, or the
    /// control-plane error.
    pub async fn respond(&self, response: ToolConfirmationResponse) -> Result<(), ClientError> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Err(ClientError::ConfirmationAlreadyResolved);
        }
        let outcome = async {
            let ops = upgrade(&self.ops)?;
            let result = serde_json::to_value(&response)?;
            ops.submit_tool_result(&self.session_id, &self.request.tool_use_id, result)
                .await
        }
        .await;
        if outcome.is_err() {
            self.resolved.store(false, Ordering::SeqCst);
        }
        outcome
    }

    /// # Errors
    /// See [`ConfirmationResponder::respond`].
    pub async fn approve(&self) -> Result<(), ClientError> {
        self.respond(ToolConfirmationResponse::approve()).await
    }

    /// # Errors
    /// See [`ConfirmationResponder::respond`].
    pub async fn deny(&self, reason: impl Into<String>) -> Result<(), ClientError> {
        self.respond(ToolConfirmationResponse::deny(reason)).await
    }
}

impl std::fmt::Debug for ConfirmationResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationResponder")
            .field("session_id", &self.session_id)
            .field("tool_use_id", &self.request.tool_use_id)
            .field("resolved", &self.is_resolved())
            .finish_non_exhaustive()
    }
}
