//! Tool confirmation requests and responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A privileged tool call waiting for the user's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfirmationRequest {
    /// Identifier of the pending tool call.
    pub tool_use_id: String,
    /// Tool name.
    pub name: String,
    /// Arguments the tool would be invoked with.
    #[serde(default)]
    pub arguments: Value,
    /// Optional human-readable prompt from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The decision for one [`ToolConfirmationRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfirmationResponse {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ToolConfirmationResponse {
    /// Allow the tool invocation.
    #[must_use]
    pub const fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    /// Deny the tool invocation.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}
