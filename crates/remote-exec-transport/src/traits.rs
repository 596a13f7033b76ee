//! Transport trait and error.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{frames::FrameStream, http::Endpoint};

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// HTTP status, for errors that carry one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// The HTTP collaborator the client talks through.
///
/// Implemented by [`crate::HttpTransport`]; tests substitute scripted fakes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the multiplexed event stream.
    async fn open_events(&self) -> Result<FrameStream, TransportError>;

    /// POST a JSON body and read a JSON reply (`Null` for an empty body).
    async fn post_json(&self, endpoint: Endpoint, body: Value) -> Result<Value, TransportError>;

    /// POST a JSON body and stream the reply line by line.
    async fn post_stream(
        &self,
        endpoint: Endpoint,
        body: Value,
    ) -> Result<FrameStream, TransportError>;
}
