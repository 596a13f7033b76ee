//! Streaming method invocation.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::{Stream, StreamExt};
use remote_exec_core::{EventQueue, EventStream};
use remote_exec_transport::{FrameStream, InvokeFrame, protocol::parse_invoke_frame};
use serde_json::Value;
use tracing::{debug, warn};

use crate::ClientError;

type Item = Result<Value, ClientError>;

/// Chunks of a streamed `invoke` response.
///
/// Ends after `method:end`, after a `method:error` item, or when the body
/// closes. Chunks are buffered until pulled.
pub struct InvokeStream {
    inner: Option<EventStream<Item>>,
}

impl InvokeStream {
    /// Drain an already-filled queue.
    pub(crate) fn from_queue(queue: &EventQueue<Item>) -> Self {
        Self {
            inner: queue.take_stream(),
        }
    }

    /// Pump `frames` into a fresh queue on a background task.
    pub(crate) fn spawn(method: String, mut frames: FrameStream) -> Self {
        let queue = EventQueue::new();
        let stream = Self::from_queue(&queue);

        tokio::spawn(async move {
            while let Some(line) = frames.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        queue.push(Err(e.into()));
                        break;
                    }
                };
                let frame = match parse_invoke_frame(&line) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(method = %method, error = %e, "Skipping malformed invoke frame");
                        continue;
                    }
                };
                match frame {
                    InvokeFrame::Chunk { chunk } => {
                        if !queue.push(Ok(chunk)) {
                            debug!(method = %method, "Invoke stream dropped by consumer");
                            break;
                        }
                    }
                    InvokeFrame::End => break,
                    InvokeFrame::Error { error } => {
                        queue.push(Err(ClientError::Invoke {
                            method: method.clone(),
                            message: error_message(&error),
                        }));
                        break;
                    }
                }
            }
            queue.close();
        });

        stream
    }

    /// Next chunk; `None` once the stream has finished.
    pub async fn next_chunk(&mut self) -> Option<Item> {
        self.next().await
    }

    /// Collect all remaining chunks, stopping at the first error.
    ///
    /// # Errors
    /// The first item error.
    pub async fn collect_all(mut self) -> Result<Vec<Value>, ClientError> {
        let mut chunks = Vec::new();
        while let Some(item) = self.next().await {
            chunks.push(item?);
        }
        Ok(chunks)
    }
}

impl Stream for InvokeStream {
    type Item = Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Item>> {
        match self.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use remote_exec_transport::TransportError;
    use serde_json::json;

    use super::*;

    fn frames(lines: &[&str]) -> FrameStream {
        let lines: Vec<Result<String, TransportError>> =
            lines.iter().map(|l| Ok((*l).to_string())).collect();
        stream::iter(lines).boxed()
    }

    #[tokio::test]
    async fn test_chunks_until_end_frame() {
        let stream = InvokeStream::spawn(
            "count".into(),
            frames(&[
                r#"{"type":"method:chunk","chunk":1}"#,
                "",
                r#"data: {"type":"method:chunk","chunk":{"n":2}}"#,
                r#"{"type":"method:end"}"#,
                r#"{"type":"method:chunk","chunk":"ignored"}"#,
            ]),
        );
        assert_eq!(stream.collect_all().await.unwrap(), vec![json!(1), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_error_frame_terminates_with_error_item() {
        let mut stream = InvokeStream::spawn(
            "fail".into(),
            frames(&[
                r#"{"type":"method:chunk","chunk":"a"}"#,
                "not json",
                r#"{"type":"method:error","error":{"message":"nope"}}"#,
            ]),
        );
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), json!("a"));
        let err = stream.next_chunk().await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Invoke { ref message, .. } if message == "nope"));
        assert!(stream.next_chunk().await.is_none());
    }
}
