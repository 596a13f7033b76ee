//! Line splitting for streamed response bodies.
//!
//! Both the `/events` SSE stream and `/send`/`/invoke` NDJSON bodies are
//! consumed one line at a time; framing is stripped later by
//! [`crate::protocol::frame_payload`].

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use futures::{Stream, stream::BoxStream};

use crate::TransportError;

/// Stream of raw lines from a response body.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Adapter turning a byte stream into lines.
///
/// Handles `\n` and `\r\n` endings and multi-byte characters split across
/// chunks. A trailing line without a newline is yielded at end of stream.
pub struct LineStream<S> {
    inner: S,
    buffer: BytesMut,
    done: bool,
}

impl<S> LineStream<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            done: false,
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line = self.buffer.split_to(end);
        self.buffer.advance(1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl<S, B, E> Stream for LineStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    type Item = Result<String, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(line) = self.take_line() {
                return Poll::Ready(Some(Ok(line)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.buffer.extend_from_slice(chunk.as_ref()),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    self.done = true;
                    if !self.buffer.is_empty() {
                        let rest = self.buffer.split();
                        return Poll::Ready(Some(Ok(String::from_utf8_lossy(&rest).into_owned())));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
