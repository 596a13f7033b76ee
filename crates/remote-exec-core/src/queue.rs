//! Single-producer/single-consumer event queue.

use std::{
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Buffered queue of typed events.
///
/// `push` hands a value straight to a waiting consumer or buffers it.
/// `close` is idempotent: buffered values are still drained, after which the
/// consumer sees the end of the sequence; later pushes are discarded.
///
/// The buffer is unbounded. Depth is visible through [`EventQueue::len`].
pub struct EventQueue<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
    depth: Arc<AtomicUsize>,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    /// Create an open, empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliver a value. Returns `false` if the queue was already closed.
    pub fn push(&self, value: T) -> bool {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        if tx.send(value).is_ok() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            // Consumer dropped; nothing will ever read this.
            false
        }
    }

    /// End the sequence. Safe to call more than once.
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Number of values pushed but not yet consumed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Whether no values are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the consuming end.
    ///
    /// The sequence cannot be restarted: only the first call returns `Some`.
    pub fn take_stream(&self) -> Option<EventStream<T>> {
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|rx| EventStream {
                inner: UnboundedReceiverStream::new(rx),
                depth: Arc::clone(&self.depth),
            })
    }
}

/// Consuming end of an [`EventQueue`].
pub struct EventStream<T> {
    inner: UnboundedReceiverStream<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> EventStream<T> {
    /// Wait for the next value; `None` once the queue is closed and drained.
    pub async fn next_event(&mut self) -> Option<T> {
        futures::StreamExt::next(self).await
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(_)) = &polled {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        polled
    }
}
