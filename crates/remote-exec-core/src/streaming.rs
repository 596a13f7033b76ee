//! Derived "currently streaming text" aggregate.

use crate::{EventKind, StreamEvent};

/// Text of the response currently being streamed.
///
/// Starting content resets it, deltas append, end markers freeze it.
/// A delta arriving after a freeze starts a new response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingText {
    text: String,
    active: bool,
}

impl StreamingText {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the aggregate.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event.kind {
            EventKind::ExecutionStart | EventKind::ContentStart => {
                self.text.clear();
                self.active = true;
            }
            EventKind::ContentDelta => {
                if !self.active {
                    self.text.clear();
                    self.active = true;
                }
                if let Some(delta) = event.delta_text() {
                    self.text.push_str(delta);
                }
            }
            _ if event.is_end_marker() => self.active = false,
            _ => {}
        }
    }

    /// Accumulated text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether more deltas are expected.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.active
    }
}
