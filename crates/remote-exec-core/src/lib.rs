//! Event model and delivery primitives for the remote execution client.
//!
//! This crate provides the building blocks the client is assembled from:
//! - `StreamEvent` / `ChannelEvent` - Typed wire events
//! - `EventQueue` - Single-consumer buffered event sequence
//! - `RecentIds` - Bounded de-duplication window
//! - `HandlerSet` - Listener registration with failure isolation
//! - `SendInput` - Send input normalization

pub mod confirmation;
pub mod dedup;
pub mod event;
pub mod handlers;
pub mod input;
pub mod queue;
pub mod streaming;

pub use confirmation::{ToolConfirmationRequest, ToolConfirmationResponse};
pub use dedup::{DEFAULT_DEDUP_CAPACITY, RecentIds};
pub use event::{ChannelEvent, ConnectionState, EventKind, SessionResultPayload, StreamEvent};
pub use handlers::{HandlerSet, Subscription};
pub use input::{CanonicalInput, ContentBlock, Message, SendInput};
pub use queue::{EventQueue, EventStream};
pub use streaming::StreamingText;
