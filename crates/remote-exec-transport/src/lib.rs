//! HTTP transport for the remote execution client.
//!
//! Provides:
//! - Wire protocol (request bodies, envelope flattening, frame parsing)
//! - Line splitting for SSE and NDJSON response bodies
//! - The `Transport` trait and its `reqwest` implementation

pub mod frames;
pub mod http;
pub mod protocol;
pub mod traits;

pub use frames::{FrameStream, LineStream};
pub use http::{CredentialsMode, Endpoint, Endpoints, HttpTransport, TransportConfig};
pub use protocol::{ConnectionHandshake, InvokeFrame, flatten_envelope, parse_frame};
pub use traits::{Transport, TransportError};
