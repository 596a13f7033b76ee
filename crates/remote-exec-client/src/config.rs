//! Client configuration.

use std::time::Duration;

use remote_exec_core::DEFAULT_DEDUP_CAPACITY;
use uuid::Uuid;

/// Connection-level settings.
///
/// HTTP settings (base URL, paths, token, headers) live in
/// [`remote_exec_transport::TransportConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Reconnect attempt `n` waits `n * reconnect_base_delay`.
    pub reconnect_base_delay: Duration,
    /// Attempts allowed before the connection enters the error state.
    pub max_reconnect_attempts: u32,
    /// How long a freshly opened event stream may take to send its
    /// `connection` frame.
    pub handshake_timeout: Duration,
    /// Size of the recent-event-id window.
    pub dedup_capacity: usize,
    /// Identifies this client on channel subscriptions.
    pub client_id: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            handshake_timeout: Duration::from_secs(30),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            client_id: Uuid::new_v4().to_string(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub const fn reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    #[must_use]
    pub const fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    #[must_use]
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay.saturating_mul(attempt)
    }
}
