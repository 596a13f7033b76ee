//! Event stream lifecycle: connect, handshake, reconnect with backoff.
//!
//! Every physical connection gets a generation number. Reader and
//! reconnect tasks only hold a `Weak<ClientInner>` and check their
//! generation before touching shared state, so a superseded stream can
//! never clobber a newer one.

use std::{collections::HashSet, sync::Weak, time::Duration};

use futures::StreamExt;
use remote_exec_core::{ConnectionState, EventKind};
use remote_exec_transport::{
    ConnectionHandshake, Endpoint, FrameStream, parse_frame, protocol::SubscribeRequest,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{ClientError, client::ClientInner};

type HandshakeTx = oneshot::Sender<Result<String, ClientError>>;

/// Why the connection is not usable.
#[derive(Debug, Clone)]
pub(crate) enum LastError {
    Failed(String),
    Exhausted(u32),
}

impl LastError {
    fn to_error(&self) -> ClientError {
        match self {
            Self::Failed(message) => ClientError::Connection(message.clone()),
            Self::Exhausted(attempts) => ClientError::ReconnectExhausted {
                attempts: *attempts,
            },
        }
    }
}

/// Mutable connection bookkeeping, guarded by one lock.
#[derive(Default)]
pub(crate) struct ConnectionSlot {
    pub connection_id: Option<String>,
    pub attempts: u32,
    pub generation: u64,
    pub reader: Option<JoinHandle<()>>,
    pub reconnect: Option<JoinHandle<()>>,
    pub last_error: Option<LastError>,
    /// Sessions unsubscribed while no connection id was known.
    pub pending_removals: HashSet<String>,
    pub destroyed: bool,
}

impl ConnectionSlot {
    pub(crate) fn abort_tasks(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }
    }
}

impl ClientInner {
    /// Connection id of the live stream, if connected.
    pub(crate) fn connected_id(&self) -> Option<String> {
        if *self.state.borrow() != ConnectionState::Connected {
            return None;
        }
        self.slot().connection_id.clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        let slot = self.slot();
        slot.generation == generation && !slot.destroyed
    }

    fn last_error(&self) -> ClientError {
        self.slot().last_error.as_ref().map_or_else(
            || ClientError::Connection("connection failed".into()),
            LastError::to_error,
        )
    }

    /// Connection id to unregister `session_id` with. Without one, the
    /// removal is held for the next handshake.
    pub(crate) fn removal_target(&self, session_id: &str) -> Option<String> {
        let mut slot = self.slot();
        if slot.connection_id.is_none() {
            slot.pending_removals.insert(session_id.to_string());
        }
        slot.connection_id.clone()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(state = ?next, "Connection state changed");
        }
    }

    /// Connect unless already connected; concurrent callers share one attempt.
    pub(crate) async fn ensure_connection(&self) -> Result<String, ClientError> {
        let mut rx = self.state.subscribe();
        loop {
            if self.slot().destroyed {
                return Err(ClientError::ClientClosed);
            }
            if let Some(id) = self.connected_id() {
                return Ok(id);
            }

            let claimed = self.state.send_if_modified(|state| {
                if matches!(state, ConnectionState::Disconnected | ConnectionState::Error) {
                    *state = ConnectionState::Connecting;
                    true
                } else {
                    false
                }
            });
            if claimed {
                return self.connect_fresh().await;
            }

            let settled = rx
                .wait_for(|state| *state != ConnectionState::Connecting)
                .await
                .map(|state| *state)
                .map_err(|_| ClientError::ClientClosed)?;
            match settled {
                ConnectionState::Error => return Err(self.last_error()),
                // Stream lost right after connecting; wait for the new state.
                ConnectionState::Connected => tokio::task::yield_now().await,
                ConnectionState::Disconnected | ConnectionState::Connecting => {}
            }
        }
    }

    /// Drop the current stream and connect again with a fresh attempt counter.
    pub(crate) async fn reconnect(&self) -> Result<String, ClientError> {
        if self.slot().destroyed {
            return Err(ClientError::ClientClosed);
        }
        self.state.send_replace(ConnectionState::Connecting);
        self.connect_fresh().await
    }

    /// Caller-initiated connect. State must already be `Connecting`.
    async fn connect_fresh(&self) -> Result<String, ClientError> {
        {
            let mut slot = self.slot();
            slot.attempts = 0;
            if let Some(reconnect) = slot.reconnect.take() {
                reconnect.abort();
            }
        }
        let generation = self.begin_generation();
        info!("Opening event stream");

        match self.open(generation).await {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!(error = %e, "Failed to connect event stream");
                if self.is_current(generation) {
                    self.slot().last_error = Some(LastError::Failed(e.to_string()));
                    self.set_state(ConnectionState::Error);
                }
                Err(e)
            }
        }
    }

    /// Invalidate the previous stream and return the new generation.
    fn begin_generation(&self) -> u64 {
        let mut slot = self.slot();
        slot.generation += 1;
        slot.connection_id = None;
        if let Some(reader) = slot.reader.take() {
            reader.abort();
        }
        slot.generation
    }

    /// Open the stream and wait for its handshake. Leaves state alone on failure.
    async fn open(&self, generation: u64) -> Result<String, ClientError> {
        let frames = self
            .transport
            .open_events()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let reader = tokio::spawn(read_events(self.self_ref.clone(), generation, frames, tx));
        {
            let mut slot = self.slot();
            if slot.generation != generation || slot.destroyed {
                reader.abort();
                return Err(ClientError::Connection("connection attempt superseded".into()));
            }
            slot.reader = Some(reader);
        }

        let timeout = self.config.handshake_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(outcome) => outcome.unwrap_or_else(|_| {
                Err(ClientError::Connection(
                    "event stream closed before handshake".into(),
                ))
            }),
            Err(_) => {
                let mut slot = self.slot();
                if slot.generation == generation {
                    if let Some(reader) = slot.reader.take() {
                        reader.abort();
                    }
                }
                Err(ClientError::Connection(format!(
                    "no handshake within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Apply a `connection` event. Returns `false` for a stale generation.
    ///
    /// The server's subscription list is merged into the local set, except
    /// for sessions unsubscribed while disconnected: those are removed on
    /// the server instead.
    fn on_handshake(&self, generation: u64, handshake: &ConnectionHandshake) -> bool {
        let withdrawn = {
            let mut slot = self.slot();
            if slot.generation != generation || slot.destroyed {
                return false;
            }
            slot.connection_id = Some(handshake.connection_id.clone());
            slot.last_error = None;
            std::mem::take(&mut slot.pending_removals)
        };

        let (resumed, remove): (Vec<String>, Vec<String>) = handshake
            .subscriptions
            .iter()
            .cloned()
            .partition(|id| !withdrawn.contains(id));
        let add: Vec<String> = {
            let mut subscribed = self.subscribed();
            subscribed.extend(resumed.iter().cloned());
            let on_server: HashSet<&String> = handshake.subscriptions.iter().collect();
            subscribed
                .iter()
                .filter(|id| !on_server.contains(id))
                .cloned()
                .collect()
        };
        for id in &resumed {
            let session = self.sessions().get(id).cloned();
            if let Some(session) = session {
                session.set_subscribed(self.subscribed().contains(id));
            }
        }

        self.set_state(ConnectionState::Connected);
        info!(
            connection_id = %handshake.connection_id,
            resumed = resumed.len(),
            resubscribing = add.len(),
            withdrawing = remove.len(),
            "Event stream connected"
        );

        if !add.is_empty() || !remove.is_empty() {
            let weak = self.self_ref.clone();
            let connection_id = handshake.connection_id.clone();
            tokio::spawn(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let body = SubscribeRequest {
                    connection_id,
                    add,
                    remove,
                };
                if let Err(e) = inner.post(Endpoint::Subscribe, &body).await {
                    warn!(error = %e, "Failed to resync subscriptions after reconnect");
                    inner.slot().pending_removals.extend(body.remove);
                }
            });
        }
        true
    }

    /// The stream of `generation` failed after its handshake.
    fn on_stream_lost(&self, generation: u64, reason: &str) {
        {
            let mut slot = self.slot();
            if slot.generation != generation || slot.destroyed {
                return;
            }
            slot.connection_id = None;
            slot.reader = None;
        }
        warn!(reason, "Event stream lost");
        self.set_state(ConnectionState::Connecting);

        let task = tokio::spawn(reconnect_loop(self.self_ref.clone()));
        if let Some(previous) = self.slot().reconnect.replace(task) {
            previous.abort();
        }
    }
}

/// Consume one physical event stream.
async fn read_events(
    client: Weak<ClientInner>,
    generation: u64,
    mut frames: FrameStream,
    handshake: HandshakeTx,
) {
    let mut handshake = Some(handshake);

    let reason = loop {
        let line = match frames.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => break e.to_string(),
            None => break "event stream closed".to_string(),
        };
        let Some(inner) = client.upgrade() else {
            return;
        };

        let event = match parse_frame(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Skipping malformed event frame");
                continue;
            }
        };

        if event.kind == EventKind::Connection {
            let Some(parsed) = ConnectionHandshake::from_event(&event) else {
                warn!("Connection event without a connection id");
                continue;
            };
            if !inner.on_handshake(generation, &parsed) {
                return;
            }
            if let Some(tx) = handshake.take() {
                let _ = tx.send(Ok(parsed.connection_id));
            }
            continue;
        }
        inner.route_event(event);
    };

    match handshake.take() {
        Some(tx) => {
            let _ = tx.send(Err(ClientError::Connection(reason)));
        }
        None => {
            if let Some(inner) = client.upgrade() {
                inner.on_stream_lost(generation, &reason);
            }
        }
    }
}

enum Backoff {
    Wait(u32, Duration),
    GiveUp(u32),
    Stop,
}

/// Retry with linear backoff until a handshake succeeds or attempts run out.
async fn reconnect_loop(client: Weak<ClientInner>) {
    loop {
        let step = {
            let Some(inner) = client.upgrade() else {
                return;
            };
            let mut slot = inner.slot();
            if slot.destroyed {
                Backoff::Stop
            } else {
                slot.attempts += 1;
                let attempt = slot.attempts;
                let max = inner.config.max_reconnect_attempts;
                if attempt > max {
                    slot.last_error = Some(LastError::Exhausted(max));
                    Backoff::GiveUp(max)
                } else {
                    Backoff::Wait(attempt, inner.config.reconnect_delay(attempt))
                }
            }
        };

        let (attempt, delay) = match step {
            Backoff::Wait(attempt, delay) => (attempt, delay),
            Backoff::GiveUp(attempts) => {
                error!(attempts, "Reconnection attempts exhausted");
                if let Some(inner) = client.upgrade() {
                    inner.set_state(ConnectionState::Error);
                }
                return;
            }
            Backoff::Stop => return,
        };

        info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting event stream"
        );
        tokio::time::sleep(delay).await;

        let Some(inner) = client.upgrade() else {
            return;
        };
        let generation = inner.begin_generation();
        match inner.open(generation).await {
            Ok(_) => return,
            Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
        }
    }
}
