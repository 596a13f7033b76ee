//! Shared fixtures for client integration tests.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, Once},
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use remote_exec_client::{Endpoint, Transport};
use remote_exec_transport::{FrameStream, TransportError};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Line = Result<String, TransportError>;

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Test side of a live scripted stream.
#[derive(Clone)]
pub struct LiveStream {
    tx: mpsc::UnboundedSender<Line>,
}

impl LiveStream {
    pub fn event(&self, value: Value) {
        let _ = self.tx.send(Ok(format!("data: {value}")));
        let _ = self.tx.send(Ok(String::new()));
    }

    pub fn raw(&self, line: &str) {
        let _ = self.tx.send(Ok(line.to_string()));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.tx.send(Err(TransportError::Other(message.to_string())));
    }
}

enum Plan {
    Lines(Vec<Line>),
    Live(mpsc::UnboundedReceiver<Line>),
}

impl Plan {
    fn into_stream(self) -> FrameStream {
        match self {
            Self::Lines(lines) => stream::iter(lines).boxed(),
            Self::Live(rx) => UnboundedReceiverStream::new(rx).boxed(),
        }
    }
}

/// In-memory [`Transport`] driven by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    events: Mutex<VecDeque<Plan>>,
    sends: Mutex<VecDeque<Plan>>,
    responses: Mutex<HashMap<Endpoint, Value>>,
    posts: Mutex<Vec<(Endpoint, Value)>>,
    opens: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next `/events` stream stays open and is fed by the returned handle.
    pub fn live_events(&self) -> LiveStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events.lock().unwrap().push_back(Plan::Live(rx));
        LiveStream { tx }
    }

    /// Next `/events` stream yields `lines` and then ends.
    pub fn events_then_close(&self, lines: Vec<Line>) {
        self.events.lock().unwrap().push_back(Plan::Lines(lines));
    }

    /// Next `/send` body stays open and is fed by the returned handle.
    pub fn live_send(&self) -> LiveStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sends.lock().unwrap().push_back(Plan::Live(rx));
        LiveStream { tx }
    }

    /// Next `/send` body yields `events` and then ends.
    pub fn send_events(&self, events: &[Value]) {
        let lines = events.iter().map(|e| Ok(e.to_string())).collect();
        self.sends.lock().unwrap().push_back(Plan::Lines(lines));
    }

    pub fn respond(&self, endpoint: Endpoint, value: Value) {
        self.responses.lock().unwrap().insert(endpoint, value);
    }

    pub fn posts(&self, endpoint: Endpoint) -> Vec<Value> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn opens(&self) -> Vec<tokio::time::Instant> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open_events(&self) -> Result<FrameStream, TransportError> {
        self.opens.lock().unwrap().push(tokio::time::Instant::now());
        let plan = self.events.lock().unwrap().pop_front();
        plan.map(Plan::into_stream)
            .ok_or_else(|| TransportError::Other("connection refused".into()))
    }

    async fn post_json(&self, endpoint: Endpoint, body: Value) -> Result<Value, TransportError> {
        self.posts.lock().unwrap().push((endpoint, body));
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(&endpoint)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn post_stream(
        &self,
        endpoint: Endpoint,
        body: Value,
    ) -> Result<FrameStream, TransportError> {
        self.posts.lock().unwrap().push((endpoint, body));
        let plan = self.sends.lock().unwrap().pop_front();
        plan.map(Plan::into_stream).ok_or_else(|| TransportError::Http {
            status: 503,
            body: "no stream scripted".into(),
        })
    }
}

/// Handshake frame announcing `connection_id` with resumed `subscriptions`.
pub fn handshake(connection_id: &str, subscriptions: &[&str]) -> Value {
    json!({
        "type": "connection",
        "connectionId": connection_id,
        "subscriptions": subscriptions,
    })
}

/// Handshake as a raw SSE line.
pub fn handshake_line(connection_id: &str) -> Line {
    Ok(format!("data: {}", handshake(connection_id, &[])))
}

/// Let spawned tasks run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
