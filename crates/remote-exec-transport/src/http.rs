//! `reqwest`-backed transport.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{
    Client, Response,
    header::{ACCEPT, AUTHORIZATION, COOKIE, HeaderMap, HeaderName, HeaderValue},
};
use serde_json::Value;

use crate::{
    frames::{FrameStream, LineStream},
    traits::{Transport, TransportError},
};

/// Default control-plane request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Server endpoints the client calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Events,
    Subscribe,
    Send,
    Abort,
    Close,
    ToolResponse,
    Channel,
    ChannelSubscribe,
    Invoke,
    Queue,
}

/// Endpoint paths, each overridable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub events: String,
    pub subscribe: String,
    pub send: String,
    pub abort: String,
    pub close: String,
    pub tool_response: String,
    pub channel: String,
    pub channel_subscribe: String,
    pub invoke: String,
    pub queue: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            events: "/events".into(),
            subscribe: "/subscribe".into(),
            send: "/send".into(),
            abort: "/abort".into(),
            close: "/close".into(),
            tool_response: "/tool-response".into(),
            channel: "/channel".into(),
            channel_subscribe: "/channel/subscribe".into(),
            invoke: "/invoke".into(),
            queue: "/queue".into(),
        }
    }
}

impl Endpoints {
    /// Path for an endpoint.
    #[must_use]
    pub fn path(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Events => &self.events,
            Endpoint::Subscribe => &self.subscribe,
            Endpoint::Send => &self.send,
            Endpoint::Abort => &self.abort,
            Endpoint::Close => &self.close,
            Endpoint::ToolResponse => &self.tool_response,
            Endpoint::Channel => &self.channel,
            Endpoint::ChannelSubscribe => &self.channel_subscribe,
            Endpoint::Invoke => &self.invoke,
            Endpoint::Queue => &self.queue,
        }
    }

    /// Override one path.
    pub fn set(&mut self, endpoint: Endpoint, path: impl Into<String>) {
        let slot = match endpoint {
            Endpoint::Events => &mut self.events,
            Endpoint::Subscribe => &mut self.subscribe,
            Endpoint::Send => &mut self.send,
            Endpoint::Abort => &mut self.abort,
            Endpoint::Close => &mut self.close,
            Endpoint::ToolResponse => &mut self.tool_response,
            Endpoint::Channel => &mut self.channel,
            Endpoint::ChannelSubscribe => &mut self.channel_subscribe,
            Endpoint::Invoke => &mut self.invoke,
            Endpoint::Queue => &mut self.queue,
        };
        *slot = path.into();
    }
}

/// Cookie handling for requests.
///
/// Every request goes to the one configured base URL, so there is no
/// cross-origin case: the modes differ only in where cookies come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
    /// No cookies at all; a `cookie` entry in the configured headers is dropped.
    Omit,
    /// Default: only cookies set explicitly through the configured headers.
    #[default]
    SameOrigin,
    /// Also keep a cookie store, replaying cookies the server sets.
    Include,
}

/// Construction-time transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server base URL, without trailing slash.
    pub base_url: String,
    pub endpoints: Endpoints,
    /// Timeout for JSON control-plane requests. Streams only get a connect timeout.
    pub timeout: Duration,
    /// Bearer token sent as `Authorization`.
    pub token: Option<String>,
    /// Extra headers for every request.
    pub headers: HashMap<String, String>,
    pub credentials: CredentialsMode,
}

impl TransportConfig {
    /// Create a config for the given base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            endpoints: Endpoints::default(),
            timeout: DEFAULT_TIMEOUT,
            token: None,
            headers: HashMap::new(),
            credentials: CredentialsMode::default(),
        }
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the bearer token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Add a header sent with every request.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Override an endpoint path.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint, path: impl Into<String>) -> Self {
        self.endpoints.set(endpoint, path);
        self
    }

    /// Set the credentials mode.
    #[must_use]
    pub const fn credentials(mut self, mode: CredentialsMode) -> Self {
        self.credentials = mode;
        self
    }

    /// Full URL for an endpoint.
    #[must_use]
    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, self.endpoints.path(endpoint))
    }

    fn default_headers(&self) -> Result<HeaderMap, TransportError> {
        let mut map = HeaderMap::new();
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::InvalidHeader(AUTHORIZATION.to_string()))?;
            map.insert(AUTHORIZATION, value);
        }
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
            if name == COOKIE && self.credentials == CredentialsMode::Omit {
                continue;
            }
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::InvalidHeader(name.to_string()))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

/// HTTP transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: TransportConfig,
    http: Client,
}

impl HttpTransport {
    /// Build a transport from config.
    ///
    /// # Errors
    /// Returns error if a header is invalid or the HTTP client cannot be built.
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let http = Client::builder()
            .default_headers(config.default_headers()?)
            .connect_timeout(config.timeout)
            .cookie_store(config.credentials == CredentialsMode::Include)
            .build()?;
        Ok(Self { config, http })
    }

    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    async fn check(response: Response) -> Result<Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }

    fn lines(response: Response) -> FrameStream {
        LineStream::new(response.bytes_stream().boxed())
            .map(|line| line.map_err(TransportError::from))
            .boxed()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_events(&self) -> Result<FrameStream, TransportError> {
        let url = self.config.url(Endpoint::Events);
        tracing::debug!(%url, "Opening event stream");
        let response = self
            .http
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        Ok(Self::lines(Self::check(response).await?))
    }

    async fn post_json(&self, endpoint: Endpoint, body: Value) -> Result<Value, TransportError> {
        let url = self.config.url(endpoint);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .timeout(self.config.timeout)
            .send()
            .await?;
        let text = Self::check(response).await?.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    async fn post_stream(
        &self,
        endpoint: Endpoint,
        body: Value,
    ) -> Result<FrameStream, TransportError> {
        let url = self.config.url(endpoint);
        let response = self
            .http
            .post(&url)
            .header(ACCEPT, "application/x-ndjson, text/event-stream")
            .json(&body)
            .send()
            .await?;
        Ok(Self::lines(Self::check(response).await?))
    }
}
