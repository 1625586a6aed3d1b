//! Channel lifecycle: connect, reconnect with backoff, disconnect, dispatch.

use crate::channel::backoff::ReconnectPolicy;
use crate::channel::credentials::CredentialProvider;
use crate::channel::transport::{CloseInfo, Connector, Frame, TransportEvent};
use crate::defaults;
use crate::error::{Result, SharedError, VoiceLinkError};
use crate::events::{Registry, Subscription};
use crate::sync::lock;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Connection state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Payload of the disconnect event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectInfo {
    /// The close was requested through `disconnect()`.
    pub intentional: bool,
    /// A reconnect has been scheduled. False means the channel stays closed
    /// until someone calls `connect()` again.
    pub will_reconnect: bool,
    pub code: Option<u16>,
    pub reason: String,
}

/// Where and how the channel connects.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Server origin, e.g. `https://bots.example.com`.
    pub origin: String,
    /// Voice endpoint path appended to the origin.
    pub endpoint_path: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            origin: defaults::DEFAULT_ORIGIN.to_string(),
            endpoint_path: defaults::VOICE_ENDPOINT_PATH.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Build the channel URL from the origin, endpoint path and bearer token.
///
/// `http`/`https` origins map to `ws`/`wss`. The token travels as a query
/// parameter because the WebSocket handshake offers no custom headers in
/// browsers and the server expects it there.
///
/// # Errors
/// Returns `VoiceLinkError::ConfigInvalidValue` for origins with an unsupported scheme.
pub fn build_url(origin: &str, endpoint_path: &str, token: &str) -> Result<String> {
    let origin = origin.trim().trim_end_matches('/');
    let base = if let Some(rest) = origin.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = origin.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if origin.starts_with("wss://") || origin.starts_with("ws://") {
        origin.to_string()
    } else {
        return Err(VoiceLinkError::ConfigInvalidValue {
            key: "server.origin".to_string(),
            message: format!("unsupported scheme in '{}'", origin),
        });
    };

    let path = endpoint_path.trim();
    let separator = if path.starts_with('/') { "" } else { "/" };
    Ok(format!(
        "{}{}{}?{}={}",
        base,
        separator,
        path,
        defaults::TOKEN_QUERY_PARAM,
        urlencoding::encode(token)
    ))
}

type ReconnectGuard = Arc<dyn Fn() -> bool + Send + Sync>;

struct State {
    connection: ConnectionState,
    attempts: u32,
    intentional_close: bool,
    /// Bumped by every connect and disconnect; links and timers from an
    /// older generation are stale and ignored.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

struct Inner<M: 'static> {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    can_reconnect: Mutex<Option<ReconnectGuard>>,
    state: Mutex<State>,
    on_message: Registry<M>,
    on_binary: Registry<[u8]>,
    on_connect: Registry<()>,
    on_disconnect: Registry<DisconnectInfo>,
    on_error: Registry<SharedError>,
}

/// Owns one duplex channel and keeps it connected.
///
/// Text frames are parsed as `M` and fanned out to message handlers; binary
/// frames go to binary handlers untouched. Cloning yields another handle to
/// the same channel.
pub struct ChannelManager<M: 'static> {
    inner: Arc<Inner<M>>,
}

impl<M: 'static> Clone for ChannelManager<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> ChannelManager<M>
where
    M: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                credentials,
                can_reconnect: Mutex::new(None),
                state: Mutex::new(State {
                    connection: ConnectionState::Closed,
                    attempts: 0,
                    intentional_close: false,
                    generation: 0,
                    outbound: None,
                    reconnect_timer: None,
                }),
                on_message: Registry::new("channel.message"),
                on_binary: Registry::new("channel.binary"),
                on_connect: Registry::new("channel.connect"),
                on_disconnect: Registry::new("channel.disconnect"),
                on_error: Registry::new("channel.error"),
            }),
        }
    }

    /// Extra condition checked before every automatic reconnect, e.g.
    /// "this is still the active conversation".
    pub fn set_reconnect_guard<F>(&self, guard: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        *lock(&self.inner.can_reconnect) = Some(Arc::new(guard));
    }

    /// Open the channel.
    ///
    /// Returns immediately if the channel is already open or connecting.
    ///
    /// # Errors
    /// - `VoiceLinkError::Authentication` if no credential is available; nothing is opened
    ///   and no reconnect is scheduled.
    /// - `VoiceLinkError::ChannelConnection` if the handshake fails; a reconnect is
    ///   scheduled according to the reconnect policy.
    pub async fn connect(&self) -> Result<()> {
        Arc::clone(&self.inner).open().await
    }

    /// Close the channel and stop any reconnect.
    ///
    /// Safe to call in any state and more than once.
    pub fn disconnect(&self) {
        let (previous, timer) = {
            let mut state = lock(&self.inner.state);
            state.intentional_close = true;
            state.generation += 1;
            state.attempts = 0;
            state.outbound = None;
            let previous = state.connection;
            state.connection = ConnectionState::Closed;
            (previous, state.reconnect_timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if previous != ConnectionState::Closed {
            tracing::info!("Voice channel disconnected by client");
            self.inner.on_disconnect.emit(&DisconnectInfo {
                intentional: true,
                will_reconnect: false,
                code: Some(1000),
                reason: "client disconnect".to_string(),
            });
        }
    }

    /// Send a frame. Returns false (and drops the frame) unless the channel is open.
    pub fn send(&self, frame: Frame) -> bool {
        let state = lock(&self.inner.state);
        match (&state.connection, &state.outbound) {
            (ConnectionState::Open, Some(outbound)) => outbound.send(frame).is_ok(),
            _ => false,
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::Text(text.into()))
    }

    /// Serialize `message` and send it as a text frame.
    ///
    /// # Errors
    /// Returns `VoiceLinkError::Json` if serialization fails.
    pub fn send_json<T: Serialize>(&self, message: &T) -> Result<bool> {
        let text = serde_json::to_string(message)?;
        Ok(self.send(Frame::Text(text)))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.send(Frame::Binary(data))
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).connection
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.state).attempts
    }

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.inner.on_message.subscribe(handler)
    }

    pub fn on_binary<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner.on_binary.subscribe(handler)
    }

    pub fn on_connect<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.on_connect.subscribe(move |_: &()| handler())
    }

    pub fn on_disconnect<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DisconnectInfo) + Send + Sync + 'static,
    {
        self.inner.on_disconnect.subscribe(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SharedError) + Send + Sync + 'static,
    {
        self.inner.on_error.subscribe(handler)
    }
}

impl<M> Inner<M>
where
    M: DeserializeOwned + Send + Sync + 'static,
{
    // Boxed so the reconnect timer, which calls back into `open`, has a nameable future type.
    fn open(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let generation = {
                let mut state = lock(&self.state);
                if state.connection != ConnectionState::Closed {
                    return Ok(());
                }
                state.connection = ConnectionState::Connecting;
                state.intentional_close = false;
                state.generation += 1;
                state.generation
            };

            let Some(token) = self.credentials.bearer_token() else {
                let error = VoiceLinkError::Authentication {
                    message: "no bearer token available".to_string(),
                };
                return Err(self.abort_attempt(generation, error));
            };

            let url = match build_url(&self.config.origin, &self.config.endpoint_path, &token) {
                Ok(url) => url,
                Err(error) => return Err(self.abort_attempt(generation, error)),
            };

            tracing::debug!(
                origin = %self.config.origin,
                path = %self.config.endpoint_path,
                "Opening voice channel"
            );

            match self.connector.open(&url).await {
                Ok(link) => {
                    {
                        let mut state = lock(&self.state);
                        if state.generation != generation {
                            // disconnect() ran during the handshake; dropping the link closes it.
                            tracing::debug!("Discarding connection opened after disconnect");
                            return Ok(());
                        }
                        state.connection = ConnectionState::Open;
                        state.attempts = 0;
                        state.outbound = Some(link.outbound);
                    }
                    tracing::info!("Voice channel open");
                    self.spawn_reader(generation, link.inbound);
                    self.on_connect.emit(&());
                    Ok(())
                }
                Err(error) => {
                    tracing::warn!("Voice channel connection failed: {}", error);
                    let reason = error.to_string();
                    let shared: SharedError = Arc::new(error);
                    self.on_error.emit(&shared);
                    self.handle_close(
                        generation,
                        CloseInfo {
                            code: None,
                            reason: reason.clone(),
                        },
                    );
                    Err(VoiceLinkError::ChannelConnection { message: reason })
                }
            }
        })
    }

    /// Fail an attempt before any connection exists: no reconnect, no disconnect event.
    fn abort_attempt(&self, generation: u64, error: VoiceLinkError) -> VoiceLinkError {
        {
            let mut state = lock(&self.state);
            if state.generation == generation {
                state.connection = ConnectionState::Closed;
            }
        }
        tracing::error!("Voice channel not opened: {}", error);
        self.on_error.emit(&Arc::new(error.duplicate()));
        error
    }

    fn spawn_reader(
        self: &Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut close = CloseInfo {
                code: None,
                reason: "transport ended".to_string(),
            };
            while let Some(event) = inbound.recv().await {
                if !inner.is_current(generation) {
                    return;
                }
                match event {
                    TransportEvent::Frame(Frame::Text(text)) => inner.dispatch_text(&text),
                    TransportEvent::Frame(Frame::Binary(data)) => inner.on_binary.emit(&data),
                    TransportEvent::Error(message) => {
                        tracing::warn!("Voice channel error: {}", message);
                        inner
                            .on_error
                            .emit(&Arc::new(VoiceLinkError::ChannelConnection { message }));
                    }
                    TransportEvent::Closed(info) => {
                        close = info;
                        break;
                    }
                }
            }
            inner.handle_close(generation, close);
        });
    }

    fn dispatch_text(&self, text: &str) {
        match serde_json::from_str::<M>(text) {
            Ok(message) => self.on_message.emit(&message),
            Err(e) => {
                tracing::warn!("Dropping malformed control message: {}", e);
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.state).generation == generation
    }

    fn reconnect_allowed(&self) -> bool {
        let guard = lock(&self.can_reconnect).clone();
        guard.is_none_or(|guard| guard())
    }

    fn handle_close(self: &Arc<Self>, generation: u64, close: CloseInfo) {
        let (intentional, attempts) = {
            let mut state = lock(&self.state);
            if state.generation != generation || state.connection == ConnectionState::Closed {
                return;
            }
            state.connection = ConnectionState::Closed;
            state.outbound = None;
            (state.intentional_close, state.attempts)
        };

        let policy = self.config.reconnect;
        let wanted = !intentional && policy.allows(attempts) && self.reconnect_allowed();
        let scheduled = if wanted {
            let mut state = lock(&self.state);
            if state.generation != generation || state.intentional_close {
                None
            } else {
                state.attempts += 1;
                let delay = policy.delay_for(state.attempts);
                state.reconnect_timer = Some(self.spawn_reconnect(generation, delay));
                Some((state.attempts, delay))
            }
        } else {
            None
        };

        match scheduled {
            Some((attempt, delay)) => tracing::info!(
                attempt,
                max_attempts = policy.max_attempts,
                "Voice channel closed ({}); reconnecting in {:?}",
                close.reason,
                delay
            ),
            None if !intentional && !policy.allows(attempts) => tracing::warn!(
                "Voice channel closed ({}); giving up after {} reconnect attempts",
                close.reason,
                attempts
            ),
            None => tracing::info!("Voice channel closed ({})", close.reason),
        }

        self.on_disconnect.emit(&DisconnectInfo {
            intentional,
            will_reconnect: scheduled.is_some(),
            code: close.code,
            reason: close.reason,
        });
    }

    fn spawn_reconnect(self: &Arc<Self>, generation: u64, delay: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = lock(&inner.state);
                if state.generation != generation || state.intentional_close {
                    return;
                }
                state.reconnect_timer = None;
            }
            if let Err(e) = inner.open().await {
                tracing::debug!("Reconnect attempt failed: {}", e);
            }
        })
    }
}
