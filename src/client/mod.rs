//! Sync client
//!
//! Read-through/write-through access to a sync server plus a push channel
//! kept alive by a background reconnect loop:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (close/error) -> Disconnected
//!      ^                                                          |
//!      +------------------ fixed reconnect delay -----------------+
//! ```
//!
//! `Connected` is entered once the server's greeting arrives, which it sends
//! only after registering the channel. Every (re)connect then refetches each
//! tracked domain, since the push channel only carries changes made after it
//! opened. Every payload seen, whether
//! fetched or pushed, is written to the local [`FallbackCache`].

pub mod cache;

pub use cache::{CachedState, FallbackCache};

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Response;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::sync::{FetchResponse, PushEvent, ReplaceResponse};

const EVENT_CAPACITY: usize = 256;

type PushStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Push channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Where a payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Fetched over HTTP
    Server,
    /// Received on the push channel
    Push,
    /// Read from the local fallback cache
    Cache,
}

/// Result of [`SyncClient::load`]
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub payload: Option<Value>,
    pub source: Source,
}

/// Result of [`SyncClient::save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Durably committed on the server
    Synced,
    /// Only in the local cache; not queued for resend
    SavedLocally,
}

/// Notifications for whoever renders the client's state
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged {
        domain: String,
        payload: Value,
        source: Source,
    },
    Connection(ConnectionState),
}

pub struct SyncClient {
    inner: Arc<ClientInner>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct ClientInner {
    config: ClientConfig,
    http: reqwest::Client,
    cache: FallbackCache,
    view: DashMap<String, Value>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let cache = FallbackCache::open(&config.cache_dir)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                http,
                cache,
                view: DashMap::new(),
                state_tx,
                events,
            }),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    /// Start the push channel and its reconnect loop (no-op if running)
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        self.stop_tx.send_replace(false);
        let stop_rx = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(run_channel(self.inner.clone(), stop_rx)));
    }

    /// Stop the reconnect loop and wait for it to finish
    pub async fn shutdown(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
        debug!("Sync client shut down");
    }

    /// Fetch `domain` from the server, updating the view and cache
    pub async fn fetch(&self, domain: &str) -> SyncResult<Option<Value>> {
        self.inner.fetch(domain).await
    }

    /// Fetch from the server, falling back to the local cache when it is unreachable
    pub async fn load(&self, domain: &str) -> SyncResult<Loaded> {
        match self.inner.fetch(domain).await {
            Ok(payload) => Ok(Loaded {
                payload,
                source: Source::Server,
            }),
            Err(err) if err.category().is_retryable() => {
                warn!(domain, "Server unavailable, using local cache: {err}");
                let cached = self.inner.cache.get(domain).await?;
                let payload = cached.map(|entry| {
                    self.inner
                        .view
                        .insert(domain.to_string(), entry.payload.clone());
                    entry.payload
                });
                Ok(Loaded {
                    payload,
                    source: Source::Cache,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Write locally, then try the server
    ///
    /// If the server cannot be reached the write stays local only and is not
    /// retried; the next successful `save` is what reaches the server.
    pub async fn save(&self, domain: &str, payload: Value) -> SyncResult<SaveOutcome> {
        self.inner.cache.put(domain, &payload).await?;
        self.inner.view.insert(domain.to_string(), payload.clone());

        match self.inner.replace(domain, &payload).await {
            Ok(()) => Ok(SaveOutcome::Synced),
            Err(err) if err.category().is_retryable() => {
                warn!(domain, "Saved locally, not yet synced: {err}");
                Ok(SaveOutcome::SavedLocally)
            }
            Err(err) => Err(err),
        }
    }

    /// Current in-process view of `domain`
    pub fn state(&self, domain: &str) -> Option<Value> {
        self.inner.view.get(domain).map(|v| v.clone())
    }

    /// Last known-good payload from the local cache
    pub async fn cached(&self, domain: &str) -> SyncResult<Option<CachedState>> {
        self.inner.cache.get(domain).await
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn updates(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            let _ = self.events.send(ClientEvent::Connection(state));
        }
    }

    async fn apply(&self, domain: &str, payload: Value, source: Source) {
        self.view.insert(domain.to_string(), payload.clone());
        if let Err(err) = self.cache.put(domain, &payload).await {
            warn!(domain, "Failed to refresh fallback cache: {err}");
        }
        let _ = self.events.send(ClientEvent::StateChanged {
            domain: domain.to_string(),
            payload,
            source,
        });
    }

    async fn fetch(&self, domain: &str) -> SyncResult<Option<Value>> {
        let url = self.config.state_url(domain)?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let body: FetchResponse = response.json().await?;
        if !body.success {
            return Err(SyncError::ServerRejected {
                status: 500,
                message: body.message.unwrap_or_default(),
            });
        }

        if let Some(payload) = &body.state {
            self.apply(domain, payload.clone(), Source::Server).await;
        }
        Ok(body.state)
    }

    async fn replace(&self, domain: &str, payload: &Value) -> SyncResult<()> {
        let url = self.config.state_url(domain)?;
        let response = self.http.post(url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let body: ReplaceResponse = response.json().await?;
        if !body.success {
            return Err(SyncError::ServerRejected {
                status: 500,
                message: body.message.unwrap_or_default(),
            });
        }
        debug!(domain, "State synced to server");
        Ok(())
    }

    /// Refetch every tracked domain after (re)connecting
    async fn resync(&self) {
        for domain in &self.config.domains {
            if let Err(err) = self.fetch(domain).await {
                warn!(domain = %domain, "Resync fetch failed: {err}");
            }
        }
    }

    /// One channel lifetime: connect, resync, pump events until it closes
    async fn connect_once(&self, attempt: u64) -> SyncResult<()> {
        self.set_state(ConnectionState::Connecting);

        let url = self.config.ws_url()?;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

        // The server greets only after registering us, so nothing committed
        // from here on can slip between the resync fetch and the first push
        tokio::time::timeout(self.config.request_timeout, await_greeting(&mut ws))
            .await
            .map_err(|_| SyncError::Transport("no greeting on push channel".to_string()))??;

        self.set_state(ConnectionState::Connected);
        info!(attempt, url = %url, "Push channel connected");

        self.resync().await;

        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Text(text) => self.handle_push(text.as_str()).await,
                Message::Close(frame) => {
                    debug!(?frame, "Push channel closed by server");
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_push(&self, text: &str) {
        match serde_json::from_str::<PushEvent>(text) {
            Ok(PushEvent::StateUpdate { domain, data, .. }) => {
                debug!(domain = %domain, "Received state update");
                self.apply(&domain, data, Source::Push).await;
            }
            Ok(PushEvent::ConnectionEstablished { .. }) | Ok(PushEvent::Pong { .. }) => {}
            Err(err) => warn!("Ignoring unrecognised push frame: {err}"),
        }
    }
}

/// Keep the push channel open until told to stop; retries forever at a fixed delay
async fn run_channel(inner: Arc<ClientInner>, mut stop: watch::Receiver<bool>) {
    let delay = inner.config.reconnect_delay;
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        tokio::select! {
            _ = stopped(&mut stop) => break,
            result = inner.connect_once(attempt) => {
                if let Err(err) = result {
                    debug!(attempt, "Push channel attempt failed: {err}");
                }
            }
        }

        inner.set_state(ConnectionState::Disconnected);
        info!(delay = ?delay, "Push channel lost, reconnecting");

        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.set_state(ConnectionState::Disconnected);
}

async fn await_greeting(ws: &mut PushStream) -> SyncResult<()> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<PushEvent>(text.as_str()) {
                Ok(PushEvent::ConnectionEstablished { message, .. }) => {
                    debug!(message = %message, "Server greeting");
                    return Ok(());
                }
                Ok(other) => debug!(?other, "Push frame before greeting ignored"),
                Err(err) => warn!("Ignoring unrecognised push frame: {err}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(SyncError::Transport(
        "push channel closed before greeting".to_string(),
    ))
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await.map(|_| ());
}

async fn rejection(response: Response) -> SyncError {
    let status = response.status();
    let message = match response.json::<ReplaceResponse>().await {
        Ok(body) => body.message.unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    };
    SyncError::ServerRejected {
        status: status.as_u16(),
        message,
    }
}
