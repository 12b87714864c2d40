//! Persistent WebSocket client for the tool-execution bridge.
//!
//! One connection carries every request. Each request registers a one-shot
//! slot in the correlation table keyed by its id; the receive loop resolves
//! slots by id (or, for peers that don't echo ids, by expected message
//! type) and then hands the message to registered handlers.
//!
//! On an unexpected disconnect every outstanding slot is dropped, which
//! rejects its caller with [`BridgeError::ConnectionLost`], and the driver
//! retries the connection with linearly increasing delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use crate::bridge::ToolBridge;
use crate::bridge::error::{BridgeError, Result};
use crate::bridge::protocol::{self, AuthResult, BridgeMessage, BridgeServer, BridgeTool, kind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSource = SplitStream<WsStream>;
type WsSink = SplitSink<WsStream, Message>;

/// Callback for inbound messages.
pub type Handler = Arc<dyn Fn(&BridgeMessage) + Send + Sync>;

/// Identifies a registered handler so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Configuration for the bridge client.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// WebSocket endpoint of the peer.
    pub url: String,
    /// Shared secret for the auth handshake.
    pub secret: Option<SecretString>,
    pub auth_timeout: Duration,
    pub discover_timeout: Duration,
    pub list_tools_timeout: Duration,
    /// Tool invocation window; the longest of the four.
    pub call_timeout: Duration,
    pub max_reconnect_attempts: u32,
    /// Delay unit; attempt `n` waits `n * reconnect_base_delay`.
    pub reconnect_base_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".to_string(),
            secret: None,
            auth_timeout: Duration::from_secs(10),
            discover_timeout: Duration::from_secs(10),
            list_tools_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(120),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnection gave up; an explicit `connect` is required.
    Failed { reason: String },
}

#[derive(Clone)]
struct Endpoint {
    url: String,
    secret: SecretString,
}

struct PendingRequest {
    /// Issue order, used when matching by message type.
    seq: u64,
    /// Message types that may resolve this slot without echoing its id.
    accepts: &'static [&'static str],
    tx: oneshot::Sender<BridgeMessage>,
}

struct HandlerEntry {
    id: HandlerId,
    once: bool,
    handler: Handler,
}

struct Inner {
    config: BridgeConfig,
    endpoint: Mutex<Option<Endpoint>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    handlers: RwLock<HashMap<String, Vec<HandlerEntry>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<BridgeError>>,
    closing: AtomicBool,
    next_seq: AtomicU64,
}

/// Client for the remote tool-execution peer.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<Inner>,
}

impl BridgeClient {
    /// Create a disconnected client.
    pub fn new(config: BridgeConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                endpoint: Mutex::new(None),
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                driver: Mutex::new(None),
                state,
                last_error: Mutex::new(None),
                closing: AtomicBool::new(false),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Connect using the URL and secret from the configuration.
    pub async fn connect_configured(&self) -> Result<()> {
        let secret = self
            .inner
            .config
            .secret
            .clone()
            .ok_or_else(|| BridgeError::AuthFailed("no bridge secret configured".to_string()))?;
        let url = self.inner.config.url.clone();
        self.connect(&url, secret).await
    }

    /// Open the connection and authenticate.
    ///
    /// Any existing connection is closed first.
    pub async fn connect(&self, endpoint: &str, secret: SecretString) -> Result<()> {
        self.disconnect().await;

        let endpoint = Endpoint {
            url: endpoint.to_string(),
            secret,
        };
        self.inner.closing.store(false, Ordering::SeqCst);
        *self.inner.endpoint.lock().await = Some(endpoint.clone());
        self.inner.set_state(ConnectionState::Connecting);

        match self.inner.establish(&endpoint).await {
            Ok(source) => {
                tracing::info!(endpoint = %endpoint.url, "Connected to bridge");
                *self.inner.last_error.lock().await = None;
                self.inner.set_state(ConnectionState::Connected);
                let driver = tokio::spawn(Arc::clone(&self.inner).drive(source));
                *self.inner.driver.lock().await = Some(driver);
                Ok(())
            }
            Err(e) => {
                tracing::error!(endpoint = %endpoint.url, error = %e, "Bridge connection failed");
                *self.inner.last_error.lock().await = Some(e.clone());
                self.inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the connection. Outstanding requests fail with `ConnectionLost`.
    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);

        if let Some(tx) = self.inner.outbound.lock().await.take() {
            let _ = tx.send(Message::Close(None));
        }
        if let Some(driver) = self.inner.driver.lock().await.take() {
            driver.abort();
        }
        self.inner.fail_pending().await;

        if self.state() != ConnectionState::Disconnected {
            tracing::info!("Disconnected from bridge");
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }

    /// Invoke a tool on a peer-side server.
    ///
    /// Never retried here: tool calls may not be idempotent.
    pub async fn call(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let frame = protocol::call_tool(&request_id, server_id, tool_name, &arguments);
        let timeout = timeout.unwrap_or(self.inner.config.call_timeout);

        tracing::debug!(%request_id, server_id, tool_name, "Calling bridge tool");

        let msg = self
            .inner
            .send_request(frame, request_id, &[], timeout, "call_tool")
            .await?;

        if msg.kind() == kind::TOOL_ERROR {
            return Err(BridgeError::ToolFailed {
                tool: tool_name.to_string(),
                message: msg
                    .error_message()
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        if msg.is_error() {
            return Err(remote_error(&msg));
        }
        Ok(msg.get("result").cloned().unwrap_or(Value::Null))
    }

    /// List the servers the peer hosts.
    pub async fn discover(&self) -> Result<Vec<BridgeServer>> {
        let request_id = Uuid::new_v4().to_string();
        let frame = protocol::discover(&request_id);
        let msg = self
            .inner
            .send_request(
                frame,
                request_id,
                &[kind::SERVERS],
                self.inner.config.discover_timeout,
                "discover",
            )
            .await?;

        if msg.is_error() {
            return Err(remote_error(&msg));
        }
        let servers = msg
            .get("servers")
            .or_else(|| msg.body().and_then(|b| b.get("servers")))
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        Ok(serde_json::from_value(servers)?)
    }

    /// List the tools of one peer-side server.
    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<BridgeTool>> {
        let request_id = Uuid::new_v4().to_string();
        let frame = protocol::list_tools(&request_id, server_id);
        let msg = self
            .inner
            .send_request(
                frame,
                request_id,
                &[kind::TOOLS_LIST, kind::TOOLS_ERROR],
                self.inner.config.list_tools_timeout,
                "list_tools",
            )
            .await?;

        if msg.is_error() {
            return Err(remote_error(&msg));
        }
        let tools = msg
            .get("tools")
            .or_else(|| msg.body().and_then(|b| b.get("tools")))
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        Ok(serde_json::from_value(tools)?)
    }

    /// Send an arbitrary request and wait for the message echoing its id.
    ///
    /// A `requestId` is generated when the frame lacks one.
    pub async fn request(&self, mut frame: Value, timeout: Duration) -> Result<BridgeMessage> {
        let obj = frame
            .as_object_mut()
            .ok_or_else(|| BridgeError::Protocol("request must be a JSON object".to_string()))?;
        let request_id = match obj.get("requestId").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                obj.insert("requestId".to_string(), Value::String(id.clone()));
                id
            }
        };
        let operation = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("request")
            .to_string();

        let msg = self
            .inner
            .send_request(frame, request_id, &[], timeout, &operation)
            .await?;
        if msg.is_error() {
            return Err(remote_error(&msg));
        }
        Ok(msg)
    }

    /// Register a handler for a message type (`"*"` for every message).
    pub async fn on(
        &self,
        message_type: &str,
        handler: impl Fn(&BridgeMessage) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner
            .register_handler(message_type, false, Arc::new(handler))
            .await
    }

    /// Resolve with the next message of the given type.
    pub async fn once(&self, message_type: &str) -> oneshot::Receiver<BridgeMessage> {
        let (tx, rx) = oneshot::channel();
        let slot = std::sync::Mutex::new(Some(tx));
        let handler: Handler = Arc::new(move |msg: &BridgeMessage| {
            if let Some(tx) = slot.lock().ok().and_then(|mut guard| guard.take()) {
                let _ = tx.send(msg.clone());
            }
        });
        self.inner
            .register_handler(message_type, true, handler)
            .await;
        rx
    }

    /// Remove a handler. Returns false if it was already gone.
    pub async fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write().await;
        let mut removed = false;
        for entries in handlers.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            removed |= entries.len() != before;
        }
        removed
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.state.borrow(), ConnectionState::Connected)
    }

    /// The most recent connection failure, if any.
    pub async fn last_error(&self) -> Option<BridgeError> {
        self.inner.last_error.lock().await.clone()
    }

    /// Number of requests awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Open the socket, start the writer, and run the auth handshake.
    async fn establish(&self, endpoint: &Endpoint) -> Result<WsSource> {
        let auth_timeout = self.config.auth_timeout;

        let (ws, _) = tokio::time::timeout(auth_timeout, connect_async(endpoint.url.as_str()))
            .await
            .map_err(|_| BridgeError::Timeout {
                operation: "connect".to_string(),
                after: auth_timeout,
            })?
            .map_err(|e| BridgeError::ConnectFailed {
                endpoint: endpoint.url.clone(),
                reason: e.to_string(),
            })?;

        let (sink, mut source) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, rx));

        let auth_id = Uuid::new_v4().to_string();
        let frame = protocol::auth(&auth_id, endpoint.secret.expose_secret());
        tx.send(Message::text(frame.to_string()))
            .map_err(|_| BridgeError::ConnectionLost)?;

        tokio::time::timeout(auth_timeout, await_auth(&mut source, &auth_id))
            .await
            .map_err(|_| BridgeError::Timeout {
                operation: "auth".to_string(),
                after: auth_timeout,
            })??;

        *self.outbound.lock().await = Some(tx);
        Ok(source)
    }

    /// Own the connection until it ends, reconnecting when it drops.
    async fn drive(self: Arc<Self>, source: WsSource) {
        let mut source = source;
        loop {
            self.read_loop(&mut source).await;

            self.outbound.lock().await.take();
            self.fail_pending().await;

            if self.closing.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            tracing::warn!("Bridge connection lost");
            match self.reconnect().await {
                Some(next) => source = next,
                None => return,
            }
        }
    }

    async fn reconnect(&self) -> Option<WsSource> {
        let endpoint = self.endpoint.lock().await.clone()?;
        let max_attempts = self.config.max_reconnect_attempts;
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=max_attempts {
            self.set_state(ConnectionState::Reconnecting { attempt });
            tokio::time::sleep(self.config.reconnect_base_delay * attempt).await;

            if self.closing.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                return None;
            }

            match self.establish(&endpoint).await {
                Ok(source) => {
                    tracing::info!(attempt, "Reconnected to bridge");
                    *self.last_error.lock().await = None;
                    self.set_state(ConnectionState::Connected);
                    return Some(source);
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts, error = %e, "Bridge reconnect attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        let err = BridgeError::ReconnectExhausted {
            attempts: max_attempts,
            last_error,
        };
        tracing::error!(error = %err, "Giving up on bridge connection");
        *self.last_error.lock().await = Some(err.clone());
        self.set_state(ConnectionState::Failed {
            reason: err.to_string(),
        });
        None
    }

    async fn read_loop(&self, source: &mut WsSource) {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => match BridgeMessage::parse(text.as_str()) {
                    Ok(msg) => self.route(msg).await,
                    Err(e) => tracing::warn!(error = %e, "Discarding malformed bridge frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Bridge read failed");
                    break;
                }
            }
        }
    }

    /// Resolve the matching pending request, then run handlers.
    async fn route(&self, msg: BridgeMessage) {
        let resolved = {
            let mut pending = self.pending.lock().await;
            // An id that matches nothing falls back to type matching, like a
            // frame without an id.
            let key = msg
                .correlation_id()
                .filter(|id| pending.contains_key(id))
                .or_else(|| {
                    pending
                        .iter()
                        .filter(|(_, p)| p.accepts.contains(&msg.kind()))
                        .min_by_key(|(_, p)| p.seq)
                        .map(|(id, _)| id.clone())
                });
            key.and_then(|id| pending.remove(&id))
        };

        if let Some(slot) = resolved {
            let _ = slot.tx.send(msg.clone());
        } else {
            tracing::debug!(kind = msg.kind(), "Unsolicited bridge message");
        }

        self.dispatch(&msg).await;
    }

    async fn dispatch(&self, msg: &BridgeMessage) {
        let selected: Vec<Handler> = {
            let mut handlers = self.handlers.write().await;
            let mut selected = Vec::new();
            let mut keys = vec![kind::WILDCARD];
            if msg.kind() != kind::WILDCARD {
                keys.insert(0, msg.kind());
            }
            for key in keys {
                if let Some(entries) = handlers.get_mut(key) {
                    selected.extend(entries.iter().map(|e| Arc::clone(&e.handler)));
                    entries.retain(|e| !e.once);
                }
            }
            selected
        };

        for handler in selected {
            handler(msg);
        }
    }

    async fn register_handler(&self, message_type: &str, once: bool, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_seq.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .write()
            .await
            .entry(message_type.to_string())
            .or_default()
            .push(HandlerEntry { id, once, handler });
        id
    }

    async fn register_pending(
        &self,
        request_id: String,
        accepts: &'static [&'static str],
    ) -> oneshot::Receiver<BridgeMessage> {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .await
            .insert(request_id, PendingRequest { seq, accepts, tx });
        rx
    }

    async fn send_request(
        &self,
        frame: Value,
        request_id: String,
        accepts: &'static [&'static str],
        timeout: Duration,
        operation: &str,
    ) -> Result<BridgeMessage> {
        let rx = self.register_pending(request_id.clone(), accepts).await;

        if let Err(e) = self.send_frame(&frame).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(BridgeError::ConnectionLost),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                tracing::warn!(%request_id, operation, "Bridge request timed out");
                Err(BridgeError::Timeout {
                    operation: operation.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn send_frame(&self, frame: &Value) -> Result<()> {
        let outbound = self.outbound.lock().await;
        let tx = outbound.as_ref().ok_or(BridgeError::NotConnected)?;
        tx.send(Message::text(frame.to_string()))
            .map_err(|_| BridgeError::ConnectionLost)
    }

    /// Drop every pending slot; waiting callers see `ConnectionLost`.
    async fn fail_pending(&self) {
        let dropped = {
            let mut pending = self.pending.lock().await;
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            tracing::warn!(dropped, "Rejected in-flight bridge requests");
        }
    }
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            tracing::debug!(error = %e, "Bridge writer stopped");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn await_auth(source: &mut WsSource, auth_id: &str) -> Result<()> {
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(BridgeError::AuthFailed(e.to_string())),
        };
        let Ok(msg) = BridgeMessage::parse(text.as_str()) else {
            continue;
        };

        match msg.kind() {
            kind::RESPONSE if msg.correlation_id().as_deref() == Some(auth_id) => {
                let result: AuthResult = msg
                    .body()
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or(AuthResult {
                        success: false,
                        message: Some("empty auth response".to_string()),
                    });
                return if result.success {
                    Ok(())
                } else {
                    Err(BridgeError::AuthFailed(
                        result.message.unwrap_or_else(|| "rejected".to_string()),
                    ))
                };
            }
            kind::ERROR => {
                return Err(BridgeError::AuthFailed(
                    msg.error_message()
                        .unwrap_or_else(|| "rejected".to_string()),
                ));
            }
            other => tracing::debug!(kind = other, "Ignoring frame during handshake"),
        }
    }
    Err(BridgeError::AuthFailed(
        "connection closed during handshake".to_string(),
    ))
}

fn remote_error(msg: &BridgeMessage) -> BridgeError {
    BridgeError::Remote(
        msg.error_message()
            .unwrap_or_else(|| format!("{} without details", msg.kind())),
    )
}

#[async_trait]
impl ToolBridge for BridgeClient {
    async fn discover(&self) -> Result<Vec<BridgeServer>> {
        BridgeClient::discover(self).await
    }

    async fn list_tools(&self, server_id: &str) -> Result<Vec<BridgeTool>> {
        BridgeClient::list_tools(self, server_id).await
    }

    async fn call_tool(&self, server_id: &str, tool_name: &str, arguments: Value) -> Result<Value> {
        self.call(server_id, tool_name, arguments, None).await
    }
}
