use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::channel::auth::AuthCredentials;
use crate::channel::messages::{parse_server_message, ClientMessage, ServerMessage};
use crate::entity::ChannelError;

/// Default timeout for passive polling requests. User-initiated trade
/// steps pass `None` and wait as long as the user does.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 12_000;

const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Rolling channel statistics for observability.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub messages_received: u64,
    pub unrecognized_messages: u64,
    pub last_message_at_ms: Option<i64>,
    pub last_message_type: Option<&'static str>,
}

type Predicate = Box<dyn Fn(&ServerMessage) -> bool + Send>;

struct Waiter {
    id: u64,
    predicate: Predicate,
    tx: oneshot::Sender<ServerMessage>,
}

/// Matches inbound messages against registered waiters. Correlation is by
/// predicate, not by blocking: concurrent requests interleave freely.
#[derive(Default)]
pub(crate) struct Correlator {
    next_id: u64,
    waiters: Vec<Waiter>,
}

impl Correlator {
    pub(crate) fn register(
        &mut self,
        predicate: Predicate,
    ) -> (u64, oneshot::Receiver<ServerMessage>) {
        let (tx, rx) = oneshot::channel();
        self.next_id += 1;
        let id = self.next_id;
        self.waiters.push(Waiter { id, predicate, tx });
        (id, rx)
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.waiters.retain(|w| w.id != id);
    }

    /// Delivers a message to the first live waiter whose predicate
    /// matches. Returns false when nobody claimed it.
    pub(crate) fn dispatch(&mut self, mut message: ServerMessage) -> bool {
        loop {
            let Some(idx) = self.waiters.iter().position(|w| (w.predicate)(&message)) else {
                return false;
            };
            let waiter = self.waiters.remove(idx);
            match waiter.tx.send(message) {
                Ok(()) => return true,
                // Receiver already gave up (timed out); offer the message
                // to the next matching waiter.
                Err(returned) => message = returned,
            }
        }
    }

    /// Drops every waiter; their receivers observe a closed channel.
    pub(crate) fn fail_all(&mut self) {
        self.waiters.clear();
    }
}

struct ChannelShared {
    open: AtomicBool,
    authed: AtomicBool,
    /// Incremented on every connect so a stale read loop cannot clobber
    /// the state of its successor.
    epoch: AtomicU64,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    correlator: Mutex<Correlator>,
    stats: Mutex<ChannelStats>,
}

/// The authenticated, request/response-correlated message channel to the
/// trading backend.
///
/// The channel never retries a request on its own: a transport failure
/// surfaces to the caller, who may force a fresh `connect()` and retry
/// exactly once. Automatic mid-request reconnection would risk silently
/// duplicating trade-affecting requests.
pub struct TradingChannel {
    url: String,
    credentials: AuthCredentials,
    shared: Arc<ChannelShared>,
}

impl TradingChannel {
    pub fn new(url: impl Into<String>, credentials: AuthCredentials) -> Self {
        Self {
            url: url.into(),
            credentials,
            shared: Arc::new(ChannelShared {
                open: AtomicBool::new(false),
                authed: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                sink: tokio::sync::Mutex::new(None),
                correlator: Mutex::new(Correlator::default()),
                stats: Mutex::new(ChannelStats::default()),
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn is_authed(&self) -> bool {
        self.shared.authed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.stats.lock().unwrap().clone()
    }

    /// Establishes the socket and runs the auth handshake. Any previous
    /// connection is torn down first, failing its in-flight waiters.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.teardown().await;

        let (ws, _response) = connect_async(&self.url)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let (sink, source) = ws.split();

        *self.shared.sink.lock().await = Some(sink);
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.open.store(true, Ordering::SeqCst);

        // Register for the hello before the read loop starts so the
        // greeting cannot slip past.
        let (_hello_id, hello_rx) = self
            .shared
            .correlator
            .lock()
            .unwrap()
            .register(Box::new(|m| matches!(m, ServerMessage::Hello { .. })));

        tokio::spawn(read_loop(Arc::clone(&self.shared), source, epoch));

        let hello = tokio::time::timeout(Duration::from_millis(HANDSHAKE_TIMEOUT_MS), hello_rx)
            .await
            .map_err(|_| ChannelError::Connection("no hello from backend".to_string()))?
            .map_err(|_| ChannelError::Connection("channel closed during handshake".to_string()))?;

        let hello_auth = match hello {
            ServerMessage::Hello { auth } => auth,
            _ => unreachable!("hello waiter only matches hello"),
        };

        let payload = self.credentials.build_reply(&hello_auth).await?;

        let (auth_id, auth_rx) = self.shared.correlator.lock().unwrap().register(Box::new(|m| {
            matches!(
                m,
                ServerMessage::AuthResult { .. } | ServerMessage::Error { .. }
            )
        }));

        if let Err(e) = self.send(&ClientMessage::Auth(payload)).await {
            self.shared.correlator.lock().unwrap().remove(auth_id);
            return Err(e);
        }

        let reply = tokio::time::timeout(Duration::from_millis(HANDSHAKE_TIMEOUT_MS), auth_rx)
            .await
            .map_err(|_| {
                self.shared.correlator.lock().unwrap().remove(auth_id);
                ChannelError::Auth("timed out waiting for auth result".to_string())
            })?
            .map_err(|_| ChannelError::Connection("channel closed during auth".to_string()))?;

        match reply {
            ServerMessage::AuthResult { success: true, .. } => {
                self.shared.authed.store(true, Ordering::SeqCst);
                info!("trading channel authenticated to {}", self.url);
                Ok(())
            }
            ServerMessage::AuthResult {
                success: false,
                message,
            } => Err(ChannelError::Auth(
                message.unwrap_or_else(|| "credentials rejected".to_string()),
            )),
            ServerMessage::Error { code, message } => Err(ChannelError::Auth(format!(
                "[{}] {}",
                code.unwrap_or_else(|| "backend_error".to_string()),
                message.unwrap_or_default()
            ))),
            _ => unreachable!("auth waiter only matches auth_result or error"),
        }
    }

    /// Forces a fresh connection. Used by callers implementing the
    /// retry-once-on-transport policy.
    pub async fn reconnect(&self) -> Result<(), ChannelError> {
        self.connect().await
    }

    /// Sends a correlated request and resolves with the first inbound
    /// message matching `predicate`. With `timeout_ms` set, fails with
    /// `ChannelError::Timeout` once that many milliseconds elapse.
    pub async fn request(
        &self,
        message: ClientMessage,
        predicate: impl Fn(&ServerMessage) -> bool + Send + 'static,
        timeout_ms: Option<u64>,
    ) -> Result<ServerMessage, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotConnected);
        }

        let (id, rx) = self
            .shared
            .correlator
            .lock()
            .unwrap()
            .register(Box::new(predicate));

        if let Err(e) = self.send(&message).await {
            self.shared.correlator.lock().unwrap().remove(id);
            return Err(e);
        }

        match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), rx).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(ChannelError::Connection(
                    "channel closed while awaiting response".to_string(),
                )),
                Err(_) => {
                    self.shared.correlator.lock().unwrap().remove(id);
                    Err(ChannelError::Timeout { after_ms: ms })
                }
            },
            None => rx.await.map_err(|_| {
                ChannelError::Connection("channel closed while awaiting response".to_string())
            }),
        }
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), ChannelError> {
        let json = serde_json::to_string(message)
            .map_err(|e| ChannelError::Malformed(e.to_string()))?;

        let mut guard = self.shared.sink.lock().await;
        let sink = guard.as_mut().ok_or(ChannelError::NotConnected)?;
        sink.send(Message::Text(json))
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))
    }

    async fn teardown(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.authed.store(false, Ordering::SeqCst);

        if let Some(mut sink) = self.shared.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        self.shared.correlator.lock().unwrap().fail_all();
    }
}

#[async_trait::async_trait]
impl crate::pipeline::SwapBackend for TradingChannel {
    async fn fetch_quote(
        &self,
        params: crate::channel::messages::QuoteParams,
    ) -> Result<crate::channel::messages::QuoteResultData, ChannelError> {
        let reply = self
            .request(
                ClientMessage::Quote { params },
                |m| {
                    matches!(
                        m,
                        ServerMessage::QuoteResult { .. } | ServerMessage::Error { .. }
                    )
                },
                Some(DEFAULT_REQUEST_TIMEOUT_MS),
            )
            .await?;

        match reply {
            ServerMessage::QuoteResult {
                success: true,
                data: Some(data),
                ..
            } => Ok(data),
            ServerMessage::QuoteResult {
                success: true,
                data: None,
                ..
            } => Err(ChannelError::Malformed(
                "quote_result carries no data".to_string(),
            )),
            ServerMessage::QuoteResult { error, .. } => Err(ChannelError::Backend {
                code: "quote_failed".to_string(),
                message: error.unwrap_or_default(),
            }),
            ServerMessage::Error { code, message } => Err(ChannelError::Backend {
                code: code.unwrap_or_else(|| "backend_error".to_string()),
                message: message.unwrap_or_default(),
            }),
            other => Err(ChannelError::Malformed(format!(
                "unexpected reply to quote: {}",
                other.type_name()
            ))),
        }
    }

    async fn build_swap_tx(
        &self,
        params: crate::channel::messages::BuildSwapParams,
    ) -> Result<crate::channel::messages::BuildSwapTxResultData, ChannelError> {
        // User-initiated trade step: no request deadline beyond the user's
        // own patience.
        let reply = self
            .request(
                ClientMessage::BuildSwapTx { params },
                |m| {
                    matches!(
                        m,
                        ServerMessage::BuildSwapTxResult { .. } | ServerMessage::Error { .. }
                    )
                },
                None,
            )
            .await?;

        match reply {
            ServerMessage::BuildSwapTxResult {
                success: true,
                data: Some(data),
                ..
            } => Ok(data),
            ServerMessage::BuildSwapTxResult {
                success: true,
                data: None,
                ..
            } => Err(ChannelError::Malformed(
                "build_swap_tx_result carries no data".to_string(),
            )),
            ServerMessage::BuildSwapTxResult { error, .. } => Err(ChannelError::Backend {
                code: "build_failed".to_string(),
                message: error.unwrap_or_default(),
            }),
            ServerMessage::Error { code, message } => Err(ChannelError::Backend {
                code: code.unwrap_or_else(|| "backend_error".to_string()),
                message: message.unwrap_or_default(),
            }),
            other => Err(ChannelError::Malformed(format!(
                "unexpected reply to build_swap_tx: {}",
                other.type_name()
            ))),
        }
    }

    async fn reconnect(&self) -> Result<(), ChannelError> {
        TradingChannel::reconnect(self).await
    }
}

async fn read_loop(shared: Arc<ChannelShared>, mut source: WsSource, epoch: u64) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let message = parse_server_message(&text);

                {
                    let mut stats = shared.stats.lock().unwrap();
                    stats.messages_received += 1;
                    stats.last_message_at_ms = Some(chrono::Utc::now().timestamp_millis());
                    stats.last_message_type = Some(message.type_name());
                    if matches!(message, ServerMessage::Unrecognized) {
                        stats.unrecognized_messages += 1;
                    }
                }

                if matches!(message, ServerMessage::Unrecognized) {
                    warn!("dropping unrecognized backend message ({} bytes)", text.len());
                    continue;
                }

                let delivered = shared.correlator.lock().unwrap().dispatch(message);
                if !delivered {
                    debug!("unsolicited backend message, no waiter matched");
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(frame)) => {
                debug!("backend closed the channel: {:?}", frame);
                break;
            }
            Ok(_) => {
                // Binary frames are outside the contract.
                debug!("ignoring non-text backend frame");
            }
            Err(e) => {
                warn!("trading channel read error: {}", e);
                break;
            }
        }
    }

    // Only the current connection's read loop may mark the channel down.
    if shared.epoch.load(Ordering::SeqCst) == epoch {
        shared.open.store(false, Ordering::SeqCst);
        shared.authed.store(false, Ordering::SeqCst);
        shared.correlator.lock().unwrap().fail_all();
    }
}
