use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use rockola_common::QueueItem;

use crate::config::ConnectionConfig;
use crate::metrics::SessionMetrics;
use crate::registration::{RegistrationError, Registrar};

/// Event name carrying a new video request.
pub const PLAY_VIDEO_EVENT: &str = "playVideo";

/// Used until the server handshake announces its own heartbeat.
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(45);

const MAX_FRAME_BYTES: usize = 64 * 1024;

pub type ConnectionResult<T> = Result<T, ConnectionError>;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("{0}")]
    Registration(#[from] RegistrationError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed by server")]
    Closed,
    #[error("timed out: {0}")]
    Timeout(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

impl Handshake {
    /// How long the server may stay silent before the link counts as dead.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

/// One decoded Engine.IO/Socket.IO text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect acknowledged; `sid` is the connection identity.
    Connected { sid: String },
    NamespaceDisconnect,
    ConnectError(String),
    Event { name: String, payload: serde_json::Value },
}

pub fn parse_frame(text: &str) -> ConnectionResult<Frame> {
    let mut chars = text.chars();
    let engine = chars
        .next()
        .ok_or_else(|| ConnectionError::Protocol("empty frame".to_string()))?;
    let rest = chars.as_str();

    match engine {
        '0' => serde_json::from_str(rest)
            .map(Frame::Open)
            .map_err(|e| ConnectionError::Protocol(format!("bad handshake: {}", e))),
        '1' => Ok(Frame::Close),
        '2' => Ok(Frame::Ping),
        '3' => Ok(Frame::Pong),
        '6' => Ok(Frame::Noop),
        '4' => parse_packet(rest),
        other => Err(ConnectionError::Protocol(format!("unknown frame type '{}'", other))),
    }
}

fn parse_packet(packet: &str) -> ConnectionResult<Frame> {
    let mut chars = packet.chars();
    let kind = chars
        .next()
        .ok_or_else(|| ConnectionError::Protocol("empty packet".to_string()))?;
    let body = packet_body(chars.as_str());

    match kind {
        '0' => {
            #[derive(Deserialize)]
            struct Ack {
                sid: String,
            }
            let ack: Ack = serde_json::from_str(body)
                .map_err(|e| ConnectionError::Protocol(format!("bad connect ack: {}", e)))?;
            Ok(Frame::Connected { sid: ack.sid })
        }
        '1' => Ok(Frame::NamespaceDisconnect),
        '2' => {
            let mut args: Vec<serde_json::Value> = serde_json::from_str(body)
                .map_err(|e| ConnectionError::Protocol(format!("bad event: {}", e)))?;
            if args.is_empty() {
                return Err(ConnectionError::Protocol("event without a name".to_string()));
            }
            let name = match args.remove(0) {
                serde_json::Value::String(name) => name,
                other => return Err(ConnectionError::Protocol(format!("event name is not a string: {}", other))),
            };
            let payload = if args.is_empty() {
                serde_json::Value::Null
            } else {
                args.remove(0)
            };
            Ok(Frame::Event { name, payload })
        }
        '3' => Ok(Frame::Noop),
        '4' => {
            let message = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| match v {
                    serde_json::Value::String(s) => Some(s),
                    serde_json::Value::Object(mut o) => o
                        .remove("message")
                        .and_then(|m| m.as_str().map(str::to_string)),
                    _ => None,
                })
                .unwrap_or_else(|| body.to_string());
            Ok(Frame::ConnectError(message))
        }
        other => Err(ConnectionError::Protocol(format!("unknown packet type '{}'", other))),
    }
}

/// Strip an optional `/namespace,` prefix and ack id from a packet body.
fn packet_body(body: &str) -> &str {
    let body = match body.strip_prefix('/') {
        Some(ns) => ns.split_once(',').map_or("", |(_, rest)| rest),
        None => body,
    };
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

/// Websocket URL of the Socket.IO endpoint on `base_url`.
pub fn socket_url(base_url: &str, socket_path: &str) -> ConnectionResult<String> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|e| ConnectionError::Protocol(format!("invalid server URL {}: {}", base_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConnectionError::Protocol(format!("unsupported URL scheme '{}'", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::Protocol(format!("cannot use scheme {} for {}", scheme, base_url)))?;
    url.set_path(&format!("{}/", socket_path.trim_end_matches('/')));
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url.to_string())
}

/// Exponential reconnect delay with jitter.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.checked_pow(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = (delay.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Keeps the station's push channel up for the whole session.
///
/// Each (re)connect yields a fresh connection identity which is registered
/// with the dispatch server before requests are expected to flow. The current
/// identity is published on a watch channel; `None` while disconnected.
pub struct ConnectionManager {
    url: String,
    registrar: Registrar,
    config: ConnectionConfig,
    metrics: Arc<SessionMetrics>,
    identity: watch::Sender<Option<String>>,
}

impl ConnectionManager {
    pub fn new(
        url: String,
        registrar: Registrar,
        config: ConnectionConfig,
        metrics: Arc<SessionMetrics>,
    ) -> (Self, watch::Receiver<Option<String>>) {
        let (identity, identity_rx) = watch::channel(None);
        (
            Self {
                url,
                registrar,
                config,
                metrics,
                identity,
            },
            identity_rx,
        )
    }

    /// Run until cancelled, forwarding every requested item on `items`.
    ///
    /// Whenever a registered session ends, for a lost connection or for
    /// shutdown, the station registration is cleared so the dispatch server
    /// stops routing requests to a dead connection.
    pub async fn run(self, items: mpsc::Sender<QueueItem>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        let mut registered = false;

        loop {
            info!("[SOCKET] Connecting to {}", self.url);
            let result = self.session(&items, &cancel, &mut backoff, &mut registered).await;
            self.identity.send_replace(None);
            if registered {
                self.clear_registration().await;
                registered = false;
            }

            match result {
                Ok(()) => break,
                Err(e) => {
                    warn!("[SOCKET] Connection lost: {}", e);
                    self.metrics.record_error(&e.to_string());
                }
            }

            let delay = backoff.next_delay();
            info!("[SOCKET] Reconnecting in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.metrics.record_reconnect();
        }
        debug!("[SOCKET] Connection manager stopped");
    }

    /// Failures are logged and otherwise ignored.
    async fn clear_registration(&self) {
        match tokio::time::timeout(self.config.register_timeout, self.registrar.deregister()).await {
            Ok(Ok(())) => info!("[SOCKET] Station registration cleared"),
            Ok(Err(e)) => warn!("[SOCKET] Failed to clear registration: {}", e),
            Err(_) => warn!("[SOCKET] Timed out clearing registration"),
        }
    }

    /// One websocket session. `Ok` means cancelled; any error means reconnect.
    /// `registered` is set once the server has accepted this session's identity.
    async fn session(
        &self,
        items: &mpsc::Sender<QueueItem>,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
        registered: &mut bool,
    ) -> ConnectionResult<()> {
        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws_stream, _) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            res = tokio::time::timeout(self.config.register_timeout, connect) => {
                res.map_err(|_| ConnectionError::Timeout("websocket connect"))??
            }
        };
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let mut heartbeat = DEFAULT_HEARTBEAT;
        let deadline = tokio::time::sleep(heartbeat);
        tokio::pin!(deadline);

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
                () = &mut deadline => return Err(ConnectionError::Timeout("server heartbeat")),
                message = ws_rx.next() => match message {
                    Some(message) => message?,
                    None => return Err(ConnectionError::Closed),
                },
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    debug!("[SOCKET] Close frame: {:?}", frame);
                    return Err(ConnectionError::Closed);
                }
                _ => continue,
            };

            if text.len() > MAX_FRAME_BYTES {
                error!("[SOCKET] Ignoring oversized frame with {} bytes", text.len());
                continue;
            }
            trace!("[SOCKET] <- {}", text);

            let frame = match parse_frame(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("[SOCKET] {}", e);
                    continue;
                }
            };

            match frame {
                Frame::Open(handshake) => {
                    heartbeat = handshake.heartbeat();
                    debug!("[SOCKET] Handshake {} (heartbeat {:?})", handshake.sid, heartbeat);
                    deadline.as_mut().reset(tokio::time::Instant::now() + heartbeat);
                    ws_tx.send(Message::Text("40".to_string())).await?;
                }
                Frame::Ping => {
                    deadline.as_mut().reset(tokio::time::Instant::now() + heartbeat);
                    ws_tx.send(Message::Text("3".to_string())).await?;
                }
                Frame::Connected { sid } => {
                    info!("[SOCKET] Connected with id {}", sid);
                    tokio::time::timeout(self.config.register_timeout, self.registrar.register(&sid))
                        .await
                        .map_err(|_| ConnectionError::Timeout("registration"))??;
                    *registered = true;
                    backoff.reset();
                    self.identity.send_replace(Some(sid));
                    info!("[SOCKET] Registered, waiting for requests");
                }
                Frame::Event { name, payload } if name == PLAY_VIDEO_EVENT => {
                    match serde_json::from_value::<QueueItem>(payload) {
                        Ok(item) => {
                            info!("[SOCKET] Request: {} ({})", item.title, item.video_id);
                            if items.send(item).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => warn!("[SOCKET] Malformed {} payload: {}", PLAY_VIDEO_EVENT, e),
                    }
                }
                Frame::Event { name, .. } => debug!("[SOCKET] Ignoring event '{}'", name),
                Frame::ConnectError(message) => {
                    return Err(ConnectionError::Protocol(format!("connect refused: {}", message)));
                }
                Frame::NamespaceDisconnect | Frame::Close => return Err(ConnectionError::Closed),
                Frame::Pong | Frame::Noop => {}
            }
        }
    }
}
