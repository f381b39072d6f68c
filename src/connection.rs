//! WebSocket connection manager for a game session.
//!
//! Owns the one live connection: a split sink/stream pair with a reader
//! task forwarding parsed messages over a channel, and a writer guarded
//! behind a mutex so only this module touches the wire. An unexpected
//! close schedules exactly one reconnect attempt after a fixed delay;
//! the timer is an explicit task handle aborted on teardown so no
//! reconnect can fire after an explicit disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::protocol::{ClientMessage, OutboundFrame, ServerMessage};

type WsSink =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection status surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

struct ConnInner {
    ws_url: String,
    reconnect_delay: Duration,
    writer: Mutex<Option<WsSink>>,
    session_id: StdMutex<Option<String>>,
    status_tx: watch::Sender<ConnectionStatus>,
    inbound_tx: mpsc::UnboundedSender<ServerMessage>,
    /// Set by `disconnect()`; suppresses any further reconnects
    closed: AtomicBool,
    reconnect_timer: StdMutex<Option<JoinHandle<()>>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to the session connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnInner>,
}

impl ConnectionManager {
    /// Create a manager plus the channel on which inbound messages are
    /// delivered in arrival order.
    pub fn new(
        ws_url: impl Into<String>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let manager = Self {
            inner: Arc::new(ConnInner {
                ws_url: ws_url.into(),
                reconnect_delay,
                writer: Mutex::new(None),
                session_id: StdMutex::new(None),
                status_tx,
                inbound_tx,
                closed: AtomicBool::new(false),
                reconnect_timer: StdMutex::new(None),
                reader_task: StdMutex::new(None),
            }),
        };
        (manager, inbound_rx)
    }

    /// Open the connection. Errors are not returned: a failed attempt
    /// marks the status disconnected and schedules a retry, exactly like
    /// a mid-session drop.
    pub async fn connect(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
        do_connect(self.inner.clone()).await;
    }

    /// Send one frame, tagged with the session id once known. Fails
    /// silently with a logged error when not connected: outbound frames
    /// are re-derivable from UI state and a drop is not user-visible.
    pub async fn send(&self, message: &ClientMessage) {
        let session_id = self
            .inner
            .session_id
            .lock()
            .expect("session id lock poisoned")
            .clone();
        let frame = OutboundFrame {
            message,
            session_id: session_id.as_deref(),
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize outbound frame: {}", e);
                return;
            }
        };

        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => {
                debug!("📤 Sending frame: {}", json);
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    error!("Failed to send frame: {}", e);
                }
            }
            None => {
                error!("Dropping outbound frame, not connected");
            }
        }
    }

    /// Tear down: close the socket, cancel any pending reconnect timer,
    /// stop the reader. No reconnect fires after this.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(timer) = self
            .inner
            .reconnect_timer
            .lock()
            .expect("reconnect timer lock poisoned")
            .take()
        {
            timer.abort();
        }
        if let Some(reader) = self
            .inner
            .reader_task
            .lock()
            .expect("reader task lock poisoned")
            .take()
        {
            reader.abort();
        }
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.inner
            .status_tx
            .send_replace(ConnectionStatus::Disconnected);
        info!("🔌 Connection torn down");
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Session id adopted from the server, once assigned.
    pub fn session_id(&self) -> Option<String> {
        self.inner
            .session_id
            .lock()
            .expect("session id lock poisoned")
            .clone()
    }
}

async fn do_connect(inner: Arc<ConnInner>) {
    if *inner.status_tx.borrow() == ConnectionStatus::Connected {
        return;
    }
    inner.status_tx.send_replace(ConnectionStatus::Connecting);
    info!("Connecting to game server at {}", inner.ws_url);

    match connect_async(&inner.ws_url).await {
        Ok((ws_stream, _resp)) => {
            let (sink, stream) = ws_stream.split();
            *inner.writer.lock().await = Some(sink);
            inner.status_tx.send_replace(ConnectionStatus::Connected);
            info!("✅ Connected");

            let handle = tokio::spawn(read_loop(inner.clone(), stream));
            *inner
                .reader_task
                .lock()
                .expect("reader task lock poisoned") = Some(handle);
        }
        Err(e) => {
            error!("Connection attempt failed: {}", e);
            inner.status_tx.send_replace(ConnectionStatus::Disconnected);
            schedule_reconnect(&inner);
        }
    }
}

async fn read_loop(inner: Arc<ConnInner>, mut stream: WsStream) {
    debug!("Reader task started");
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => handle_frame(&inner, text.as_str()),
            Ok(Message::Close(frame)) => {
                info!("Server closed the connection: {:?}", frame);
                break;
            }
            Ok(_) => {
                // Ping/pong and binary frames are not part of the protocol
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    inner.writer.lock().await.take();
    inner.status_tx.send_replace(ConnectionStatus::Disconnected);
    if !inner.closed.load(Ordering::SeqCst) {
        schedule_reconnect(&inner);
    }
    debug!("Reader task terminated");
}

fn handle_frame(inner: &Arc<ConnInner>, text: &str) {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            // Protocol errors never kill the connection
            warn!("Ignoring malformed frame: {} ({})", e, text);
            return;
        }
    };

    // Late-binding session affinity: adopt the first id the server sends
    if let Some(sid) = msg.session_id() {
        let mut held = inner.session_id.lock().expect("session id lock poisoned");
        if held.is_none() {
            info!("🆔 Adopted session id {}", sid);
            *held = Some(sid.to_string());
        }
    }

    if inner.inbound_tx.send(msg).is_err() {
        warn!("Inbound channel closed, dropping message");
    }
}

/// Schedule exactly one reconnect attempt after the configured delay.
/// Fixed interval by design; the handle is stored so teardown can cancel
/// a pending attempt.
fn schedule_reconnect(inner: &Arc<ConnInner>) {
    let delay = inner.reconnect_delay;
    info!("🔁 Scheduling reconnect in {:?}", delay);
    let task_inner = inner.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if task_inner.closed.load(Ordering::SeqCst) {
            return;
        }
        do_connect(task_inner.clone()).await;
    });
    let prev = inner
        .reconnect_timer
        .lock()
        .expect("reconnect timer lock poisoned")
        .replace(handle);
    if let Some(prev) = prev {
        prev.abort();
    }
}
