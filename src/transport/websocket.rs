//! WebSocket transport using `tokio-tungstenite`.
//!
//! Each connection runs in its own task: handshake (bounded by the connect
//! timeout), then a select loop that forwards queued outbound frames and
//! reports inbound ones. Sends go through an unbounded queue so the caller
//! never waits on the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{Connection, EventSink, Transport, TransportEvent, CLOSE_ABNORMAL, CLOSE_NORMAL};
use crate::error::{BeaconError, Result};

/// How long a local close waits for the peer's close frame
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// WebSocket client transport.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    /// Handshake timeout.
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// Create a transport with the given handshake timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Handshake timeout
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, uri: &str, events: EventSink) -> Result<Arc<dyn Connection>> {
        let request = uri.into_client_request()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BeaconError::Transport(format!("No tokio runtime: {e}")))?;

        let flags = Arc::new(ConnectionFlags::default());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        runtime.spawn(run_connection(
            request,
            self.connect_timeout,
            Arc::clone(&flags),
            outbound_rx,
            events,
        ));

        Ok(Arc::new(WebSocketConnection {
            flags,
            outbound: outbound_tx,
        }))
    }

    fn name(&self) -> &'static str {
        "WebSocket"
    }
}

#[derive(Debug, Default)]
struct ConnectionFlags {
    open: AtomicBool,
    closing: AtomicBool,
}

/// Handle to one WebSocket connection.
///
/// Dropping the last handle closes the connection.
#[derive(Debug)]
pub struct WebSocketConnection {
    flags: Arc<ConnectionFlags>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Connection for WebSocketConnection {
    fn send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(BeaconError::Transport("connection not open".to_string()));
        }
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| BeaconError::Transport("connection task finished".to_string()))
    }

    fn close(&self) {
        if self.flags.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flags.open.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        })));
    }

    fn is_open(&self) -> bool {
        self.flags.open.load(Ordering::SeqCst)
    }
}

enum Exit {
    Local,
    Remote { code: u16, reason: String },
    Failed(String),
}

async fn run_connection(
    request: Request,
    connect_timeout: Duration,
    flags: Arc<ConnectionFlags>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: EventSink,
) {
    let failed = |reason: String| {
        events.emit(TransportEvent::Error(reason.clone()));
        events.emit(TransportEvent::Closed {
            code: CLOSE_ABNORMAL,
            reason,
            remote: false,
        });
    };

    let ws = match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => return failed(format!("WebSocket handshake failed: {e}")),
        Err(_) => {
            return failed(format!(
                "WebSocket handshake timed out after {}ms",
                connect_timeout.as_millis()
            ))
        },
    };

    let (mut sink, mut stream) = ws.split();

    if flags.closing.load(Ordering::SeqCst) {
        let _ = sink.send(Message::Close(None)).await;
        events.emit(TransportEvent::Closed {
            code: CLOSE_NORMAL,
            reason: "closed during handshake".to_string(),
            remote: false,
        });
        return;
    }

    flags.open.store(true, Ordering::SeqCst);
    events.emit(TransportEvent::Opened);

    let exit = loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(message) => {
                    let is_close = matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        break Exit::Failed(format!("WebSocket send failed: {e}"));
                    }
                    if is_close {
                        break Exit::Local;
                    }
                },
                // Every handle was dropped
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break Exit::Local;
                },
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => events.emit(TransportEvent::Message(text)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((1005, String::new()));
                    break Exit::Remote { code, reason };
                },
                Some(Ok(other)) => debug!(kind = ?other, "Ignoring non-text frame"),
                Some(Err(e)) => break Exit::Failed(format!("WebSocket read failed: {e}")),
                None => break Exit::Remote { code: CLOSE_ABNORMAL, reason: "stream ended".to_string() },
            },
        }
    };

    flags.open.store(false, Ordering::SeqCst);

    match exit {
        Exit::Local => {
            // Wait briefly for the peer's close frame so the handshake completes
            let drained = tokio::time::timeout(CLOSE_GRACE, async {
                while let Some(Ok(_)) = stream.next().await {}
            })
            .await;
            if drained.is_err() {
                warn!("Peer did not acknowledge close within {:?}", CLOSE_GRACE);
            }
            events.emit(TransportEvent::Closed {
                code: CLOSE_NORMAL,
                reason: "client disconnect".to_string(),
                remote: false,
            });
        },
        Exit::Remote { code, reason } => {
            // tungstenite queues the close reply; flush it
            let _ = sink.close().await;
            events.emit(TransportEvent::Closed {
                code,
                reason,
                remote: true,
            });
        },
        Exit::Failed(reason) => failed(reason),
    }
}
