//! Transport layer abstraction for the session.
//!
//! The session only needs a bidirectional text channel. Backends:
//! - **WebSocket**: `tokio-tungstenite` client, `ws://` and `wss://`
//! - **Memory**: in-process channel where the caller plays the server
//!
//! # Event Contract
//!
//! ```text
//!  open(uri, sink) ──> Ok(connection)
//!                         │
//!                         ├── Opened            (at most once)
//!                         ├── Message(text) *   (only after Opened)
//!                         ├── Error(reason) *   (any time)
//!                         └── Closed{..}        (exactly once, always last)
//! ```
//!
//! Every successful `open` ends with exactly one `Closed` event, including
//! handshake failures and timeouts, so the session can rely on `Closed` as
//! its only reconnect trigger. If `open` itself returns an error, no events
//! are emitted.

mod memory;
mod websocket;

pub use memory::{MemoryConnection, MemoryTransport};
pub use websocket::{WebSocketConnection, WebSocketTransport};

use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Close code used when no close frame was exchanged
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code for a normal, locally requested close
pub const CLOSE_NORMAL: u16 = 1000;

/// Asynchronous notifications from an open connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed; the connection accepts sends
    Opened,
    /// Inbound text frame
    Message(String),
    /// Connection finished
    Closed {
        /// Close code (RFC 6455 numbering)
        code: u16,
        /// Close reason
        reason: String,
        /// Whether the peer initiated the close
        remote: bool,
    },
    /// Non-terminal failure report; a `Closed` event follows
    Error(String),
}

/// Callback target for [`TransportEvent`]s, registered at open time
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl EventSink {
    /// Wrap a callback
    pub fn new(callback: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(callback),
        }
    }

    /// Deliver an event
    pub fn emit(&self, event: TransportEvent) {
        (self.inner)(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// One open (or opening) connection
pub trait Connection: Send + Sync {
    /// Queue a text frame. Never blocks; fails if the connection is not open.
    fn send(&self, text: String) -> Result<()>;

    /// Start closing. Idempotent.
    fn close(&self);

    /// Whether sends are currently accepted
    fn is_open(&self) -> bool;
}

/// Factory for connections.
///
/// Implementations handle the low-level network protocol while the session
/// stays transport-agnostic.
pub trait Transport: Send + Sync {
    /// Begin connecting to `uri`; progress is reported through `events`.
    fn open(&self, uri: &str, events: EventSink) -> Result<Arc<dyn Connection>>;

    /// Get the transport name for logging.
    fn name(&self) -> &'static str;
}
