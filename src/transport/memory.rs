//! In-process transport.
//!
//! The [`MemoryTransport`] handle doubles as the server end: it accepts or
//! drops connections, pushes inbound messages, and records what the client
//! sent. Clones share state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Connection, EventSink, Transport, TransportEvent, CLOSE_NORMAL};
use crate::error::{BeaconError, Result};

#[derive(Default)]
struct MemoryState {
    /// URIs passed to `open`, in order
    opened: Vec<String>,
    /// Most recent connection
    current: Option<Link>,
    /// Frames accepted from the client, across connections
    sent: Vec<String>,
    /// Emit `Opened` from inside `open`
    auto_accept: bool,
    /// Make every `send` fail
    fail_sends: bool,
    /// Make `open` itself fail
    refuse_open: bool,
}

struct Link {
    events: EventSink,
    open: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

/// In-memory transport; the caller plays the server.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// Transport whose connections stay pending until [`accept`](Self::accept)
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that opens every connection immediately
    pub fn auto_accept() -> Self {
        let transport = Self::new();
        transport.lock().auto_accept = true;
        transport
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_events(&self) -> Option<EventSink> {
        self.lock().current.as_ref().map(|link| link.events.clone())
    }

    /// Number of `open` calls so far
    pub fn open_count(&self) -> usize {
        self.lock().opened.len()
    }

    /// URI of the most recent `open`
    pub fn last_uri(&self) -> Option<String> {
        self.lock().opened.last().cloned()
    }

    /// Complete the pending handshake
    pub fn accept(&self) {
        let events = {
            let state = self.lock();
            match &state.current {
                Some(link) if !link.finished.load(Ordering::SeqCst) => {
                    link.open.store(true, Ordering::SeqCst);
                    Some(link.events.clone())
                },
                _ => None,
            }
        };
        if let Some(events) = events {
            events.emit(TransportEvent::Opened);
        }
    }

    /// Deliver an inbound text frame
    pub fn push(&self, text: impl Into<String>) {
        if let Some(events) = self.current_events() {
            events.emit(TransportEvent::Message(text.into()));
        }
    }

    /// Report a transport error without closing
    pub fn fail(&self, reason: impl Into<String>) {
        if let Some(events) = self.current_events() {
            events.emit(TransportEvent::Error(reason.into()));
        }
    }

    /// Close the current connection from the server side
    pub fn drop_connection(&self, code: u16, reason: impl Into<String>) {
        let events = {
            let state = self.lock();
            match &state.current {
                Some(link) if !link.finished.swap(true, Ordering::SeqCst) => {
                    link.open.store(false, Ordering::SeqCst);
                    Some(link.events.clone())
                },
                _ => None,
            }
        };
        if let Some(events) = events {
            events.emit(TransportEvent::Closed {
                code,
                reason: reason.into(),
                remote: true,
            });
        }
    }

    /// Whether the current connection accepts sends
    pub fn is_open(&self) -> bool {
        self.lock()
            .current
            .as_ref()
            .is_some_and(|link| link.open.load(Ordering::SeqCst))
    }

    /// Frames sent by the client so far
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Drain the sent frames
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Make sends fail (`true`) or succeed again (`false`)
    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Make `open` fail (`true`) or succeed again (`false`)
    pub fn set_refuse_open(&self, refuse: bool) {
        self.lock().refuse_open = refuse;
    }
}

impl Transport for MemoryTransport {
    fn open(&self, uri: &str, events: EventSink) -> Result<Arc<dyn Connection>> {
        let open = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let auto_accept = {
            let mut state = self.lock();
            state.opened.push(uri.to_string());
            if state.refuse_open {
                return Err(BeaconError::Transport(format!("refused to open {uri}")));
            }
            state.current = Some(Link {
                events: events.clone(),
                open: Arc::clone(&open),
                finished: Arc::clone(&finished),
            });
            state.auto_accept
        };

        let connection = Arc::new(MemoryConnection {
            transport: self.clone(),
            events,
            open,
            finished,
        });

        if auto_accept {
            self.accept();
        }

        Ok(connection)
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

/// Client end of a [`MemoryTransport`] connection
pub struct MemoryConnection {
    transport: MemoryTransport,
    events: EventSink,
    open: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl Connection for MemoryConnection {
    fn send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(BeaconError::Transport("connection not open".to_string()));
        }
        let mut state = self.transport.lock();
        if state.fail_sends {
            return Err(BeaconError::Transport("send rejected".to_string()));
        }
        state.sent.push(text);
        Ok(())
    }

    fn close(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.events.emit(TransportEvent::Closed {
            code: CLOSE_NORMAL,
            reason: "client disconnect".to_string(),
            remote: false,
        });
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
