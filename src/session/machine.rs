//! Session state machine.
//!
//! Pure transition logic: [`SessionMachine::handle`] takes one [`Event`] and
//! returns the [`Effect`]s the driver must apply, in order. No I/O, no
//! clocks, no tasks, so every transition can be exercised with synthetic
//! events.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::protocol::{BackoffPolicy, ControlMessage};
use crate::transport::TransportEvent;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No live connection (initial state)
    Disconnected,
    /// Transport opened, handshake in flight
    Connecting,
    /// Transport open, timers running
    Connected,
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Embedding application asked to connect
    Connect,
    /// Embedding application asked to disconnect
    Disconnect,
    /// Transport handshake completed
    TransportOpened,
    /// Inbound text frame
    TransportMessage(String),
    /// Transport finished
    TransportClosed {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
        /// Whether the peer initiated the close
        remote: bool,
    },
    /// Transport reported a failure
    TransportError(String),
    /// Backoff delay elapsed
    ReconnectDue,
}

impl From<TransportEvent> for Event {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::Opened => Event::TransportOpened,
            TransportEvent::Message(text) => Event::TransportMessage(text),
            TransportEvent::Closed {
                code,
                reason,
                remote,
            } => Event::TransportClosed {
                code,
                reason,
                remote,
            },
            TransportEvent::Error(reason) => Event::TransportError(reason),
        }
    }
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new transport connection
    OpenTransport {
        /// Connection URI
        uri: String,
    },
    /// Close the current connection, optionally announcing offline first
    CloseTransport {
        /// Send a best-effort offline status report before closing
        notify_offline: bool,
    },
    /// Forget the current connection (it already closed)
    ReleaseTransport,
    /// (Re)start the heartbeat timer
    StartHeartbeat {
        /// Heartbeat period
        interval: Duration,
    },
    /// (Re)start the status report timer
    StartStatusTimer {
        /// Report period
        interval: Duration,
        /// Send the connect-time report before the first tick
        announce: bool,
    },
    /// Cancel the heartbeat timer
    StopHeartbeat,
    /// Cancel the status report timer
    StopStatusTimer,
    /// Send one status report now, outside the timer
    ReportStatus,
    /// Fire [`Event::ReconnectDue`] after `delay`
    ScheduleReconnect {
        /// Backoff delay
        delay: Duration,
    },
    /// Drop any pending reconnect
    CancelReconnect,
}

/// Observable session status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Connection state
    pub state: SessionState,
    /// Reconnect attempts since the last successful open
    pub reconnect_attempts: u32,
    /// Heartbeat timer running
    pub heartbeat_active: bool,
    /// Status report timer running
    pub status_timer_active: bool,
    /// A reconnect is scheduled
    pub reconnect_pending: bool,
    /// Current status report period
    pub status_report_interval: Duration,
}

/// Connection lifecycle state machine
#[derive(Debug, Clone)]
pub struct SessionMachine {
    /// Connection URI (server, device id, type, api key)
    uri: String,
    /// Current state
    state: SessionState,
    /// Consecutive reconnect attempts
    reconnect_attempts: u32,
    /// Reconnect give-up threshold
    max_reconnect_attempts: Option<u32>,
    /// A connection handle exists (open or not)
    has_transport: bool,
    heartbeat_active: bool,
    status_timer_active: bool,
    reconnect_pending: bool,
    heartbeat_interval: Duration,
    /// Status period, overridable by `config_update`
    status_interval: Duration,
    max_status_interval: Duration,
    backoff: BackoffPolicy,
}

impl SessionMachine {
    /// Create a disconnected machine for `device_id`
    pub fn new(config: &SessionConfig, device_id: &str) -> Self {
        Self {
            uri: config.connection_uri(device_id),
            state: SessionState::Disconnected,
            reconnect_attempts: 0,
            max_reconnect_attempts: config.max_reconnect_attempts,
            has_transport: false,
            heartbeat_active: false,
            status_timer_active: false,
            reconnect_pending: false,
            heartbeat_interval: config.heartbeat_interval(),
            status_interval: config.status_report_interval(),
            max_status_interval: config.max_status_report_interval(),
            backoff: BackoffPolicy::from_config(config),
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if the session is connected
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Reconnect attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Snapshot for observers
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            heartbeat_active: self.heartbeat_active,
            status_timer_active: self.status_timer_active,
            reconnect_pending: self.reconnect_pending,
            status_report_interval: self.status_interval,
        }
    }

    /// Apply one event and return the effects to execute, in order
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            Event::Connect => self.on_connect(&mut effects),
            Event::ReconnectDue => self.on_reconnect_due(&mut effects),
            Event::TransportOpened => self.on_opened(&mut effects),
            Event::TransportMessage(text) => self.on_message(&text, &mut effects),
            Event::TransportClosed {
                code,
                reason,
                remote,
            } => self.on_closed(code, &reason, remote, &mut effects),
            Event::TransportError(reason) => self.on_error(&reason, &mut effects),
            Event::Disconnect => self.on_disconnect(&mut effects),
        }

        debug_assert!(self.timers_consistent());
        effects
    }

    fn on_connect(&mut self, effects: &mut Vec<Effect>) {
        match self.state {
            SessionState::Connected => debug!("connect() ignored: already connected"),
            SessionState::Connecting => debug!("connect() ignored: handshake in flight"),
            SessionState::Disconnected => {
                if self.reconnect_pending {
                    self.reconnect_pending = false;
                    effects.push(Effect::CancelReconnect);
                }
                self.open(effects);
            },
        }
    }

    fn on_reconnect_due(&mut self, effects: &mut Vec<Effect>) {
        self.reconnect_pending = false;
        if self.state != SessionState::Disconnected {
            debug!(state = ?self.state, "Stale reconnect ignored");
            return;
        }
        info!(attempt = self.reconnect_attempts, "Attempting to reconnect");
        self.open(effects);
    }

    fn open(&mut self, effects: &mut Vec<Effect>) {
        if self.has_transport {
            // Errored connection still waiting for its close event
            effects.push(Effect::CloseTransport {
                notify_offline: false,
            });
        }
        self.state = SessionState::Connecting;
        self.has_transport = true;
        effects.push(Effect::OpenTransport {
            uri: self.uri.clone(),
        });
    }

    fn on_opened(&mut self, effects: &mut Vec<Effect>) {
        if self.state != SessionState::Connecting {
            debug!(state = ?self.state, "Unexpected open event ignored");
            return;
        }

        info!("Session connected");
        self.state = SessionState::Connected;
        self.reconnect_attempts = 0;
        self.heartbeat_active = true;
        self.status_timer_active = true;
        effects.push(Effect::StartHeartbeat {
            interval: self.heartbeat_interval,
        });
        effects.push(Effect::StartStatusTimer {
            interval: self.status_interval,
            announce: true,
        });
    }

    fn on_message(&mut self, text: &str, effects: &mut Vec<Effect>) {
        if self.state != SessionState::Connected {
            debug!(state = ?self.state, "Inbound message dropped while not connected");
            return;
        }

        let message = match decode_inbound(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable control message");
                return;
            },
        };

        match message {
            ControlMessage::HeartbeatAck(_) => {},
            ControlMessage::ForceReport(_) => {
                info!("Server requested a status report");
                effects.push(Effect::ReportStatus);
            },
            ControlMessage::ConfigUpdate(update) => match update.status_report_interval() {
                Some(requested) => {
                    let interval = requested.min(self.max_status_interval);
                    if interval < requested {
                        warn!(
                            requested_ms = requested.as_millis() as u64,
                            cap_ms = interval.as_millis() as u64,
                            "Status report interval capped"
                        );
                    }
                    info!(interval_ms = interval.as_millis() as u64, "Status report interval updated");
                    self.status_interval = interval;
                    self.status_timer_active = true;
                    effects.push(Effect::StartStatusTimer {
                        interval,
                        announce: false,
                    });
                },
                None => debug!(fields = ?update.extra.keys().collect::<Vec<_>>(), "Config update without usable status interval"),
            },
            other => debug!(msg_type = %other.message_type(), "Ignoring valid but unhandled message"),
        }
    }

    fn on_closed(&mut self, code: u16, reason: &str, remote: bool, effects: &mut Vec<Effect>) {
        warn!(code, reason, remote, "Transport closed");

        self.state = SessionState::Disconnected;
        self.stop_timers(effects);
        if self.has_transport {
            self.has_transport = false;
            effects.push(Effect::ReleaseTransport);
        }
        self.schedule_reconnect(effects);
    }

    fn on_error(&mut self, reason: &str, effects: &mut Vec<Effect>) {
        tracing::error!(reason, "Transport error");

        // Reconnect waits for the close event that follows every error
        self.state = SessionState::Disconnected;
        self.stop_timers(effects);
    }

    fn on_disconnect(&mut self, effects: &mut Vec<Effect>) {
        if self.reconnect_pending {
            self.reconnect_pending = false;
            effects.push(Effect::CancelReconnect);
        }
        self.stop_timers(effects);
        if self.has_transport {
            self.has_transport = false;
            effects.push(Effect::CloseTransport {
                notify_offline: true,
            });
        }
        if self.state != SessionState::Disconnected {
            info!("Session disconnected");
        }
        self.state = SessionState::Disconnected;
    }

    fn stop_timers(&mut self, effects: &mut Vec<Effect>) {
        if std::mem::take(&mut self.heartbeat_active) {
            effects.push(Effect::StopHeartbeat);
        }
        if std::mem::take(&mut self.status_timer_active) {
            effects.push(Effect::StopStatusTimer);
        }
    }

    fn schedule_reconnect(&mut self, effects: &mut Vec<Effect>) {
        if let Some(max) = self.max_reconnect_attempts {
            if self.reconnect_attempts >= max {
                warn!(attempts = self.reconnect_attempts, "Reconnect attempts exhausted, giving up");
                return;
            }
        }

        let delay = self.backoff.delay(self.reconnect_attempts);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.reconnect_pending = true;
        info!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        effects.push(Effect::ScheduleReconnect { delay });
    }

    /// Timers run exactly when connected
    fn timers_consistent(&self) -> bool {
        let connected = self.state == SessionState::Connected;
        self.heartbeat_active == connected && self.status_timer_active == connected
    }
}

/// Decode an inbound frame, lifting protocol violations into [`crate::BeaconError::Decode`]
fn decode_inbound(text: &str) -> Result<ControlMessage> {
    Ok(ControlMessage::decode(text)?)
}
