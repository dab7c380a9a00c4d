//! Session handle and driver task.
//!
//! [`SessionClient`] is a cheap, cloneable handle. Every input (API calls,
//! transport events, reconnect wakeups) is funnelled into one channel read
//! by a single driver task, which owns the [`SessionMachine`], the live
//! connection and all timer tasks. Dropping every handle shuts the session
//! down as if [`SessionClient::disconnect`] had been called.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::machine::{Effect, Event, SessionMachine, SessionState, SessionStatus};
use super::reporter::{run_heartbeat, run_status_timer, Reporter};
use crate::config::Config;
use crate::error::{BeaconError, Result};
use crate::identity::{resolve_device_id, DeviceIdStore, FileStore};
use crate::telemetry::{HttpIpLookup, IpLookup, TrafficAccumulator};
use crate::transport::{Connection, EventSink, Transport, TransportEvent, WebSocketTransport, CLOSE_ABNORMAL};

/// API requests acknowledged once the driver applied them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
}

impl From<Command> for Event {
    fn from(command: Command) -> Self {
        match command {
            Command::Connect => Event::Connect,
            Command::Disconnect => Event::Disconnect,
        }
    }
}

/// Everything the driver reacts to
#[derive(Debug)]
enum Input {
    Command(Command, oneshot::Sender<()>),
    Transport { generation: u64, event: TransportEvent },
    ReconnectDue { token: u64 },
}

/// Builder for [`SessionClient`]
pub struct SessionBuilder {
    config: Config,
    device_id: Option<String>,
    store: Option<Arc<dyn DeviceIdStore>>,
    transport: Option<Arc<dyn Transport>>,
    ip_lookup: Option<Arc<dyn IpLookup>>,
    traffic: Option<Arc<TrafficAccumulator>>,
}

impl SessionBuilder {
    /// Start from a configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            device_id: None,
            store: None,
            transport: None,
            ip_lookup: None,
            traffic: None,
        }
    }

    /// Use a fixed device identifier instead of the identity store
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Resolve the device identifier from `store`
    pub fn identity_store(mut self, store: Arc<dyn DeviceIdStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the WebSocket transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the HTTP IP lookup
    pub fn ip_lookup(mut self, ip_lookup: Arc<dyn IpLookup>) -> Self {
        self.ip_lookup = Some(ip_lookup);
        self
    }

    /// Share an existing traffic accumulator
    pub fn traffic(mut self, traffic: Arc<TrafficAccumulator>) -> Self {
        self.traffic = Some(traffic);
        self
    }

    /// Validate, resolve identity and spawn the driver.
    ///
    /// Must be called inside a tokio runtime. The session starts
    /// disconnected.
    pub fn build(self) -> Result<SessionClient> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BeaconError::Config(format!("Session requires a tokio runtime: {e}")))?;

        let session = self.config.session;
        let device_id = match (self.device_id, self.store) {
            (Some(id), _) => id,
            (None, Some(store)) => {
                resolve_device_id(store.as_ref(), &self.config.identity.namespace, &session.device_type)
            },
            (None, None) => {
                let path: PathBuf = self.config.identity.resolved_path();
                resolve_device_id(&FileStore::new(path), &self.config.identity.namespace, &session.device_type)
            },
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(WebSocketTransport::new(session.connect_timeout())),
        };
        let ip_lookup = match self.ip_lookup {
            Some(lookup) => lookup,
            None => Arc::new(HttpIpLookup::new(&self.config.ip_lookup)?),
        };
        let traffic = self.traffic.unwrap_or_default();

        let reporter = Arc::new(Reporter::new(
            device_id.clone(),
            session.device_type.clone(),
            Arc::clone(&traffic),
            ip_lookup,
            self.config.ip_lookup.timeout(),
        ));

        let machine = SessionMachine::new(&session, &device_id);
        let (status_tx, status_rx) = watch::channel(machine.status());
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            machine,
            transport,
            reporter,
            inputs: inputs_tx.downgrade(),
            connection: None,
            generation: 0,
            live_generation: None,
            heartbeat: None,
            status_timer: None,
            reconnect: None,
            reconnect_token: 0,
            status: status_tx,
        };

        info!(device_id = %device_id, transport = driver.transport.name(), "Session created");
        runtime.spawn(driver.run(inputs_rx));

        Ok(SessionClient {
            inputs: inputs_tx,
            status: status_rx,
            traffic,
            device_id: device_id.into(),
        })
    }
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionClient {
    inputs: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<SessionStatus>,
    traffic: Arc<TrafficAccumulator>,
    device_id: Arc<str>,
}

impl SessionClient {
    /// Builder from a configuration
    pub fn builder(config: Config) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Open the connection.
    ///
    /// No-op while connecting or connected. Resolves once the driver has
    /// started the attempt, not when the handshake completes; watch
    /// [`subscribe`](Self::subscribe) for that.
    pub async fn connect(&self) {
        if let Err(e) = self.command(Command::Connect).await {
            error!(error = %e, "connect() failed");
        }
    }

    /// Send a best-effort offline report, close the connection, stop all
    /// timers and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        if let Err(e) = self.command(Command::Disconnect).await {
            debug!(error = %e, "disconnect() on a finished session");
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inputs
            .send(Input::Command(command, ack_tx))
            .map_err(|_| BeaconError::SessionClosed)?;
        ack_rx.await.map_err(|_| BeaconError::SessionClosed)
    }

    /// Record transferred bytes; callable from any thread at any time
    pub fn update_traffic(&self, upload: u64, download: u64) {
        self.traffic.add(upload, download);
    }

    /// Whether the transport is open and timers are running
    pub fn is_connected(&self) -> bool {
        self.status.borrow().state == SessionState::Connected
    }

    /// Latest published status
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Status updates, published after every transition
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Resolved device identifier
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Shared traffic counters
    pub fn traffic(&self) -> &Arc<TrafficAccumulator> {
        &self.traffic
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("device_id", &self.device_id)
            .field("state", &self.status.borrow().state)
            .finish_non_exhaustive()
    }
}

/// Owns every piece of mutable session state
struct Driver {
    machine: SessionMachine,
    transport: Arc<dyn Transport>,
    reporter: Arc<Reporter>,
    /// For event sinks and wakeups; never keeps the session alive
    inputs: mpsc::WeakUnboundedSender<Input>,
    connection: Option<Arc<dyn Connection>>,
    /// Incremented per opened connection
    generation: u64,
    /// Generation whose events are still accepted
    live_generation: Option<u64>,
    heartbeat: Option<JoinHandle<()>>,
    status_timer: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    /// Identifies the one reconnect wakeup that may still fire
    reconnect_token: u64,
    status: watch::Sender<SessionStatus>,
}

impl Driver {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inputs.recv().await {
            match input {
                Input::Command(command, ack) => {
                    self.dispatch(command.into());
                    let _ = ack.send(());
                },
                Input::Transport { generation, event } => {
                    if self.live_generation == Some(generation) {
                        self.dispatch(event.into());
                    } else {
                        debug!(generation, event = ?event, "Dropping event from superseded connection");
                    }
                },
                Input::ReconnectDue { token } => {
                    if token == self.reconnect_token {
                        self.reconnect = None;
                        self.dispatch(Event::ReconnectDue);
                    } else {
                        debug!(token, "Dropping stale reconnect wakeup");
                    }
                },
            }
        }

        debug!("All session handles dropped, shutting down");
        self.dispatch(Event::Disconnect);
    }

    /// Run the machine on `event` and on any events its effects produce
    fn dispatch(&mut self, event: Event) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            for effect in self.machine.handle(event) {
                if let Some(follow_up) = self.apply(effect) {
                    pending.push_back(follow_up);
                }
            }
        }
        self.status.send_replace(self.machine.status());
    }

    fn apply(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::OpenTransport { uri } => return self.open(&uri),
            Effect::CloseTransport { notify_offline } => {
                self.live_generation = None;
                if let Some(connection) = self.connection.take() {
                    if notify_offline {
                        self.reporter.send_offline(connection.as_ref());
                    }
                    connection.close();
                }
            },
            Effect::ReleaseTransport => {
                self.live_generation = None;
                self.connection = None;
            },
            Effect::StartHeartbeat { interval } => {
                abort(&mut self.heartbeat);
                if let Some(connection) = &self.connection {
                    self.heartbeat = Some(tokio::spawn(run_heartbeat(
                        Arc::clone(&self.reporter),
                        Arc::clone(connection),
                        interval,
                    )));
                }
            },
            Effect::StartStatusTimer { interval, announce } => {
                abort(&mut self.status_timer);
                if let Some(connection) = &self.connection {
                    self.status_timer = Some(tokio::spawn(run_status_timer(
                        Arc::clone(&self.reporter),
                        Arc::clone(connection),
                        interval,
                        announce,
                    )));
                }
            },
            Effect::StopHeartbeat => abort(&mut self.heartbeat),
            Effect::StopStatusTimer => abort(&mut self.status_timer),
            Effect::ReportStatus => {
                if let Some(connection) = &self.connection {
                    let reporter = Arc::clone(&self.reporter);
                    let connection = Arc::clone(connection);
                    tokio::spawn(async move { reporter.report_and_log(connection.as_ref()).await });
                }
            },
            Effect::ScheduleReconnect { delay } => self.schedule_reconnect(delay),
            Effect::CancelReconnect => {
                abort(&mut self.reconnect);
                self.reconnect_token = self.reconnect_token.wrapping_add(1);
            },
        }
        None
    }

    fn open(&mut self, uri: &str) -> Option<Event> {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        self.live_generation = Some(generation);

        let inputs = self.inputs.clone();
        let sink = EventSink::new(move |event| {
            if let Some(inputs) = inputs.upgrade() {
                let _ = inputs.send(Input::Transport { generation, event });
            }
        });

        info!(
            device_id = self.reporter.device_id(),
            generation,
            transport = self.transport.name(),
            "Connecting"
        );

        match self.transport.open(uri, sink) {
            Ok(connection) => {
                self.connection = Some(connection);
                None
            },
            Err(e) => {
                error!(error = %e, generation, "Failed to open transport");
                Some(Event::TransportClosed {
                    code: CLOSE_ABNORMAL,
                    reason: e.to_string(),
                    remote: false,
                })
            },
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        abort(&mut self.reconnect);
        self.reconnect_token = self.reconnect_token.wrapping_add(1);
        let token = self.reconnect_token;
        let inputs = self.inputs.clone();

        self.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inputs) = inputs.upgrade() {
                let _ = inputs.send(Input::ReconnectDue { token });
            }
        }));
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        abort(&mut self.heartbeat);
        abort(&mut self.status_timer);
        abort(&mut self.reconnect);
    }
}

fn abort(task: &mut Option<JoinHandle<()>>) {
    if let Some(task) = task.take() {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryStore;
    use crate::telemetry::StaticIpLookup;
    use crate::transport::MemoryTransport;

    fn builder(transport: &MemoryTransport) -> SessionBuilder {
        SessionClient::builder(Config::default())
            .transport(Arc::new(transport.clone()))
            .ip_lookup(Arc::new(StaticIpLookup::new("198.51.100.1")))
            .identity_store(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_build_resolves_identity() {
        let store = Arc::new(MemoryStore::new());
        let transport = MemoryTransport::new();

        let first = builder(&transport).identity_store(store.clone()).build().unwrap();
        let second = builder(&transport).identity_store(store).build().unwrap();
        assert!(first.device_id().starts_with("android_"));
        assert_eq!(first.device_id(), second.device_id());

        let fixed = builder(&transport).device_id("android_fixed").build().unwrap();
        assert_eq!(fixed.device_id(), "android_fixed");
        assert_eq!(fixed.status().state, SessionState::Disconnected);
    }

    #[test]
    fn test_build_requires_runtime() {
        let transport = MemoryTransport::new();
        assert!(matches!(builder(&transport).build(), Err(BeaconError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.session.heartbeat_interval_ms = 0;
        let result = SessionClient::builder(config)
            .transport(Arc::new(MemoryTransport::new()))
            .device_id("x")
            .build();
        assert!(matches!(result, Err(BeaconError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let transport = MemoryTransport::auto_accept();
        let client = builder(&transport).build().unwrap();
        let mut status = client.subscribe();

        client.connect().await;
        status.wait_for(|s| s.state == SessionState::Connected).await.unwrap();
        assert!(client.is_connected());
        assert!(transport
            .last_uri()
            .unwrap()
            .contains(&format!("deviceId={}", client.device_id())));

        client.disconnect().await;
        assert_eq!(client.status().state, SessionState::Disconnected);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_failed_open_schedules_reconnect() {
        let transport = MemoryTransport::new();
        transport.set_refuse_open(true);
        let client = builder(&transport).build().unwrap();

        client.connect().await;
        let status = client.status();
        assert_eq!(status.state, SessionState::Disconnected);
        assert!(status.reconnect_pending);
        assert_eq!(status.reconnect_attempts, 1);

        client.disconnect().await;
        assert!(!client.status().reconnect_pending);
    }

    #[tokio::test]
    async fn test_update_traffic_while_disconnected() {
        let transport = MemoryTransport::new();
        let client = builder(&transport).build().unwrap();
        client.update_traffic(7, 9);
        client.update_traffic(1, 1);
        assert_eq!(client.traffic().read().upload_bytes, 8);
        assert_eq!(client.traffic().read().download_bytes, 10);
    }
}
