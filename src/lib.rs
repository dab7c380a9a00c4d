//! # Beacon - Device Control Session Client
//!
//! Keeps a device attached to a control server over a long-lived WebSocket:
//! periodic heartbeats, periodic status reports with traffic totals, and
//! automatic reconnection with bounded exponential backoff.
//!
//! ## Features
//!
//! - **Persistent session**: connect once, survive drops with backoff reconnect
//! - **Status reports**: public IP, session duration, upload/download bytes
//! - **Server control**: `force_report` and `config_update` (report cadence)
//! - **Lossless traffic accounting**: bytes are cleared only by a sent report
//! - **Durable identity**: `<device_type>_<uuid>` minted once and persisted
//!
//! ## Architecture
//!
//! ```text
//!  SessionClient ──commands──┐
//!                            v
//!  Transport events ──> [ driver task ] ──effects──> timers / transport
//!                            │
//!                      SessionMachine (pure)
//!                            │
//!                            └──> watch<SessionStatus>
//! ```
//!
//! All state changes happen on one driver task. The [`SessionMachine`] turns
//! events into effects without touching I/O, so its rules are testable on
//! their own.
//!
//! ### Wire Format
//!
//! Every frame is a JSON envelope `{"type": <tag>, "data": {...}}`:
//!
//! | Type            | Direction      | Purpose                          |
//! |-----------------|----------------|----------------------------------|
//! | `heartbeat`     | Device→Server  | Liveness                         |
//! | `status_report` | Device→Server  | Online/offline, IP, traffic      |
//! | `heartbeat_ack` | Server→Device  | Acknowledgement (ignored)        |
//! | `force_report`  | Server→Device  | Request an immediate report      |
//! | `config_update` | Server→Device  | Change the report cadence        |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use beacon::{Config, SessionClient};
//!
//! #[tokio::main]
//! async fn main() -> beacon::Result<()> {
//!     let config = Config::from_file("beacon.toml")?.with_env();
//!     let client = SessionClient::builder(config).build()?;
//!
//!     client.connect().await;
//!
//!     // From the data path, any thread
//!     client.update_traffic(1_024, 8_192);
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Session client, driver and state machine
//! - [`protocol`]: Control message codec and backoff policy
//! - [`transport`]: WebSocket and in-memory transports
//! - [`telemetry`]: Traffic accumulator and public IP lookup
//! - [`identity`]: Device identifier persistence
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

// Re-exports for convenience
pub use config::{Config, IdentityConfig, IpLookupConfig, SessionConfig};
pub use error::{BeaconError, Result};
pub use identity::{resolve_device_id, DeviceIdStore, FileStore, MemoryStore};
pub use protocol::{BackoffPolicy, ControlMessage, DecodeError, MessageType};
pub use session::{SessionBuilder, SessionClient, SessionMachine, SessionState, SessionStatus};
pub use telemetry::{HttpIpLookup, IpLookup, StaticIpLookup, TrafficAccumulator, TrafficSnapshot};
pub use transport::{Connection, MemoryTransport, Transport, TransportEvent, WebSocketTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
