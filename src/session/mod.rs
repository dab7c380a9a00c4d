//! Persistent control session.
//!
//! ## Lifecycle
//!
//! ```text
//!                 connect()
//!  Disconnected ────────────> Connecting ──Opened──> Connected
//!       ▲  ▲                      │                      │
//!       │  └──── backoff delay ───┼──── Closed ──────────┤
//!       │                         │                      │
//!       └──────────────── disconnect() ──────────────────┘
//! ```
//!
//! While connected, a heartbeat and a status report fire immediately and
//! then on their own periods. The server may request an out-of-band report
//! (`force_report`) or change the status period (`config_update`). A close
//! schedules a reconnect with exponential backoff; `disconnect()` sends a
//! best-effort offline report and cancels everything.
//!
//! ## Example
//!
//! ```rust,ignore
//! use beacon::{Config, SessionClient};
//!
//! let client = SessionClient::builder(Config::from_env()).build()?;
//! client.connect().await;
//! client.update_traffic(1024, 4096);
//! client.disconnect().await;
//! ```

mod client;
mod machine;
mod reporter;

pub use client::{SessionBuilder, SessionClient};
pub use machine::{Effect, Event, SessionMachine, SessionState, SessionStatus};
pub use reporter::Reporter;
