//! Control protocol between a device and the control server.
//!
//! The protocol is a small set of JSON envelopes carried over a persistent
//! message channel, plus the backoff policy used when that channel drops.
//!
//! ## Message Flow
//!
//! ```text
//! Device                                Server
//!    |                                    |
//!    |======= open ?deviceId&apiKey =====>|  Connection URI identifies device
//!    |                                    |
//!    |-------- status_report ----------->|  Immediately on open
//!    |-------- heartbeat --------------->|  Every heartbeat interval
//!    |<------- heartbeat_ack ------------|
//!    |-------- status_report ----------->|  Every status interval
//!    |                                    |
//!    |<------- force_report -------------|  Server asks for a report now
//!    |-------- status_report ----------->|
//!    |                                    |
//!    |<------- config_update ------------|  New status interval
//!    |                                    |
//!    |-------- status_report (offline) ->|  On explicit disconnect
//! ```
//!
//! ## Message Types
//!
//! | Type            | Direction      | Payload                             |
//! |-----------------|----------------|-------------------------------------|
//! | `heartbeat`     | Device→Server  | deviceId, deviceType, timestamp     |
//! | `status_report` | Device→Server  | status, ipAddress, duration, traffic|
//! | `heartbeat_ack` | Server→Device  | opaque                              |
//! | `force_report`  | Server→Device  | opaque, may be absent               |
//! | `config_update` | Server→Device  | `statusReportInterval` (ms)         |

mod backoff;
mod message;

pub use backoff::BackoffPolicy;
pub use message::{
    ConfigUpdate, ControlMessage, DecodeError, DeviceStatus, HeartbeatData, MessageType,
    StatusReportData, TrafficData,
};

