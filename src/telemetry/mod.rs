//! Device metrics reported to the control server.
//!
//! - [`TrafficAccumulator`]: byte counters fed by the data path and drained by
//!   each successful status report
//! - [`IpLookup`]: best-effort public IP resolution, always time-bounded

mod ip;
mod traffic;

pub use ip::{lookup_or_unknown, HttpIpLookup, IpLookup, StaticIpLookup, UNKNOWN_IP};
pub use traffic::{TrafficAccumulator, TrafficSnapshot};
