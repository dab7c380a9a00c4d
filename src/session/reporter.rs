//! Outbound reports: heartbeats, status reports and the offline notice.
//!
//! Runs inside timer tasks spawned by the driver, never on the driver
//! itself, so a slow IP lookup only delays its own report.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::error::{BeaconError, Result};
use crate::protocol::ControlMessage;
use crate::telemetry::{lookup_or_unknown, IpLookup, TrafficAccumulator};
use crate::transport::Connection;

/// Builds and sends the device's outbound messages
pub struct Reporter {
    device_id: String,
    device_type: String,
    traffic: Arc<TrafficAccumulator>,
    ip_lookup: Arc<dyn IpLookup>,
    ip_timeout: Duration,
}

impl Reporter {
    /// Create a reporter for one device
    pub fn new(
        device_id: impl Into<String>,
        device_type: impl Into<String>,
        traffic: Arc<TrafficAccumulator>,
        ip_lookup: Arc<dyn IpLookup>,
        ip_timeout: Duration,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: device_type.into(),
            traffic,
            ip_lookup,
            ip_timeout,
        }
    }

    /// Device identifier stamped on every message
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn send(&self, connection: &dyn Connection, message: &ControlMessage) -> Result<()> {
        connection.send(message.encode()?)
    }

    /// Send one heartbeat
    pub fn send_heartbeat(&self, connection: &dyn Connection) -> Result<()> {
        self.send(connection, &ControlMessage::heartbeat(&self.device_id, &self.device_type))
    }

    /// Send one online status report.
    ///
    /// Returns `Ok(false)` when the connection is not open. Traffic is
    /// drained only into a report that was accepted for sending; on a failed
    /// send the drained bytes go back into the accumulator.
    pub async fn report_status(&self, connection: &dyn Connection) -> Result<bool> {
        if !connection.is_open() {
            debug!("Status report skipped: connection not open");
            return Ok(false);
        }

        let ip = lookup_or_unknown(self.ip_lookup.as_ref(), self.ip_timeout).await;

        // The lookup may have outlived the connection
        if !connection.is_open() {
            debug!("Status report skipped: connection closed during IP lookup");
            return Ok(false);
        }

        let snapshot = self.traffic.snapshot_and_reset();
        let report = ControlMessage::online_report(
            &self.device_id,
            &self.device_type,
            ip,
            self.traffic.duration_secs(),
            snapshot.into(),
        );

        match self.send(connection, &report) {
            Ok(()) => {
                debug!(
                    upload = snapshot.upload_bytes,
                    download = snapshot.download_bytes,
                    "Status report sent"
                );
                Ok(true)
            },
            Err(e) => {
                self.traffic.restore(snapshot);
                Err(e)
            },
        }
    }

    /// Best-effort offline notice before a local close
    pub fn send_offline(&self, connection: &dyn Connection) {
        if !connection.is_open() {
            return;
        }
        let notice = ControlMessage::offline_report(&self.device_id, &self.device_type);
        if let Err(e) = self.send(connection, &notice) {
            debug!(error = %e, "Offline report not sent");
        }
    }

    /// Send a status report and log the outcome
    pub async fn report_and_log(&self, connection: &dyn Connection) {
        if let Err(e) = self.report_status(connection).await {
            error!(device_id = %self.device_id, error = %e, "Failed to send status report");
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("device_id", &self.device_id)
            .field("device_type", &self.device_type)
            .field("ip_timeout", &self.ip_timeout)
            .finish_non_exhaustive()
    }
}

/// Heartbeat loop: fires immediately, then every `period`
pub async fn run_heartbeat(reporter: Arc<Reporter>, connection: Arc<dyn Connection>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // Fixed rate: after a stall, resume on the original phase without a burst
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match reporter.send_heartbeat(connection.as_ref()) {
            Ok(()) => debug!("Heartbeat sent"),
            Err(BeaconError::Transport(reason)) => warn!(reason = %reason, "Heartbeat not sent"),
            Err(e) => error!(error = %e, "Failed to build heartbeat"),
        }
    }
}

/// Status loop: optional connect-time report, then a report immediately and
/// every `period` after that
pub async fn run_status_timer(
    reporter: Arc<Reporter>,
    connection: Arc<dyn Connection>,
    period: Duration,
    announce: bool,
) {
    if announce {
        reporter.report_and_log(connection.as_ref()).await;
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        reporter.report_and_log(connection.as_ref()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::StaticIpLookup;
    use crate::transport::{EventSink, MemoryTransport, Transport};
    use serde_json::Value;

    fn reporter(traffic: Arc<TrafficAccumulator>) -> Reporter {
        Reporter::new(
            "android_1",
            "android",
            traffic,
            Arc::new(StaticIpLookup::new("203.0.113.7")),
            Duration::from_secs(5),
        )
    }

    fn open(transport: &MemoryTransport) -> Arc<dyn Connection> {
        transport.open("mem://server", EventSink::new(|_| {})).unwrap()
    }

    fn data(frame: &str) -> Value {
        serde_json::from_str::<Value>(frame).unwrap()["data"].clone()
    }

    #[tokio::test]
    async fn test_report_drains_traffic() {
        let transport = MemoryTransport::auto_accept();
        let conn = open(&transport);
        let traffic = Arc::new(TrafficAccumulator::new());
        let reporter = reporter(Arc::clone(&traffic));

        traffic.add(100, 200);
        assert!(reporter.report_status(conn.as_ref()).await.unwrap());

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        let report = data(&sent[0]);
        assert_eq!(report["status"], "online");
        assert_eq!(report["ipAddress"], "203.0.113.7");
        assert_eq!(report["traffic"]["upload"], 100);
        assert_eq!(report["traffic"]["download"], 200);
        assert!(traffic.read().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_keeps_traffic() {
        let transport = MemoryTransport::auto_accept();
        let conn = open(&transport);
        let traffic = Arc::new(TrafficAccumulator::new());
        let reporter = reporter(Arc::clone(&traffic));

        traffic.add(10, 20);
        transport.set_fail_sends(true);
        assert!(reporter.report_status(conn.as_ref()).await.is_err());
        traffic.add(1, 1);

        transport.set_fail_sends(false);
        reporter.report_status(conn.as_ref()).await.unwrap();
        let report = data(&transport.take_sent()[0]);
        assert_eq!(report["traffic"]["upload"], 11);
        assert_eq!(report["traffic"]["download"], 21);
    }

    #[tokio::test]
    async fn test_report_skipped_when_not_open() {
        let transport = MemoryTransport::new();
        let conn = open(&transport);
        let traffic = Arc::new(TrafficAccumulator::new());
        traffic.add(5, 5);

        assert!(!reporter(Arc::clone(&traffic)).report_status(conn.as_ref()).await.unwrap());
        assert!(transport.sent().is_empty());
        assert_eq!(traffic.read().upload_bytes, 5);
    }

    #[tokio::test]
    async fn test_unknown_ip_fallback() {
        let transport = MemoryTransport::auto_accept();
        let conn = open(&transport);
        let reporter = Reporter::new(
            "android_1",
            "android",
            Arc::new(TrafficAccumulator::new()),
            Arc::new(StaticIpLookup::unavailable()),
            Duration::from_secs(5),
        );

        reporter.report_status(conn.as_ref()).await.unwrap();
        assert_eq!(data(&transport.take_sent()[0])["ipAddress"], "unknown");
    }

    #[tokio::test]
    async fn test_offline_and_heartbeat_frames() {
        let transport = MemoryTransport::auto_accept();
        let conn = open(&transport);
        let reporter = reporter(Arc::new(TrafficAccumulator::new()));

        reporter.send_heartbeat(conn.as_ref()).unwrap();
        reporter.send_offline(conn.as_ref());

        let sent = transport.take_sent();
        let heartbeat: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(heartbeat["type"], "heartbeat");
        assert_eq!(heartbeat["data"]["deviceId"], "android_1");

        let offline = data(&sent[1]);
        assert_eq!(offline["status"], "offline");
        assert!(offline.get("traffic").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cadence() {
        let transport = MemoryTransport::auto_accept();
        let conn = open(&transport);
        let reporter = Arc::new(reporter(Arc::new(TrafficAccumulator::new())));

        let task = tokio::spawn(run_heartbeat(reporter, conn, Duration::from_secs(30)));
        tokio::time::sleep(Duration::from_secs(61)).await;
        task.abort();

        // t=0, t=30, t=60
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_phase_after_stall() {
        let transport = MemoryTransport::auto_accept();
        let conn = open(&transport);
        let reporter = Arc::new(reporter(Arc::new(TrafficAccumulator::new())));

        let task = tokio::spawn(run_heartbeat(reporter, conn, Duration::from_secs(30)));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.take_sent().len(), 1);

        // Jump over the t=30, t=60 and t=90 ticks in one step
        tokio::time::advance(Duration::from_secs(95)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.take_sent().len(), 1, "missed ticks collapse into one");

        // Next tick stays on the 30 s grid (t=120), not 30 s after the stall
        tokio::time::sleep(Duration::from_secs(24)).await;
        assert!(transport.take_sent().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.take_sent().len(), 1);

        task.abort();
    }
}
