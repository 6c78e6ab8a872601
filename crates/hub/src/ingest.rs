//! Telemetry ingestor: the only reader of the link.
//!
//! Drives the link state machine, decodes each line and persists the
//! readings. I/O failures close the link and retry after a backoff; decode
//! failures and storage errors are logged and never touch link health.
//!
//! ```text
//! Disconnected ──open ok──▶ Connected ──read line──▶ decode ─▶ store
//!   ▲    │                      │
//!   │  open err                i/o err (Failed)
//!   │    ▼                      ▼
//!   └─ backoff ◀──── close + LinkDown
//! ```

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::app::stop_requested;
use crate::db::Db;
use crate::events::{EventBus, HardwareEvent};
use crate::link::{Link, LinkState};
use crate::telemetry::{self, Reading};

pub struct TelemetryIngestor {
    link: Link,
    db: Db,
    events: EventBus,
    read_timeout: Duration,
    backoff: Duration,
    /// Timestamp of the last stored reading; new readings never go below it.
    last_ts: Option<f64>,
    last_error: Option<String>,
}

impl TelemetryIngestor {
    pub fn new(
        link: Link,
        db: Db,
        events: EventBus,
        read_timeout: Duration,
        backoff: Duration,
    ) -> Self {
        Self {
            link,
            db,
            events,
            read_timeout,
            backoff,
            last_ts: None,
            last_error: None,
        }
    }

    /// Run until `stop` flips to true (or its sender goes away). The link is
    /// closed on the way out. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        self.resume_from_store().await;
        info!(
            read_timeout_ms = self.read_timeout.as_millis() as u64,
            backoff_sec = self.backoff.as_secs_f64(),
            "ingestor started"
        );

        while !stop_requested(&stop) {
            match self.link.state() {
                LinkState::Connected => self.poll_once().await,
                LinkState::Disconnected => match self.link.open().await {
                    Ok(()) => {
                        info!("ingestor: link up");
                        self.events.publish(HardwareEvent::LinkUp);
                    }
                    Err(e) => {
                        warn!(
                            backoff_sec = self.backoff.as_secs_f64(),
                            "ingestor: open failed: {e}"
                        );
                        self.wait_backoff(&mut stop).await;
                    }
                },
                LinkState::Failed => {
                    let reason = self
                        .last_error
                        .take()
                        .unwrap_or_else(|| "link i/o failure".to_string());
                    self.link.close().await;
                    warn!(
                        reason = %reason,
                        backoff_sec = self.backoff.as_secs_f64(),
                        "ingestor: link down, reconnecting after backoff"
                    );
                    self.events.publish(HardwareEvent::LinkDown { reason });
                    self.wait_backoff(&mut stop).await;
                }
            }
        }

        self.link.close().await;
        info!("ingestor stopped");
    }

    /// Seed the timestamp floor from the newest stored reading.
    async fn resume_from_store(&mut self) {
        match self.db.latest_reading().await {
            Ok(latest) => self.last_ts = latest.map(|r| r.timestamp),
            Err(e) => error!("ingestor: latest_reading failed: {e}"),
        }
    }

    async fn poll_once(&mut self) {
        match self.link.read_line(self.read_timeout).await {
            Ok(None) => {}
            Ok(Some(line)) => self.handle_line(&line).await,
            Err(e) => {
                debug!("ingestor: read failed: {e}");
                self.last_error = Some(e.to_string());
            }
        }
    }

    /// Sleep for the backoff, waking early if a stop is requested.
    async fn wait_backoff(&self, stop: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.backoff) => {}
            _ = stop.changed() => {}
        }
    }

    async fn handle_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }

        match telemetry::decode(line) {
            Ok(reading) => self.store(reading).await,
            Err(e) => {
                warn!(line, "ingestor: discarding line: {e}");
                self.events.publish(HardwareEvent::ReadingRejected {
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn store(&mut self, mut reading: Reading) {
        if let Some(prev) = self.last_ts {
            if reading.timestamp < prev {
                reading.timestamp = prev;
            }
        }

        if let Err(e) = self.db.insert_reading(&reading).await {
            error!("ingestor: insert_reading failed, reading dropped: {e:#}");
            return;
        }
        self.last_ts = Some(reading.timestamp);

        debug!(
            soil_avg = reading.soil_avg,
            temp = reading.temperature,
            water_level = reading.water_level,
            "ingestor: reading stored"
        );
        self.events.publish(HardwareEvent::ReadingStored(reading));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
