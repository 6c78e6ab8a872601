use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::events::{HardwareEvent, Origin};
use crate::link::LinkState;
use crate::telemetry::Reading;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub link: LinkState,
    pub latest: Option<Reading>,
    pub last_command: Option<CommandRecord>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub command: String,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Command,
    Link,
    Watering,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub link: LinkState,
    pub latest_reading: Option<Reading>,
    pub last_command: Option<CommandRecord>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            link: LinkState::Disconnected,
            latest: None,
            last_command: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Fold one hardware event into the snapshot.
    ///
    /// Stored readings only replace `latest`; at one line every few seconds
    /// they would otherwise flush everything else out of the ring.
    pub fn apply(&mut self, event: &HardwareEvent) {
        match event {
            HardwareEvent::LinkUp => {
                self.link = LinkState::Connected;
                self.push_event(EventKind::Link, "link up".into());
            }
            HardwareEvent::LinkDown { reason } => {
                self.link = LinkState::Disconnected;
                self.push_event(EventKind::Link, format!("link down: {reason}"));
            }
            HardwareEvent::ReadingStored(reading) => {
                self.latest = Some(reading.clone());
            }
            HardwareEvent::ReadingRejected { reason } => {
                self.push_event(EventKind::Reading, format!("rejected: {reason}"));
            }
            HardwareEvent::CommandSent { command } => {
                self.record_command(command.to_string(), true);
                self.push_event(EventKind::Command, command.to_string());
            }
            HardwareEvent::CommandFailed { command, error } => {
                self.record_command(command.to_string(), false);
                self.push_event(EventKind::Error, format!("{command} failed: {error}"));
            }
            HardwareEvent::Watering { seconds, origin } => {
                let who = match origin {
                    Origin::Automation => "automation",
                    Origin::Manual => "manual",
                };
                self.push_event(EventKind::Watering, format!("{who} watering {seconds}s"));
            }
        }
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            link: self.link,
            latest_reading: self.latest.clone(),
            last_command: self.last_command.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn record_command(&mut self, command: String, ok: bool) {
        self.last_command = Some(CommandRecord {
            ts: OffsetDateTime::now_utc(),
            command,
            ok,
        });
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
