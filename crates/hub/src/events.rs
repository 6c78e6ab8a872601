//! Typed hardware events.
//!
//! The ingestor, command channel and automation publish here; the status
//! recorder and the resync trigger subscribe. Publishing never blocks: a
//! consumer that falls behind loses the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::command::Command;
use crate::state::SharedState;
use crate::telemetry::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Automation,
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    LinkUp,
    LinkDown { reason: String },
    ReadingStored(Reading),
    ReadingRejected { reason: String },
    CommandSent { command: Command },
    CommandFailed { command: Command, error: String },
    Watering { seconds: u32, origin: Origin },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HardwareEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: HardwareEvent) {
        // Err only means nobody is subscribed right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HardwareEvent> {
        self.tx.subscribe()
    }
}

/// Fold events into the shared status snapshot until the bus closes.
pub async fn record_status(state: SharedState, mut rx: broadcast::Receiver<HardwareEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => state.write().await.apply(&event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "status recorder lagged, events dropped");
                state
                    .write()
                    .await
                    .record_system(format!("{missed} events dropped"));
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("event bus closed, status recorder exiting");
                break;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
