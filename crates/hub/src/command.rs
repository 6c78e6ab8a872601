//! Host → device commands and the channel that writes them.
//!
//! Commands are single ASCII lines with no acknowledgement. Any task may
//! hold a [`CommandChannel`]; the link's write lock keeps concurrent sends
//! whole and in arrival order.

use std::fmt;
use tracing::{debug, warn};

use crate::events::{EventBus, HardwareEvent};
use crate::link::{Link, LinkError, LinkState};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Water { seconds: u32 },
    SetSoilThreshold(i64),
    SetFanTemp(f64),
    SetHeaterTemp(f64),
    AutoWater(bool),
    AutoFan(bool),
    AutoHeater(bool),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on_off = |on: bool| if on { "ON" } else { "OFF" };
        match self {
            Command::Water { seconds } => write!(f, "W{seconds}"),
            Command::SetSoilThreshold(v) => write!(f, "SET_SOIL_THRESH:{v}"),
            Command::SetFanTemp(v) => write!(f, "SET_FAN_TEMP:{v:.1}"),
            Command::SetHeaterTemp(v) => write!(f, "SET_HEATER_TEMP:{v:.1}"),
            Command::AutoWater(on) => write!(f, "AUTO_WATER_{}", on_off(*on)),
            Command::AutoFan(on) => write!(f, "AUTO_FAN_{}", on_off(*on)),
            Command::AutoHeater(on) => write!(f, "AUTO_HEATER_{}", on_off(*on)),
        }
    }
}

#[derive(Clone)]
pub struct CommandChannel {
    link: Link,
    events: EventBus,
}

impl CommandChannel {
    pub fn new(link: Link, events: EventBus) -> Self {
        Self { link, events }
    }

    /// Write one command line. Fails fast with `NotConnected` while the
    /// link is down; never retries.
    pub async fn send(&self, command: &Command) -> Result<(), LinkError> {
        if self.link.state() != LinkState::Connected {
            debug!(%command, "command skipped, link not connected");
            self.events.publish(HardwareEvent::CommandFailed {
                command: command.clone(),
                error: LinkError::NotConnected.to_string(),
            });
            return Err(LinkError::NotConnected);
        }

        let line = format!("{command}\n");
        match self.link.write(line.as_bytes()).await {
            Ok(()) => {
                debug!(%command, "command sent");
                self.events.publish(HardwareEvent::CommandSent {
                    command: command.clone(),
                });
                Ok(())
            }
            Err(e) => {
                warn!(%command, error = %e, "command write failed");
                self.events.publish(HardwareEvent::CommandFailed {
                    command: command.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
