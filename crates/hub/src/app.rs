//! Process-wide context: configuration plus a handle to every shared
//! collaborator. Cloned into each task instead of reaching for globals.

use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use crate::automation::AutomationController;
use crate::command::CommandChannel;
use crate::config::Config;
use crate::db::Db;
use crate::events::EventBus;
use crate::ingest::TelemetryIngestor;
use crate::link::Link;
use crate::state::{SharedState, SystemState};
use crate::sync::{SettingsSync, SyncHandle};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub db: Db,
    pub link: Link,
    pub commands: CommandChannel,
    pub events: EventBus,
    pub state: SharedState,
    pub sync: SyncHandle,
}

impl AppContext {
    pub fn new(config: Config, db: Db, link: Link, events: EventBus, sync: SyncHandle) -> Self {
        let commands = CommandChannel::new(link.clone(), events.clone());
        Self {
            config: Arc::new(config),
            db,
            link,
            commands,
            events,
            state: Arc::new(RwLock::new(SystemState::new())),
            sync,
        }
    }

    pub fn ingestor(&self) -> TelemetryIngestor {
        TelemetryIngestor::new(
            self.link.clone(),
            self.db.clone(),
            self.events.clone(),
            self.config.serial.read_timeout(),
            self.config.serial.reconnect_backoff(),
        )
    }

    pub fn automation(&self) -> AutomationController {
        AutomationController::new(
            self.db.clone(),
            self.commands.clone(),
            self.events.clone(),
            &self.config.automation,
            self.config.settings.clone(),
        )
    }

    pub fn settings_sync(&self) -> SettingsSync {
        SettingsSync::new(
            self.commands.clone(),
            self.config.settings.clone(),
            self.config.sync.command_gap(),
        )
    }
}

/// True once a stop was sent, or once every sender is gone.
pub fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}
