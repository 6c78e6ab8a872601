//! Automatic watering: a periodic decision over the newest stored reading.
//!
//! The controller only ever issues `W<seconds>`. Fan and heater are run by
//! the firmware itself from the thresholds pushed by settings sync.
//!
//! ```text
//! tick ─▶ cooling down? ─yes─▶ skip
//!              │no
//!              ▼
//!      latest reading? ─none─▶ skip
//!              ▼
//!   enabled, tank full, any probe drier than threshold?
//!              │yes                       │no
//!              ▼                          ▼
//!         send W<n> ──ok──▶ start cool-down      skip
//!              │err
//!              ▼
//!       defer to next tick
//! ```

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::app::stop_requested;
use crate::command::{Command, CommandChannel};
use crate::config::{AutomationConfig, SoilPolarity};
use crate::db::Db;
use crate::events::{EventBus, HardwareEvent, Origin};
use crate::link::LinkError;
use crate::settings::{PlantSettings, WATERING_DURATION};

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    CoolingDown,
    NoReading,
    Disabled,
    TankEmpty,
    SoilOk,
    Watered { seconds: u32 },
    /// A watering was due but the command could not be sent.
    Deferred,
}

pub struct AutomationController {
    db: Db,
    commands: CommandChannel,
    events: EventBus,
    interval: Duration,
    cooldown: Duration,
    polarity: SoilPolarity,
    defaults: PlantSettings,
    last_watering: Option<Instant>,
}

impl AutomationController {
    pub fn new(
        db: Db,
        commands: CommandChannel,
        events: EventBus,
        cfg: &AutomationConfig,
        defaults: PlantSettings,
    ) -> Self {
        Self {
            db,
            commands,
            events,
            interval: cfg.check_interval(),
            cooldown: cfg.cooldown(),
            polarity: cfg.soil_polarity,
            defaults,
            last_watering: None,
        }
    }

    /// Run the decision loop until `stop` flips. Intended to be
    /// `tokio::spawn`-ed from main.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);

        info!(
            interval_sec = self.interval.as_secs(),
            cooldown_sec = self.cooldown.as_secs(),
            polarity = ?self.polarity,
            "automation started"
        );

        while !stop_requested(&stop) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => continue,
            }

            match self.evaluate().await {
                Ok(Decision::Watered { .. }) | Ok(Decision::Deferred) => {}
                Ok(decision) => debug!(?decision, "automation: no action"),
                Err(e) => error!("automation: evaluation failed: {e:#}"),
            }
        }
        info!("automation stopped");
    }

    /// One decision cycle.
    pub async fn evaluate(&mut self) -> Result<Decision> {
        if let Some(at) = self.last_watering {
            if at.elapsed() < self.cooldown {
                return Ok(Decision::CoolingDown);
            }
        }

        let Some(reading) = self.db.latest_reading().await? else {
            return Ok(Decision::NoReading);
        };
        let settings = self.db.get_all_settings().await?.resolve(&self.defaults);

        if !settings.auto_water_enabled {
            return Ok(Decision::Disabled);
        }
        if !reading.water_level {
            return Ok(Decision::TankEmpty);
        }

        let threshold = settings.soil_threshold;
        let dry = reading
            .soil_values()
            .iter()
            .any(|v| self.polarity.is_drier(*v, threshold));
        if !dry {
            return Ok(Decision::SoilOk);
        }

        let seconds = settings.watering_duration;
        info!(
            soil = ?reading.soil_values(),
            threshold,
            seconds,
            "automation: soil dry, watering"
        );

        match self.commands.send(&Command::Water { seconds }).await {
            Ok(()) => {
                self.last_watering = Some(Instant::now());
                self.events.publish(HardwareEvent::Watering {
                    seconds,
                    origin: Origin::Automation,
                });
                Ok(Decision::Watered { seconds })
            }
            Err(e) => {
                warn!("automation: watering deferred: {e}");
                Ok(Decision::Deferred)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Manual watering
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ManualWaterError {
    #[error("no recent reading available")]
    NoReading,
    #[error("water tank is empty")]
    TankEmpty,
    #[error("watering duration must be between 1 and {max} seconds, got {got}")]
    InvalidDuration { got: u32, max: u32 },
    #[error("command channel unavailable")]
    Unavailable(#[source] LinkError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Water now, on request. Refuses without a reading or with an empty tank.
/// An explicit duration must be within `1..=max`; otherwise the stored
/// `watering_duration` is used. Leaves the automation cool-down alone.
pub async fn manual_water(
    db: &Db,
    commands: &CommandChannel,
    events: &EventBus,
    defaults: &PlantSettings,
    requested: Option<u32>,
    max: u32,
) -> Result<u32, ManualWaterError> {
    let reading = db.latest_reading().await?.ok_or(ManualWaterError::NoReading)?;
    if !reading.water_level {
        return Err(ManualWaterError::TankEmpty);
    }

    let seconds = match requested {
        Some(s) if (1..=max).contains(&s) => s,
        Some(s) => return Err(ManualWaterError::InvalidDuration { got: s, max }),
        None => {
            let default = defaults.watering_duration;
            let raw = db.get_setting(WATERING_DURATION, &default.to_string()).await?;
            raw.trim()
                .parse::<u32>()
                .ok()
                .filter(|s| *s > 0)
                .unwrap_or(default)
        }
    };

    commands
        .send(&Command::Water { seconds })
        .await
        .map_err(ManualWaterError::Unavailable)?;

    info!(seconds, "manual watering");
    events.publish(HardwareEvent::Watering {
        seconds,
        origin: Origin::Manual,
    });
    Ok(seconds)
}

// ===========================================================================
// Tests
// ===========================================================================
