//! Pushing stored settings to the microcontroller.
//!
//! A sync is six commands in a fixed order. Requests go through a small
//! bounded queue with one worker, so a burst of settings edits or a flapping
//! link never stacks up more than a few syncs.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::app::stop_requested;
use crate::command::{Command, CommandChannel};
use crate::db::Db;
use crate::events::HardwareEvent;
use crate::link::LinkError;
use crate::settings::{PlantSettings, Settings};

/// The commands for one sync, in the order the firmware expects them.
pub fn commands_for(s: &PlantSettings) -> [Command; 6] {
    [
        Command::SetSoilThreshold(s.soil_threshold),
        Command::SetFanTemp(s.fan_temp_threshold),
        Command::SetHeaterTemp(s.heater_temp_threshold),
        Command::AutoWater(s.auto_water_enabled),
        Command::AutoFan(s.auto_fan_enabled),
        Command::AutoHeater(s.auto_heater_enabled),
    ]
}

#[derive(Clone)]
pub struct SettingsSync {
    commands: CommandChannel,
    defaults: PlantSettings,
    gap: Duration,
}

impl SettingsSync {
    pub fn new(commands: CommandChannel, defaults: PlantSettings, gap: Duration) -> Self {
        Self {
            commands,
            defaults,
            gap,
        }
    }

    /// Send every setting. Stops at the first failed command; the rest are
    /// not attempted.
    pub async fn sync(&self, settings: &Settings) -> Result<(), LinkError> {
        let resolved = settings.resolve(&self.defaults);
        for (i, command) in commands_for(&resolved).iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.gap).await;
            }
            self.commands.send(command).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    LinkUp,
    SettingsChanged,
}

#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncReason>,
}

impl SyncHandle {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<SyncReason>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    /// Queue a sync without waiting. Returns false when the request was
    /// dropped; a sync already queued will send the latest values anyway.
    pub fn request(&self, reason: SyncReason) -> bool {
        match self.tx.try_send(reason) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(?reason, "sync queue full, request dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(?reason, "sync worker gone, request dropped");
                false
            }
        }
    }
}

/// Drain sync requests one at a time until every handle is dropped.
/// Settings are read fresh from the database for each request.
pub async fn run_worker(sync: SettingsSync, db: Db, mut rx: mpsc::Receiver<SyncReason>) {
    while let Some(reason) = rx.recv().await {
        let settings = match db.get_all_settings().await {
            Ok(s) => s,
            Err(e) => {
                error!(?reason, "sync: get_all_settings failed: {e:#}");
                continue;
            }
        };
        match sync.sync(&settings).await {
            Ok(()) => info!(?reason, "sync: settings pushed to device"),
            Err(e) => warn!(?reason, "sync: aborted: {e}"),
        }
    }
    debug!("sync worker exiting");
}

/// Request a sync `settle` after every `LinkUp`. The board resets when the
/// port opens and drops anything sent before it finishes booting.
pub async fn resync_on_link_up(
    mut events: broadcast::Receiver<HardwareEvent>,
    handle: SyncHandle,
    settle: Duration,
    mut stop: watch::Receiver<bool>,
) {
    while !stop_requested(&stop) {
        let event = tokio::select! {
            ev = events.recv() => ev,
            _ = stop.changed() => continue,
        };
        match event {
            Ok(HardwareEvent::LinkUp) => {
                tokio::select! {
                    _ = tokio::time::sleep(settle) => {}
                    _ = stop.changed() => continue,
                }
                handle.request(SyncReason::LinkUp);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // A LinkUp may have been among the dropped events.
                warn!(missed, "resync trigger lagged, requesting sync");
                handle.request(SyncReason::LinkUp);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::events::EventBus;
    use crate::link::testing::{connected_link, port_pair, TestConnector};
    use crate::link::Link;
    use crate::settings::{AUTO_HEATER, FAN_TEMP, SOIL_THRESHOLD};
    use tokio::time::Instant;

    const GAP: Duration = Duration::from_millis(30);

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn wait_for_lines(dev: &crate::link::testing::Device, n: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let lines = dev.written_lines();
                if lines.len() >= n {
                    return lines;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("device never received the expected commands")
    }

    // -- Command order ------------------------------------------------------

    #[test]
    fn default_commands_in_order() {
        let tokens: Vec<String> = commands_for(&PlantSettings::default())
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            tokens,
            [
                "SET_SOIL_THRESH:340",
                "SET_FAN_TEMP:28.0",
                "SET_HEATER_TEMP:20.0",
                "AUTO_WATER_ON",
                "AUTO_FAN_ON",
                "AUTO_HEATER_ON",
            ]
        );
    }

    // -- sync() -------------------------------------------------------------

    #[tokio::test]
    async fn sync_sends_stored_values_with_gaps() {
        let (link, dev) = connected_link().await;
        let sync = SettingsSync::new(
            CommandChannel::new(link, EventBus::new(16)),
            PlantSettings::default(),
            GAP,
        );

        let started = Instant::now();
        sync.sync(&settings(&[
            (SOIL_THRESHOLD, "500"),
            (FAN_TEMP, "30"),
            (AUTO_HEATER, "off"),
        ]))
        .await
        .unwrap();

        assert!(started.elapsed() >= GAP * 5);
        assert_eq!(
            dev.written_lines(),
            [
                "SET_SOIL_THRESH:500",
                "SET_FAN_TEMP:30.0",
                "SET_HEATER_TEMP:20.0",
                "AUTO_WATER_ON",
                "AUTO_FAN_ON",
                "AUTO_HEATER_OFF",
            ]
        );
    }

    #[tokio::test]
    async fn sync_stops_at_first_failure() {
        let (port, dev) = port_pair();
        let link = Link::new(TestConnector::new(vec![Some(port.fail_after_lines(2))]));
        link.open().await.unwrap();
        let sync = SettingsSync::new(
            CommandChannel::new(link, EventBus::new(16)),
            PlantSettings::default(),
            Duration::ZERO,
        );

        let err = sync.sync(&Settings::default()).await.unwrap_err();
        assert!(matches!(err, LinkError::IoFailure(_)));
        assert_eq!(dev.written_lines().len(), 2);
    }

    #[tokio::test]
    async fn sync_while_disconnected_fails_fast() {
        let link = Link::new(TestConnector::new(vec![]));
        let sync = SettingsSync::new(
            CommandChannel::new(link, EventBus::new(16)),
            PlantSettings::default(),
            GAP,
        );
        let started = Instant::now();
        let err = sync.sync(&Settings::default()).await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
        assert!(started.elapsed() < GAP);
    }

    // -- Queue --------------------------------------------------------------

    #[test]
    fn full_queue_drops_without_blocking() {
        let (handle, _rx) = SyncHandle::channel(2);
        assert!(handle.request(SyncReason::SettingsChanged));
        assert!(handle.request(SyncReason::SettingsChanged));
        assert!(!handle.request(SyncReason::SettingsChanged));
    }

    #[test]
    fn request_after_worker_gone_is_dropped() {
        let (handle, rx) = SyncHandle::channel(2);
        drop(rx);
        assert!(!handle.request(SyncReason::LinkUp));
    }

    #[tokio::test]
    async fn worker_reads_fresh_settings() {
        let db = test_db().await;
        db.seed_settings(&PlantSettings::default()).await.unwrap();
        let (link, dev) = connected_link().await;
        let sync = SettingsSync::new(
            CommandChannel::new(link, EventBus::new(16)),
            PlantSettings::default(),
            Duration::ZERO,
        );
        let (handle, rx) = SyncHandle::channel(4);
        let worker = tokio::spawn(run_worker(sync, db.clone(), rx));

        db.update_settings(&[(SOIL_THRESHOLD, "420")]).await.unwrap();
        assert!(handle.request(SyncReason::SettingsChanged));

        let lines = wait_for_lines(&dev, 6).await;
        assert_eq!(lines[0], "SET_SOIL_THRESH:420");

        drop(handle);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn link_up_triggers_sync_after_settle() {
        let bus = EventBus::new(16);
        let (handle, mut rx) = SyncHandle::channel(4);
        let (stop, stop_rx) = watch::channel(false);
        let settle = Duration::from_millis(80);
        let trigger = tokio::spawn(resync_on_link_up(bus.subscribe(), handle, settle, stop_rx));

        let started = Instant::now();
        bus.publish(HardwareEvent::ReadingRejected {
            reason: "noise".into(),
        });
        bus.publish(HardwareEvent::LinkUp);

        let reason = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, SyncReason::LinkUp);
        assert!(started.elapsed() >= settle);

        stop.send(true).unwrap();
        trigger.await.unwrap();
        // The trigger held the last handle.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_cancels_pending_resync() {
        let bus = EventBus::new(16);
        let (handle, mut rx) = SyncHandle::channel(4);
        let (stop, stop_rx) = watch::channel(false);
        let trigger = tokio::spawn(resync_on_link_up(
            bus.subscribe(),
            handle,
            Duration::from_secs(600),
            stop_rx,
        ));

        bus.publish(HardwareEvent::LinkUp);
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), trigger)
            .await
            .expect("resync trigger did not stop")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }
}
