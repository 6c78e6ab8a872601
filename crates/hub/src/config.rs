//! TOML config file loading, environment overrides and validation.
//!
//! Every section is optional; a missing file means all defaults.
//!
//! ```toml
//! db_url = "sqlite:plant.db?mode=rwc"
//!
//! [serial]
//! port = "/dev/ttyACM0"
//! baud_rate = 9600
//!
//! [automation]
//! check_interval_sec = 30
//! cooldown_sec = 60
//! soil_polarity = "higher_is_drier"
//!
//! [settings]          # defaults seeded into the settings table
//! soil_threshold = 340
//! watering_duration = 5
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::settings::PlantSettings;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_url: String,
    pub serial: SerialConfig,
    pub automation: AutomationConfig,
    pub sync: SyncConfig,
    pub settings: PlantSettings,
    pub web: WebConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: "sqlite:plant.db?mode=rwc".to_string(),
            serial: SerialConfig::default(),
            automation: AutomationConfig::default(),
            sync: SyncConfig::default(),
            settings: PlantSettings::default(),
            web: WebConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound on a single `read_line`; also how quickly the ingestor
    /// notices a stop request.
    pub read_timeout_ms: u64,
    pub reconnect_backoff_sec: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 500,
            reconnect_backoff_sec: 5,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_sec)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub check_interval_sec: u64,
    pub cooldown_sec: u64,
    pub soil_polarity: SoilPolarity,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            check_interval_sec: 30,
            cooldown_sec: 60,
            soil_polarity: SoilPolarity::default(),
        }
    }
}

impl AutomationConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_sec)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_sec)
    }
}

/// How raw soil readings map to dryness. Capacitive probes on the stock
/// firmware read higher when drier; this has never been calibrated against
/// hardware, so it stays configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoilPolarity {
    #[default]
    HigherIsDrier,
    LowerIsDrier,
}

impl SoilPolarity {
    /// Strictly drier than `threshold`.
    pub fn is_drier(self, raw: i64, threshold: i64) -> bool {
        match self {
            Self::HigherIsDrier => raw > threshold,
            Self::LowerIsDrier => raw < threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Pause after the link comes up before settings are pushed; the board
    /// resets when the port opens.
    pub settle_delay_ms: u64,
    /// Gap between consecutive settings commands.
    pub command_gap_ms: u64,
    pub queue_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            command_gap_ms: 100,
            queue_depth: 4,
        }
    }
}

impl SyncConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn command_gap(&self) -> Duration {
        Duration::from_millis(self.command_gap_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
    pub max_manual_watering_sec: u32,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_manual_watering_sec: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Overrides + validation
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `SERIAL_PORT`, `BAUD_RATE`, `DB_URL` and `WEB_PORT` from
    /// `lookup` (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("SERIAL_PORT") {
            self.serial.port = port;
        }
        if let Some(baud) = lookup("BAUD_RATE") {
            self.serial.baud_rate = baud
                .trim()
                .parse()
                .with_context(|| format!("BAUD_RATE is not a number: {baud}"))?;
        }
        if let Some(url) = lookup("DB_URL") {
            self.db_url = url;
        }
        if let Some(port) = lookup("WEB_PORT") {
            self.web.port = port
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {port}"))?;
        }
        Ok(())
    }

    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.db_url.trim().is_empty() {
            errors.push("db_url is empty".to_string());
        }

        // ── Serial ─────────────────────────────────────────────
        if self.serial.port.trim().is_empty() {
            errors.push("serial.port is empty".to_string());
        }
        if self.serial.baud_rate == 0 {
            errors.push("serial.baud_rate must be positive".to_string());
        }
        if self.serial.read_timeout_ms == 0 {
            errors.push("serial.read_timeout_ms must be positive".to_string());
        }
        if self.serial.reconnect_backoff_sec == 0 {
            errors.push("serial.reconnect_backoff_sec must be positive".to_string());
        }

        // ── Automation ─────────────────────────────────────────
        if self.automation.check_interval_sec == 0 {
            errors.push("automation.check_interval_sec must be positive".to_string());
        }

        // ── Sync ───────────────────────────────────────────────
        if self.sync.queue_depth == 0 {
            errors.push("sync.queue_depth must be at least 1".to_string());
        }

        // ── Settings defaults ──────────────────────────────────
        if self.settings.watering_duration == 0 {
            errors.push("settings.watering_duration must be at least 1 second".to_string());
        }
        if self.settings.heater_temp_threshold >= self.settings.fan_temp_threshold {
            errors.push(format!(
                "settings.heater_temp_threshold ({}) must be below fan_temp_threshold ({})",
                self.settings.heater_temp_threshold, self.settings.fan_temp_threshold
            ));
        }

        // ── Web ────────────────────────────────────────────────
        if self.web.max_manual_watering_sec == 0 {
            errors.push("web.max_manual_watering_sec must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

pub fn parse(contents: &str) -> Result<Config> {
    toml::from_str(contents).context("failed to parse config")
}

/// Read the config file (defaults if it does not exist), apply environment
/// overrides, and validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        parse(&contents).with_context(|| format!("in {path}"))?
    } else {
        tracing::info!(path, "config file not found, using defaults");
        Config::default()
    };

    config.apply_overrides(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        port = %config.serial.port,
        baud = config.serial.baud_rate,
        db = %config.db_url,
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_gives_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.serial.port, "/dev/ttyACM0");
        assert_eq!(cfg.serial.baud_rate, 9600);
        assert_eq!(cfg.serial.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(cfg.automation.check_interval(), Duration::from_secs(30));
        assert_eq!(cfg.automation.cooldown(), Duration::from_secs(60));
        assert_eq!(cfg.automation.soil_polarity, SoilPolarity::HigherIsDrier);
        assert_eq!(cfg.sync.command_gap(), Duration::from_millis(100));
        assert_eq!(cfg.settings.soil_threshold, 340);
        assert_eq!(cfg.settings.watering_duration, 5);
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_partial_sections() {
        let cfg = parse(
            r#"
db_url = "sqlite::memory:"

[serial]
port = "/dev/ttyUSB0"
baud_rate = 115200

[automation]
soil_polarity = "lower_is_drier"

[settings]
soil_threshold = 500
watering_duration = 8
"#,
        )
        .unwrap();
        assert_eq!(cfg.db_url, "sqlite::memory:");
        assert_eq!(cfg.serial.port, "/dev/ttyUSB0");
        assert_eq!(cfg.serial.baud_rate, 115200);
        // Unspecified fields in a present section keep their defaults.
        assert_eq!(cfg.serial.read_timeout_ms, 500);
        assert_eq!(cfg.automation.soil_polarity, SoilPolarity::LowerIsDrier);
        assert_eq!(cfg.automation.cooldown_sec, 60);
        assert_eq!(cfg.settings.soil_threshold, 500);
        assert_eq!(cfg.settings.watering_duration, 8);
        assert!(cfg.settings.auto_water_enabled);
    }

    #[test]
    fn parse_rejects_unknown_polarity() {
        assert!(parse("[automation]\nsoil_polarity = \"sideways\"").is_err());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = load("/nonexistent/plant-hub/config.toml").unwrap();
        assert_eq!(cfg.settings.soil_threshold, 340);
    }

    // -- Overrides --------------------------------------------------------

    #[test]
    fn env_overrides_applied() {
        let mut cfg = Config::default();
        cfg.apply_overrides(env(&[
            ("SERIAL_PORT", "COM6"),
            ("BAUD_RATE", "115200"),
            ("DB_URL", "sqlite::memory:"),
            ("WEB_PORT", "9000"),
        ]))
        .unwrap();
        assert_eq!(cfg.serial.port, "COM6");
        assert_eq!(cfg.serial.baud_rate, 115200);
        assert_eq!(cfg.db_url, "sqlite::memory:");
        assert_eq!(cfg.web.port, 9000);
    }

    #[test]
    fn env_override_bad_baud_rejected() {
        let mut cfg = Config::default();
        let err = cfg.apply_overrides(env(&[("BAUD_RATE", "fast")])).unwrap_err();
        assert!(format!("{err:#}").contains("BAUD_RATE"));
    }

    #[test]
    fn no_overrides_leaves_config_untouched() {
        let mut cfg = Config::default();
        cfg.apply_overrides(env(&[])).unwrap();
        assert_eq!(cfg.serial.port, "/dev/ttyACM0");
        assert_eq!(cfg.web.port, 8080);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn empty_port_rejected() {
        let mut cfg = Config::default();
        cfg.serial.port = "  ".into();
        assert_validation_err(&cfg, "serial.port is empty");
    }

    #[test]
    fn zero_backoff_rejected() {
        let mut cfg = Config::default();
        cfg.serial.reconnect_backoff_sec = 0;
        assert_validation_err(&cfg, "reconnect_backoff_sec must be positive");
    }

    #[test]
    fn zero_check_interval_rejected() {
        let mut cfg = Config::default();
        cfg.automation.check_interval_sec = 0;
        assert_validation_err(&cfg, "check_interval_sec must be positive");
    }

    #[test]
    fn zero_cooldown_allowed() {
        let mut cfg = Config::default();
        cfg.automation.cooldown_sec = 0;
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_watering_duration_rejected() {
        let mut cfg = Config::default();
        cfg.settings.watering_duration = 0;
        assert_validation_err(&cfg, "watering_duration must be at least 1");
    }

    #[test]
    fn heater_above_fan_rejected() {
        let mut cfg = Config::default();
        cfg.settings.heater_temp_threshold = 30.0;
        assert_validation_err(&cfg, "must be below fan_temp_threshold");
    }

    #[test]
    fn zero_queue_depth_rejected() {
        let mut cfg = Config::default();
        cfg.sync.queue_depth = 0;
        assert_validation_err(&cfg, "queue_depth must be at least 1");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.serial.port = "".into();
        cfg.serial.baud_rate = 0;
        cfg.web.max_manual_watering_sec = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "unexpected: {msg}");
        assert!(msg.contains("serial.port is empty"), "missing port error in: {msg}");
        assert!(msg.contains("baud_rate"), "missing baud error in: {msg}");
        assert!(msg.contains("max_manual_watering_sec"), "missing web error in: {msg}");
    }

    // -- Polarity ---------------------------------------------------------

    #[test]
    fn polarity_comparisons_are_strict() {
        assert!(SoilPolarity::HigherIsDrier.is_drier(341, 340));
        assert!(!SoilPolarity::HigherIsDrier.is_drier(340, 340));
        assert!(SoilPolarity::LowerIsDrier.is_drier(339, 340));
        assert!(!SoilPolarity::LowerIsDrier.is_drier(340, 340));
    }
}
