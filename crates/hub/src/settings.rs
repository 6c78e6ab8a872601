//! Persisted plant settings: the six named values the hub pushes to the
//! board and the automation loop reads.
//!
//! The table stores text. `Settings` is the raw map as it sits in the
//! database; `PlantSettings` is the typed view with fallbacks applied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub const AUTO_WATER: &str = "auto_water_enabled";
pub const AUTO_FAN: &str = "auto_fan_enabled";
pub const AUTO_HEATER: &str = "auto_heater_enabled";
pub const SOIL_THRESHOLD: &str = "soil_threshold";
pub const FAN_TEMP: &str = "fan_temp_threshold";
pub const HEATER_TEMP: &str = "heater_temp_threshold";
pub const WATERING_DURATION: &str = "watering_duration";

pub const KEYS: [&str; 7] = [
    AUTO_WATER,
    AUTO_FAN,
    AUTO_HEATER,
    SOIL_THRESHOLD,
    FAN_TEMP,
    HEATER_TEMP,
    WATERING_DURATION,
];

/// Accepts the spellings a browser form or a hand-edited row might carry.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Check a user-supplied value for `key` and return its stored form.
pub fn normalize(key: &str, raw: &str) -> Result<String, String> {
    let bad = || format!("invalid value for {key}: {raw:?}");
    match key {
        AUTO_WATER | AUTO_FAN | AUTO_HEATER => parse_flag(raw)
            .map(|on| if on { "1" } else { "0" }.to_string())
            .ok_or_else(bad),
        SOIL_THRESHOLD => raw.trim().parse::<i64>().map(|v| v.to_string()).map_err(|_| bad()),
        FAN_TEMP | HEATER_TEMP => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| format!("{v:.1}"))
            .ok_or_else(bad),
        WATERING_DURATION => raw
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .map(|v| v.to_string())
            .ok_or_else(bad),
        _ => Err(format!("unknown setting: {key}")),
    }
}

// ---------------------------------------------------------------------------
// Raw map
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, String>);

impl Settings {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Typed view. Missing or unparseable values fall back to `defaults`.
    pub fn resolve(&self, defaults: &PlantSettings) -> PlantSettings {
        PlantSettings {
            auto_water_enabled: self.typed(AUTO_WATER, defaults.auto_water_enabled, parse_flag),
            auto_fan_enabled: self.typed(AUTO_FAN, defaults.auto_fan_enabled, parse_flag),
            auto_heater_enabled: self.typed(AUTO_HEATER, defaults.auto_heater_enabled, parse_flag),
            soil_threshold: self.typed(SOIL_THRESHOLD, defaults.soil_threshold, |v| {
                v.trim().parse().ok()
            }),
            fan_temp_threshold: self.typed(FAN_TEMP, defaults.fan_temp_threshold, |v| {
                v.trim().parse().ok()
            }),
            heater_temp_threshold: self.typed(HEATER_TEMP, defaults.heater_temp_threshold, |v| {
                v.trim().parse().ok()
            }),
            watering_duration: self.typed(WATERING_DURATION, defaults.watering_duration, |v| {
                v.trim().parse().ok().filter(|s| *s > 0)
            }),
        }
    }

    fn typed<T: Copy + std::fmt::Debug>(
        &self,
        key: &str,
        default: T,
        parse: impl Fn(&str) -> Option<T>,
    ) -> T {
        match self.get(key) {
            None => default,
            Some(raw) => parse(raw).unwrap_or_else(|| {
                warn!(key, value = raw, fallback = ?default, "unparseable setting, using default");
                default
            }),
        }
    }
}

impl FromIterator<(String, String)> for Settings {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Typed view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantSettings {
    pub auto_water_enabled: bool,
    pub auto_fan_enabled: bool,
    pub auto_heater_enabled: bool,
    /// Raw soil value; see `SoilPolarity` for which side is dry.
    pub soil_threshold: i64,
    /// °C at or above which the board runs the fan.
    pub fan_temp_threshold: f64,
    /// °C at or below which the board runs the heater.
    pub heater_temp_threshold: f64,
    /// Seconds per automatic watering.
    pub watering_duration: u32,
}

impl Default for PlantSettings {
    fn default() -> Self {
        Self {
            auto_water_enabled: true,
            auto_fan_enabled: true,
            auto_heater_enabled: true,
            soil_threshold: 340,
            fan_temp_threshold: 28.0,
            heater_temp_threshold: 20.0,
            watering_duration: 5,
        }
    }
}

impl PlantSettings {
    /// Stored text form of every setting, in `KEYS` order.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();
        let values = [
            flag(self.auto_water_enabled),
            flag(self.auto_fan_enabled),
            flag(self.auto_heater_enabled),
            self.soil_threshold.to_string(),
            format!("{:.1}", self.fan_temp_threshold),
            format!("{:.1}", self.heater_temp_threshold),
            self.watering_duration.to_string(),
        ];
        KEYS.into_iter().zip(values).collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
